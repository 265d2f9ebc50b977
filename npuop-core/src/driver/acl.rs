use std::ffi::{c_char, c_void, CString};
use std::sync::{Mutex, MutexGuard};

use libloading::Library;

use super::deferred::Deferred;
use super::{
    codes, AttrHandle, BufferData, BufferHandle, DescHandle, DevicePtr, Driver, DriverError,
    Event, OpLaunch, Stream,
};
use crate::attr::AttrValue;
use crate::dtypes::{AclDataType, Format, MemType};
use crate::Error;

type AclError = i32;
type AclPtr = *mut c_void;

const ACL_SUCCESS: AclError = 0;
const ACL_MEM_MALLOC_HUGE_FIRST: i32 = 0;
const ACL_MEMCPY_HOST_TO_DEVICE: i32 = 1;
const ACL_MEMCPY_DEVICE_TO_HOST: i32 = 2;
const ACL_MEMCPY_DEVICE_TO_DEVICE: i32 = 3;
const ACL_ENGINE_SYS: i32 = 0;
const ACL_COMPILE_SYS: i32 = 0;
const ACL_EVENT_RECORDED_STATUS_COMPLETE: i32 = 1;

/// Overrides the path of the runtime library.
pub const LIBRARY_ENV: &str = "NPUOP_ACL_LIBRARY";

type AclInitFn = unsafe extern "C" fn(config: *const c_char) -> AclError;
type AclrtSetDeviceFn = unsafe extern "C" fn(device: i32) -> AclError;
type AclrtMallocFn =
    unsafe extern "C" fn(ptr: *mut AclPtr, size: usize, policy: i32) -> AclError;
type AclrtFreeFn = unsafe extern "C" fn(ptr: AclPtr) -> AclError;
type AclrtMemcpyFn = unsafe extern "C" fn(
    dst: AclPtr,
    dst_max: usize,
    src: *const c_void,
    count: usize,
    kind: i32,
) -> AclError;
type AclrtMemcpyAsyncFn = unsafe extern "C" fn(
    dst: AclPtr,
    dst_max: usize,
    src: *const c_void,
    count: usize,
    kind: i32,
    stream: AclPtr,
) -> AclError;
type AclrtMemsetAsyncFn = unsafe extern "C" fn(
    dst: AclPtr,
    max_count: usize,
    value: i32,
    count: usize,
    stream: AclPtr,
) -> AclError;
type AclCreateTensorDescFn =
    unsafe extern "C" fn(dtype: i32, num_dims: i32, dims: *const i64, format: i32) -> AclPtr;
type AclDestroyTensorDescFn = unsafe extern "C" fn(desc: AclPtr);
type AclSetTensorPlaceMentFn = unsafe extern "C" fn(desc: AclPtr, mem: i32) -> AclError;
type AclSetTensorConstFn =
    unsafe extern "C" fn(desc: AclPtr, data: *mut c_void, length: usize) -> AclError;
type AclSetTensorDescNameFn = unsafe extern "C" fn(desc: AclPtr, name: *const c_char);
type AclCreateDataBufferFn = unsafe extern "C" fn(data: AclPtr, size: usize) -> AclPtr;
type AclDestroyDataBufferFn = unsafe extern "C" fn(buffer: AclPtr) -> AclError;
type AclopCreateAttrFn = unsafe extern "C" fn() -> AclPtr;
type AclopDestroyAttrFn = unsafe extern "C" fn(attr: AclPtr);
type AclopSetAttrIntFn =
    unsafe extern "C" fn(attr: AclPtr, name: *const c_char, v: i64) -> AclError;
type AclopSetAttrFloatFn =
    unsafe extern "C" fn(attr: AclPtr, name: *const c_char, v: f32) -> AclError;
type AclopSetAttrBoolFn =
    unsafe extern "C" fn(attr: AclPtr, name: *const c_char, v: u8) -> AclError;
type AclopSetAttrStringFn =
    unsafe extern "C" fn(attr: AclPtr, name: *const c_char, v: *const c_char) -> AclError;
type AclopSetAttrListIntFn =
    unsafe extern "C" fn(attr: AclPtr, name: *const c_char, n: i32, v: *const i64) -> AclError;
type AclopSetAttrListFloatFn =
    unsafe extern "C" fn(attr: AclPtr, name: *const c_char, n: i32, v: *const f32) -> AclError;
type AclopSetAttrListBoolFn =
    unsafe extern "C" fn(attr: AclPtr, name: *const c_char, n: i32, v: *const u8) -> AclError;
type AclopSetAttrListStringFn = unsafe extern "C" fn(
    attr: AclPtr,
    name: *const c_char,
    n: i32,
    v: *const *const c_char,
) -> AclError;
type AclopSetAttrListListIntFn = unsafe extern "C" fn(
    attr: AclPtr,
    name: *const c_char,
    num_lists: i32,
    num_values: *const i32,
    values: *const *const i64,
) -> AclError;
type AclopCompileAndExecuteFn = unsafe extern "C" fn(
    op_type: *const c_char,
    num_inputs: i32,
    input_desc: *const AclPtr,
    inputs: *const AclPtr,
    num_outputs: i32,
    output_desc: *const AclPtr,
    outputs: *const AclPtr,
    attr: AclPtr,
    engine: i32,
    compile_flag: i32,
    op_path: *const c_char,
    stream: AclPtr,
) -> AclError;
type AclrtCreateStreamFn = unsafe extern "C" fn(stream: *mut AclPtr) -> AclError;
type AclrtDestroyStreamFn = unsafe extern "C" fn(stream: AclPtr) -> AclError;
type AclrtSynchronizeStreamFn = unsafe extern "C" fn(stream: AclPtr) -> AclError;
type AclrtCreateEventFn = unsafe extern "C" fn(event: *mut AclPtr) -> AclError;
type AclrtDestroyEventFn = unsafe extern "C" fn(event: AclPtr) -> AclError;
type AclrtQueryEventStatusFn = unsafe extern "C" fn(event: AclPtr, status: *mut i32) -> AclError;
type AclrtRecordEventFn = unsafe extern "C" fn(event: AclPtr, stream: AclPtr) -> AclError;
type AclrtStreamWaitEventFn = unsafe extern "C" fn(stream: AclPtr, event: AclPtr) -> AclError;

struct AclFns {
    acl_init: AclInitFn,
    set_device: AclrtSetDeviceFn,
    malloc: AclrtMallocFn,
    free: AclrtFreeFn,
    memcpy: AclrtMemcpyFn,
    memcpy_async: AclrtMemcpyAsyncFn,
    memset_async: AclrtMemsetAsyncFn,
    create_tensor_desc: AclCreateTensorDescFn,
    destroy_tensor_desc: AclDestroyTensorDescFn,
    set_tensor_placement: AclSetTensorPlaceMentFn,
    set_tensor_const: AclSetTensorConstFn,
    set_tensor_name: AclSetTensorDescNameFn,
    create_data_buffer: AclCreateDataBufferFn,
    destroy_data_buffer: AclDestroyDataBufferFn,
    create_attr: AclopCreateAttrFn,
    destroy_attr: AclopDestroyAttrFn,
    set_attr_int: AclopSetAttrIntFn,
    set_attr_float: AclopSetAttrFloatFn,
    set_attr_bool: AclopSetAttrBoolFn,
    set_attr_string: AclopSetAttrStringFn,
    set_attr_list_int: AclopSetAttrListIntFn,
    set_attr_list_float: AclopSetAttrListFloatFn,
    set_attr_list_bool: AclopSetAttrListBoolFn,
    set_attr_list_string: AclopSetAttrListStringFn,
    set_attr_list_list_int: AclopSetAttrListListIntFn,
    compile_and_execute: AclopCompileAndExecuteFn,
    create_stream: AclrtCreateStreamFn,
    destroy_stream: AclrtDestroyStreamFn,
    synchronize_stream: AclrtSynchronizeStreamFn,
    create_event: AclrtCreateEventFn,
    destroy_event: AclrtDestroyEventFn,
    query_event_status: AclrtQueryEventStatusFn,
    record_event: AclrtRecordEventFn,
    stream_wait_event: AclrtStreamWaitEventFn,
}

/// The vendor runtime, loaded with `libloading`.
///
/// Device work runs after the enqueuing call returned, so two kinds of memory outlive
/// the call that gave them up:
/// - staged host bytes of an async host to device copy, fenced by an event recorded on
///   the copy's stream;
/// - freed allocations, fenced by an event recorded on every stream the driver knows,
///   since any of them may hold work reading the allocation.
///
/// Fenced entries are released once their events complete. Completion is polled on
/// every free, host to device copy and stream synchronization.
pub struct AclDriver {
    _lib: Library,
    fns: AclFns,
    device_id: i32,
    tracking: Mutex<Tracking>,
}

#[derive(Debug, Default)]
struct Tracking {
    /// Streams created through this driver and not destroyed yet.
    streams: Vec<Stream>,
    /// Fence events whose last record completed.
    idle_events: Vec<Event>,
    freed: Deferred<Event, DevicePtr>,
    staged: Deferred<Event, Vec<u8>>,
}

impl std::fmt::Debug for AclDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclDriver")
            .field("device_id", &self.device_id)
            .finish()
    }
}

fn load_library() -> Result<Library, Error> {
    let candidates = match std::env::var(LIBRARY_ENV) {
        Ok(path) => vec![path],
        Err(_) => vec!["libascendcl.so".to_string()],
    };
    for candidate in &candidates {
        // SAFETY: only opens the library; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(Error::LibraryLoad(format!(
        "failed to load the accelerator runtime (tried {})",
        candidates.join(", ")
    )))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T, Error> {
    // SAFETY: Caller provides the symbol type documented by the runtime headers.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        Error::LibraryLoad(format!(
            "failed to resolve symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check(code: AclError, api: &'static str) -> Result<(), DriverError> {
    if code == ACL_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::new(api, code))
    }
}

fn non_null(ptr: AclPtr, api: &'static str) -> Result<usize, DriverError> {
    if ptr.is_null() {
        Err(DriverError::new(api, codes::INTERNAL))
    } else {
        Ok(ptr as usize)
    }
}

fn c_string(value: &str, api: &'static str) -> Result<CString, DriverError> {
    CString::new(value)
        .map_err(|_| DriverError::with_detail(api, codes::INVALID_PARAM, "string contains NUL"))
}

fn stream_ptr(stream: Stream) -> AclPtr {
    stream.0 as AclPtr
}

impl AclDriver {
    /// Loads the runtime, initializes it and binds `device_id` to the calling thread.
    pub fn new(device_id: i32) -> Result<Self, Error> {
        let lib = load_library()?;
        let fns = AclFns {
            acl_init: load_symbol(&lib, b"aclInit\0")?,
            set_device: load_symbol(&lib, b"aclrtSetDevice\0")?,
            malloc: load_symbol(&lib, b"aclrtMalloc\0")?,
            free: load_symbol(&lib, b"aclrtFree\0")?,
            memcpy: load_symbol(&lib, b"aclrtMemcpy\0")?,
            memcpy_async: load_symbol(&lib, b"aclrtMemcpyAsync\0")?,
            memset_async: load_symbol(&lib, b"aclrtMemsetAsync\0")?,
            create_tensor_desc: load_symbol(&lib, b"aclCreateTensorDesc\0")?,
            destroy_tensor_desc: load_symbol(&lib, b"aclDestroyTensorDesc\0")?,
            set_tensor_placement: load_symbol(&lib, b"aclSetTensorPlaceMent\0")?,
            set_tensor_const: load_symbol(&lib, b"aclSetTensorConst\0")?,
            set_tensor_name: load_symbol(&lib, b"aclSetTensorDescName\0")?,
            create_data_buffer: load_symbol(&lib, b"aclCreateDataBuffer\0")?,
            destroy_data_buffer: load_symbol(&lib, b"aclDestroyDataBuffer\0")?,
            create_attr: load_symbol(&lib, b"aclopCreateAttr\0")?,
            destroy_attr: load_symbol(&lib, b"aclopDestroyAttr\0")?,
            set_attr_int: load_symbol(&lib, b"aclopSetAttrInt\0")?,
            set_attr_float: load_symbol(&lib, b"aclopSetAttrFloat\0")?,
            set_attr_bool: load_symbol(&lib, b"aclopSetAttrBool\0")?,
            set_attr_string: load_symbol(&lib, b"aclopSetAttrString\0")?,
            set_attr_list_int: load_symbol(&lib, b"aclopSetAttrListInt\0")?,
            set_attr_list_float: load_symbol(&lib, b"aclopSetAttrListFloat\0")?,
            set_attr_list_bool: load_symbol(&lib, b"aclopSetAttrListBool\0")?,
            set_attr_list_string: load_symbol(&lib, b"aclopSetAttrListString\0")?,
            set_attr_list_list_int: load_symbol(&lib, b"aclopSetAttrListListInt\0")?,
            compile_and_execute: load_symbol(&lib, b"aclopCompileAndExecute\0")?,
            create_stream: load_symbol(&lib, b"aclrtCreateStream\0")?,
            destroy_stream: load_symbol(&lib, b"aclrtDestroyStream\0")?,
            synchronize_stream: load_symbol(&lib, b"aclrtSynchronizeStream\0")?,
            create_event: load_symbol(&lib, b"aclrtCreateEvent\0")?,
            destroy_event: load_symbol(&lib, b"aclrtDestroyEvent\0")?,
            query_event_status: load_symbol(&lib, b"aclrtQueryEventStatus\0")?,
            record_event: load_symbol(&lib, b"aclrtRecordEvent\0")?,
            stream_wait_event: load_symbol(&lib, b"aclrtStreamWaitEvent\0")?,
        };

        // SAFETY: a null config path is accepted by aclInit.
        unsafe {
            check((fns.acl_init)(std::ptr::null()), "aclInit")?;
            check((fns.set_device)(device_id), "aclrtSetDevice")?;
        }
        tracing::info!(device_id, "accelerator runtime initialized");
        Ok(Self {
            _lib: lib,
            fns,
            device_id,
            tracking: Mutex::new(Tracking::default()),
        })
    }

    fn set_list_int(&self, attr: AclPtr, name: &CString, values: &[i64]) -> AclError {
        let n = values.len() as i32;
        // SAFETY: `values` outlives the call and its length is passed alongside.
        unsafe { (self.fns.set_attr_list_int)(attr, name.as_ptr(), n, values.as_ptr()) }
    }

    fn set_list_float(&self, attr: AclPtr, name: &CString, values: &[f32]) -> AclError {
        let n = values.len() as i32;
        // SAFETY: `values` outlives the call and its length is passed alongside.
        unsafe { (self.fns.set_attr_list_float)(attr, name.as_ptr(), n, values.as_ptr()) }
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn raw_free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        // SAFETY: the pointer came from aclrtMalloc and is released once.
        unsafe { check((self.fns.free)(ptr.0 as AclPtr), "aclrtFree") }
    }

    fn raw_synchronize(&self, stream: Stream) -> Result<(), DriverError> {
        // SAFETY: `stream` is the default stream or one created by this driver.
        unsafe {
            check(
                (self.fns.synchronize_stream)(stream_ptr(stream)),
                "aclrtSynchronizeStream",
            )
        }
    }

    fn raw_create_event(&self) -> Result<Event, DriverError> {
        let mut event: AclPtr = std::ptr::null_mut();
        // SAFETY: `event` is a valid out pointer.
        unsafe { check((self.fns.create_event)(&mut event), "aclrtCreateEvent")? };
        Ok(Event(event as usize))
    }

    fn raw_destroy_event(&self, event: Event) -> Result<(), DriverError> {
        // SAFETY: `event` was created by this driver and is destroyed once.
        unsafe { check((self.fns.destroy_event)(event.0 as AclPtr), "aclrtDestroyEvent") }
    }

    /// Records a fence event on `stream`, reusing an idle one when possible.
    fn fence(&self, tracking: &mut Tracking, stream: Stream) -> Result<Event, DriverError> {
        let event = match tracking.idle_events.pop() {
            Some(event) => event,
            None => self.raw_create_event()?,
        };
        if let Err(e) = self.record_event(event, stream) {
            tracking.idle_events.push(event);
            return Err(e);
        }
        Ok(event)
    }

    fn fence_complete(&self, event: Event) -> bool {
        let mut status = 0;
        // SAFETY: `event` is live and `status` is a valid out pointer.
        let code = unsafe { (self.fns.query_event_status)(event.0 as AclPtr, &mut status) };
        match check(code, "aclrtQueryEventStatus") {
            Ok(()) => status == ACL_EVENT_RECORDED_STATUS_COMPLETE,
            Err(e) => {
                tracing::warn!(?event, error = %e, "failed to query fence event");
                false
            }
        }
    }

    /// Releases every fenced entry whose events have completed.
    fn collect(&self, tracking: &mut Tracking) {
        for (fences, ptr) in tracking.freed.reap(|e| self.fence_complete(*e)) {
            if let Err(e) = self.raw_free(ptr) {
                tracing::warn!(ptr = ptr.0, error = %e, "deferred free failed");
            }
            tracking.idle_events.extend(fences);
        }
        for (fences, _bytes) in tracking.staged.reap(|e| self.fence_complete(*e)) {
            tracking.idle_events.extend(fences);
        }
    }

    fn known_streams(tracking: &Tracking) -> Vec<Stream> {
        std::iter::once(Stream::DEFAULT)
            .chain(tracking.streams.iter().copied())
            .collect()
    }
}

impl Drop for AclDriver {
    fn drop(&mut self) {
        let mut tracking = self.tracking();
        for stream in Self::known_streams(&tracking) {
            if let Err(e) = self.raw_synchronize(stream) {
                tracing::warn!(?stream, error = %e, "failed to synchronize on teardown");
            }
        }
        self.collect(&mut tracking);
        for (fences, ptr) in tracking.freed.take_all() {
            tracing::warn!(ptr = ptr.0, "releasing memory with unfinished fences");
            if let Err(e) = self.raw_free(ptr) {
                tracing::warn!(ptr = ptr.0, error = %e, "deferred free failed");
            }
            tracking.idle_events.extend(fences);
        }
        for (fences, _bytes) in tracking.staged.take_all() {
            tracking.idle_events.extend(fences);
        }
        for event in std::mem::take(&mut tracking.idle_events) {
            if let Err(e) = self.raw_destroy_event(event) {
                tracing::warn!(?event, error = %e, "failed to destroy fence event");
            }
        }
    }
}

impl Driver for AclDriver {
    fn name(&self) -> &'static str {
        "acl"
    }

    fn malloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
        let mut ptr: AclPtr = std::ptr::null_mut();
        let policy = ACL_MEM_MALLOC_HUGE_FIRST;
        // SAFETY: `ptr` is a valid out pointer.
        let code = unsafe { (self.fns.malloc)(&mut ptr, bytes.max(1), policy) };
        if code != ACL_SUCCESS {
            return Err(DriverError::new("aclrtMalloc", codes::BAD_ALLOC));
        }
        Ok(DevicePtr(ptr as u64))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        let mut tracking = self.tracking();
        let streams = Self::known_streams(&tracking);
        let mut fences = Vec::with_capacity(streams.len());
        for stream in &streams {
            match self.fence(&mut tracking, *stream) {
                Ok(event) => fences.push(event),
                Err(e) => {
                    tracing::warn!(?stream, error = %e, "fencing a free failed, synchronizing");
                    for stream in &streams {
                        self.raw_synchronize(*stream)?;
                    }
                    tracking.idle_events.extend(fences);
                    self.collect(&mut tracking);
                    return self.raw_free(ptr);
                }
            }
        }
        tracking.freed.push(fences, ptr);
        self.collect(&mut tracking);
        Ok(())
    }

    fn memcpy_h2d_async(
        &self,
        dst: DevicePtr,
        src: Vec<u8>,
        stream: Stream,
    ) -> Result<(), DriverError> {
        if src.is_empty() {
            return Ok(());
        }
        // SAFETY: the heap block of `src` is kept in the staging set below until a fence
        // recorded after the copy completes.
        unsafe {
            check(
                (self.fns.memcpy_async)(
                    dst.0 as AclPtr,
                    src.len(),
                    src.as_ptr() as *const c_void,
                    src.len(),
                    ACL_MEMCPY_HOST_TO_DEVICE,
                    stream_ptr(stream),
                ),
                "aclrtMemcpyAsync",
            )?;
        }
        let mut tracking = self.tracking();
        match self.fence(&mut tracking, stream) {
            Ok(event) => tracking.staged.push(vec![event], src),
            Err(e) => {
                tracing::warn!(?stream, error = %e, "fencing a copy failed, synchronizing");
                self.raw_synchronize(stream)?;
            }
        }
        self.collect(&mut tracking);
        Ok(())
    }

    fn memcpy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
        if dst.is_empty() {
            return Ok(());
        }
        // SAFETY: `dst` is a valid writable host buffer of the given length.
        unsafe {
            check(
                (self.fns.memcpy)(
                    dst.as_mut_ptr() as AclPtr,
                    dst.len(),
                    src.0 as *const c_void,
                    dst.len(),
                    ACL_MEMCPY_DEVICE_TO_HOST,
                ),
                "aclrtMemcpy",
            )
        }
    }

    fn memcpy_d2d_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: Stream,
    ) -> Result<(), DriverError> {
        if bytes == 0 {
            return Ok(());
        }
        // SAFETY: both pointers are device allocations of at least `bytes`.
        unsafe {
            check(
                (self.fns.memcpy_async)(
                    dst.0 as AclPtr,
                    bytes,
                    src.0 as *const c_void,
                    bytes,
                    ACL_MEMCPY_DEVICE_TO_DEVICE,
                    stream_ptr(stream),
                ),
                "aclrtMemcpyAsync",
            )
        }
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: Stream,
    ) -> Result<(), DriverError> {
        if bytes == 0 {
            return Ok(());
        }
        let (dst, value) = (dst.0 as AclPtr, value as i32);
        // SAFETY: `dst` is a device allocation of at least `bytes`.
        unsafe {
            check(
                (self.fns.memset_async)(dst, bytes, value, bytes, stream_ptr(stream)),
                "aclrtMemsetAsync",
            )
        }
    }

    fn create_tensor_desc(
        &self,
        dtype: AclDataType,
        dims: &[i64],
        format: Format,
    ) -> Result<DescHandle, DriverError> {
        // SAFETY: `dims` outlives the call and its length is passed alongside.
        let (ndims, format) = (dims.len() as i32, format as i32);
        let desc =
            unsafe { (self.fns.create_tensor_desc)(dtype.code(), ndims, dims.as_ptr(), format) };
        non_null(desc, "aclCreateTensorDesc").map(DescHandle)
    }

    fn set_tensor_placement(&self, desc: DescHandle, mem: MemType) -> Result<(), DriverError> {
        // SAFETY: `desc` is a live descriptor.
        unsafe {
            check(
                (self.fns.set_tensor_placement)(desc.0 as AclPtr, mem as i32),
                "aclSetTensorPlaceMent",
            )
        }
    }

    fn set_tensor_const(&self, desc: DescHandle, data: &[u8]) -> Result<(), DriverError> {
        let bytes = data.as_ptr() as *mut c_void;
        // SAFETY: the runtime copies the constant bytes during the call.
        unsafe {
            check(
                (self.fns.set_tensor_const)(desc.0 as AclPtr, bytes, data.len()),
                "aclSetTensorConst",
            )
        }
    }

    fn set_tensor_name(&self, desc: DescHandle, name: &str) -> Result<(), DriverError> {
        let name = c_string(name, "aclSetTensorDescName")?;
        // SAFETY: `desc` is live and `name` is NUL terminated.
        unsafe { (self.fns.set_tensor_name)(desc.0 as AclPtr, name.as_ptr()) };
        Ok(())
    }

    fn destroy_tensor_desc(&self, desc: DescHandle) -> Result<(), DriverError> {
        // SAFETY: `desc` is destroyed once by its owner.
        unsafe { (self.fns.destroy_tensor_desc)(desc.0 as AclPtr) };
        Ok(())
    }

    fn create_data_buffer(&self, data: BufferData<'_>) -> Result<BufferHandle, DriverError> {
        let (ptr, bytes) = match data {
            BufferData::Device { ptr, bytes } => {
                (ptr.map_or(std::ptr::null_mut(), |p| p.0 as AclPtr), bytes)
            }
            BufferData::Host(bytes) => (bytes.as_ptr() as AclPtr, bytes.len()),
        };
        // SAFETY: callers keep the wrapped memory alive for as long as the buffer is used.
        let buffer = unsafe { (self.fns.create_data_buffer)(ptr, bytes) };
        non_null(buffer, "aclCreateDataBuffer").map(BufferHandle)
    }

    fn destroy_data_buffer(&self, buffer: BufferHandle) -> Result<(), DriverError> {
        // SAFETY: `buffer` is destroyed once by its owner.
        unsafe {
            check(
                (self.fns.destroy_data_buffer)(buffer.0 as AclPtr),
                "aclDestroyDataBuffer",
            )
        }
    }

    fn create_op_attr(&self) -> Result<AttrHandle, DriverError> {
        // SAFETY: no arguments.
        let attr = unsafe { (self.fns.create_attr)() };
        non_null(attr, "aclopCreateAttr").map(AttrHandle)
    }

    fn set_op_attr(
        &self,
        attr: AttrHandle,
        name: &str,
        value: &AttrValue,
    ) -> Result<(), DriverError> {
        let api = "aclopSetAttr";
        let key = c_string(name, api)?;
        let handle = attr.0 as AclPtr;
        // SAFETY: every pointer passed below outlives the call it is passed to.
        let code = unsafe {
            match value {
                AttrValue::Blank => ACL_SUCCESS,
                AttrValue::Int(v) => (self.fns.set_attr_int)(handle, key.as_ptr(), *v as i64),
                AttrValue::Int64(v) => (self.fns.set_attr_int)(handle, key.as_ptr(), *v),
                AttrValue::Float(v) => (self.fns.set_attr_float)(handle, key.as_ptr(), *v),
                AttrValue::Bool(v) => (self.fns.set_attr_bool)(handle, key.as_ptr(), *v as u8),
                AttrValue::String(v) => {
                    let v = c_string(v, api)?;
                    (self.fns.set_attr_string)(handle, key.as_ptr(), v.as_ptr())
                }
                AttrValue::Ints(v) => {
                    let v: Vec<i64> = v.iter().map(|x| *x as i64).collect();
                    self.set_list_int(handle, &key, &v)
                }
                AttrValue::Int64s(v) => self.set_list_int(handle, &key, v),
                AttrValue::Floats(v) => self.set_list_float(handle, &key, v),
                AttrValue::Float64s(v) => {
                    let v: Vec<f32> = v.iter().map(|x| *x as f32).collect();
                    self.set_list_float(handle, &key, &v)
                }
                AttrValue::Bools(v) => {
                    let v: Vec<u8> = v.iter().map(|x| *x as u8).collect();
                    let n = v.len() as i32;
                    (self.fns.set_attr_list_bool)(handle, key.as_ptr(), n, v.as_ptr())
                }
                AttrValue::Strings(v) => {
                    let owned = v
                        .iter()
                        .map(|s| c_string(s, api))
                        .collect::<Result<Vec<_>, _>>()?;
                    let ptrs: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();
                    let n = ptrs.len() as i32;
                    (self.fns.set_attr_list_string)(handle, key.as_ptr(), n, ptrs.as_ptr())
                }
                AttrValue::Int64Lists(v) => {
                    let lens: Vec<i32> = v.iter().map(|l| l.len() as i32).collect();
                    let ptrs: Vec<*const i64> = v.iter().map(|l| l.as_ptr()).collect();
                    (self.fns.set_attr_list_list_int)(
                        handle,
                        key.as_ptr(),
                        v.len() as i32,
                        lens.as_ptr(),
                        ptrs.as_ptr(),
                    )
                }
            }
        };
        check(code, api)
    }

    fn destroy_op_attr(&self, attr: AttrHandle) -> Result<(), DriverError> {
        // SAFETY: `attr` is destroyed once by its owner.
        unsafe { (self.fns.destroy_attr)(attr.0 as AclPtr) };
        Ok(())
    }

    fn execute(&self, launch: &OpLaunch<'_>, stream: Stream) -> Result<(), DriverError> {
        let api = "aclopCompileAndExecute";
        let op_type = c_string(launch.op_type, api)?;
        let input_descs: Vec<AclPtr> =
            launch.input_descs.iter().map(|d| d.0 as AclPtr).collect();
        let inputs: Vec<AclPtr> = launch.inputs.iter().map(|b| b.0 as AclPtr).collect();
        let output_descs: Vec<AclPtr> =
            launch.output_descs.iter().map(|d| d.0 as AclPtr).collect();
        let outputs: Vec<AclPtr> = launch.outputs.iter().map(|b| b.0 as AclPtr).collect();
        // SAFETY: all handles are live for the duration of the call.
        unsafe {
            check(
                (self.fns.compile_and_execute)(
                    op_type.as_ptr(),
                    inputs.len() as i32,
                    input_descs.as_ptr(),
                    inputs.as_ptr(),
                    outputs.len() as i32,
                    output_descs.as_ptr(),
                    outputs.as_ptr(),
                    launch.attr.0 as AclPtr,
                    ACL_ENGINE_SYS,
                    ACL_COMPILE_SYS,
                    std::ptr::null(),
                    stream_ptr(stream),
                ),
                api,
            )
        }
    }

    fn create_stream(&self) -> Result<Stream, DriverError> {
        let mut stream: AclPtr = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer.
        unsafe { check((self.fns.create_stream)(&mut stream), "aclrtCreateStream")? };
        let stream = Stream(stream as usize);
        self.tracking().streams.push(stream);
        Ok(stream)
    }

    fn destroy_stream(&self, stream: Stream) -> Result<(), DriverError> {
        let api = "aclrtDestroyStream";
        if stream == Stream::DEFAULT {
            return Err(DriverError::with_detail(
                api,
                codes::INVALID_PARAM,
                "the default stream cannot be destroyed",
            ));
        }
        self.raw_synchronize(stream)?;
        let mut tracking = self.tracking();
        self.collect(&mut tracking);
        tracking.streams.retain(|s| *s != stream);
        // SAFETY: the stream was created by this driver and has no pending work.
        unsafe { check((self.fns.destroy_stream)(stream_ptr(stream)), api) }
    }

    fn synchronize_stream(&self, stream: Stream) -> Result<(), DriverError> {
        self.raw_synchronize(stream)?;
        self.collect(&mut self.tracking());
        Ok(())
    }

    fn create_event(&self) -> Result<Event, DriverError> {
        self.raw_create_event()
    }

    fn destroy_event(&self, event: Event) -> Result<(), DriverError> {
        self.raw_destroy_event(event)
    }

    fn record_event(&self, event: Event, stream: Stream) -> Result<(), DriverError> {
        // SAFETY: both handles were created by this driver.
        unsafe {
            check(
                (self.fns.record_event)(event.0 as AclPtr, stream_ptr(stream)),
                "aclrtRecordEvent",
            )
        }
    }

    fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<(), DriverError> {
        // SAFETY: both handles were created by this driver.
        unsafe {
            check(
                (self.fns.stream_wait_event)(stream_ptr(stream), event.0 as AclPtr),
                "aclrtStreamWaitEvent",
            )
        }
    }
}
