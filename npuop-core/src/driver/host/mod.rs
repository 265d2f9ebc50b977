//! A simulated accelerator that executes on host memory.
//!
//! Work is queued per stream and only runs when a stream is drained, either by
//! [Driver::synchronize_stream] or because another stream waits on an event recorded on
//! it. This keeps the ordering contract of a real device observable: a consumer on one
//! stream only sees the effects of another stream's work if an event wait joined them.

mod ops;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use rand::{rngs::StdRng, SeedableRng};

use super::deferred::Deferred;
use super::{
    codes, AttrHandle, BufferData, BufferHandle, DescHandle, DevicePtr, Driver, DriverError,
    Event, OpLaunch, Stream,
};
use crate::attr::{AttrValue, AttributeMap};
use crate::dtypes::{AclDataType, Format, MemType};

const ALIGNMENT: u64 = 512;
const BASE_ADDRESS: u64 = 0x1000_0000;

/// Number of driver objects currently alive. Used to check that every handle is
/// released exactly once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveHandles {
    pub descs: usize,
    pub buffers: usize,
    pub attrs: usize,
    pub allocations: usize,
}

/// One operation the simulator executed, in execution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedOp {
    pub op_type: String,
    pub stream: Stream,
    pub input_shapes: Vec<Vec<i64>>,
    pub output_shapes: Vec<Vec<i64>>,
}

/// A simulated accelerator. See the [module level docs](self).
#[derive(Debug)]
pub struct HostDriver {
    state: Mutex<HostState>,
}

#[derive(Clone, Debug)]
pub(super) struct DescInfo {
    pub dtype: AclDataType,
    pub dims: Vec<i64>,
    #[allow(unused)]
    pub format: Format,
    pub placement: MemType,
    pub name: Option<String>,
    pub constant: Option<Vec<u8>>,
}

impl DescInfo {
    pub fn numel(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }
}

#[derive(Clone, Debug)]
enum BufferInfo {
    Device { ptr: Option<DevicePtr>, bytes: usize },
    Host(Vec<u8>),
}

#[derive(Clone, Debug)]
pub(super) enum Source {
    Device { ptr: Option<DevicePtr>, bytes: usize },
    Host(Vec<u8>),
}

#[derive(Clone, Debug)]
pub(super) struct Operand {
    pub desc: DescInfo,
    pub data: Source,
}

#[derive(Debug)]
pub(super) struct Launch {
    pub op_type: String,
    pub inputs: Vec<Operand>,
    pub outputs: Vec<Operand>,
    pub attrs: AttributeMap,
}

#[derive(Clone, Copy, Debug)]
struct Marker {
    stream: Stream,
    seq: u64,
}

#[derive(Debug)]
enum Command {
    Launch(Launch),
    CopyH2D {
        dst: DevicePtr,
        data: Vec<u8>,
    },
    CopyD2D {
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    },
    Memset {
        dst: DevicePtr,
        value: u8,
        bytes: usize,
    },
    Wait(Marker),
}

#[derive(Debug, Default)]
struct StreamQueue {
    pending: VecDeque<Command>,
    enqueued: u64,
    completed: u64,
}

#[derive(Debug)]
pub(super) struct HostState {
    memory: HashMap<DevicePtr, Vec<u8>>,
    /// Freed while streams still had work that may read it.
    retired: Deferred<Marker, DevicePtr>,
    next_addr: u64,
    next_handle: usize,
    descs: HashMap<usize, DescInfo>,
    buffers: HashMap<usize, BufferInfo>,
    attrs: HashMap<usize, AttributeMap>,
    streams: HashMap<Stream, StreamQueue>,
    events: HashMap<Event, Option<Marker>>,
    pub(super) rng: StdRng,
    pub(super) float_status: bool,
    faults: HashSet<&'static str>,
    history: Vec<ExecutedOp>,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::seed_from_u64(0)
    }
}

impl HostDriver {
    /// Constructs a simulator whose unseeded randomness derives from `seed`.
    pub fn seed_from_u64(seed: u64) -> Self {
        let mut streams = HashMap::new();
        streams.insert(Stream::DEFAULT, StreamQueue::default());
        Self {
            state: Mutex::new(HostState {
                memory: HashMap::new(),
                retired: Deferred::default(),
                next_addr: BASE_ADDRESS,
                next_handle: 1,
                descs: HashMap::new(),
                buffers: HashMap::new(),
                attrs: HashMap::new(),
                streams,
                events: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
                float_status: false,
                faults: HashSet::new(),
                history: Vec::new(),
            }),
        }
    }

    /// Makes every later call to the driver entry point `api` fail (e.g. `"aclrtCreateStream"`).
    pub fn fail_on(&self, api: &'static str) {
        self.lock().faults.insert(api);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn live_handles(&self) -> LiveHandles {
        let state = self.lock();
        LiveHandles {
            descs: state.descs.len(),
            buffers: state.buffers.len(),
            attrs: state.attrs.len(),
            allocations: state.memory.len() - state.retired.len(),
        }
    }

    /// Operations executed so far, oldest first.
    pub fn history(&self) -> Vec<ExecutedOp> {
        self.lock().history.clone()
    }

    /// Number of commands enqueued on `stream` that have not executed yet.
    pub fn pending(&self, stream: Stream) -> usize {
        self.lock()
            .streams
            .get(&stream)
            .map_or(0, |q| q.pending.len())
    }

    pub fn num_streams(&self) -> usize {
        self.lock().streams.len()
    }

    /// The attributes currently stored on an attribute handle.
    pub fn op_attrs(&self, attr: AttrHandle) -> Option<AttributeMap> {
        self.lock().attrs.get(&attr.0).cloned()
    }

    /// The name given to a tensor descriptor, if any.
    pub fn tensor_name(&self, desc: DescHandle) -> Option<String> {
        self.lock().descs.get(&desc.0).and_then(|d| d.name.clone())
    }

    pub fn tensor_dims(&self, desc: DescHandle) -> Option<Vec<i64>> {
        self.lock().descs.get(&desc.0).map(|d| d.dims.clone())
    }

    pub fn tensor_placement(&self, desc: DescHandle) -> Option<MemType> {
        self.lock().descs.get(&desc.0).map(|d| d.placement)
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        // a panic while holding the lock leaves plain data behind, keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checked(&self, api: &'static str) -> Result<MutexGuard<'_, HostState>, DriverError> {
        let state = self.lock();
        if state.faults.contains(api) {
            return Err(DriverError::with_detail(
                api,
                codes::INTERNAL,
                "injected failure",
            ));
        }
        Ok(state)
    }
}

impl HostState {
    fn handle(&mut self) -> usize {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn queue(
        &mut self,
        api: &'static str,
        stream: Stream,
    ) -> Result<&mut StreamQueue, DriverError> {
        self.streams.get_mut(&stream).ok_or_else(|| {
            DriverError::with_detail(
                api,
                codes::INVALID_RESOURCE_HANDLE,
                format!("unknown stream {stream:?}"),
            )
        })
    }

    fn enqueue(
        &mut self,
        api: &'static str,
        stream: Stream,
        command: Command,
    ) -> Result<(), DriverError> {
        let queue = self.queue(api, stream)?;
        queue.pending.push_back(command);
        queue.enqueued += 1;
        Ok(())
    }

    fn check_ptr(
        &self,
        api: &'static str,
        ptr: DevicePtr,
        bytes: usize,
    ) -> Result<(), DriverError> {
        match self.memory.get(&ptr) {
            Some(mem) if mem.len() >= bytes => Ok(()),
            Some(mem) => Err(DriverError::with_detail(
                api,
                codes::INVALID_PARAM,
                format!("{bytes} bytes requested from an allocation of {}", mem.len()),
            )),
            None => Err(DriverError::with_detail(
                api,
                codes::INVALID_RESOURCE_HANDLE,
                format!("unknown device pointer {:#x}", ptr.0),
            )),
        }
    }

    pub(super) fn read(&self, ptr: DevicePtr, bytes: usize) -> Result<Vec<u8>, String> {
        match self.memory.get(&ptr) {
            Some(mem) if mem.len() >= bytes => Ok(mem[..bytes].to_vec()),
            Some(_) => Err(format!("read of {bytes} bytes overruns {:#x}", ptr.0)),
            None => Err(format!("read from released memory {:#x}", ptr.0)),
        }
    }

    pub(super) fn write(&mut self, ptr: DevicePtr, data: &[u8]) -> Result<(), String> {
        match self.memory.get_mut(&ptr) {
            Some(mem) if mem.len() >= data.len() => {
                mem[..data.len()].copy_from_slice(data);
                Ok(())
            }
            Some(_) => Err(format!("write of {} bytes overruns {:#x}", data.len(), ptr.0)),
            None => Err(format!("write to released memory {:#x}", ptr.0)),
        }
    }

    /// Executes pending work on `stream` in order, until `until` commands have completed
    /// (or the queue is empty).
    fn drain(&mut self, stream: Stream, until: Option<u64>) -> Result<(), DriverError> {
        loop {
            let queue = self.queue("aclrtSynchronizeStream", stream)?;
            if until.is_some_and(|seq| queue.completed >= seq) {
                break;
            }
            let Some(command) = queue.pending.pop_front() else {
                break;
            };
            let result = self.run_command(stream, command);
            self.queue("aclrtSynchronizeStream", stream)?.completed += 1;
            result?;
        }
        self.release_retired();
        Ok(())
    }

    /// Drops retired memory once every stream that had work at the time of the free
    /// has run past it. A destroyed stream has nothing left to run.
    fn release_retired(&mut self) {
        let streams = &self.streams;
        let released = self.retired.reap(|marker| {
            streams
                .get(&marker.stream)
                .map_or(true, |q| q.completed >= marker.seq)
        });
        for (_, ptr) in released {
            self.memory.remove(&ptr);
        }
    }

    fn run_command(&mut self, stream: Stream, command: Command) -> Result<(), DriverError> {
        let failed = |detail: String| {
            DriverError::with_detail("aclrtSynchronizeStream", codes::INTERNAL, detail)
        };
        match command {
            Command::Launch(launch) => {
                ops::run(self, &launch)
                    .map_err(|e| failed(format!("{}: {e}", launch.op_type)))?;
                self.history.push(ExecutedOp {
                    op_type: launch.op_type.clone(),
                    stream,
                    input_shapes: launch.inputs.iter().map(|o| o.desc.dims.clone()).collect(),
                    output_shapes: launch.outputs.iter().map(|o| o.desc.dims.clone()).collect(),
                });
                Ok(())
            }
            Command::CopyH2D { dst, data } => self.write(dst, &data).map_err(failed),
            Command::CopyD2D { dst, src, bytes } => {
                let data = self.read(src, bytes).map_err(failed)?;
                self.write(dst, &data).map_err(failed)
            }
            Command::Memset { dst, value, bytes } => {
                self.write(dst, &vec![value; bytes]).map_err(failed)
            }
            Command::Wait(marker)
                if marker.stream != stream && self.streams.contains_key(&marker.stream) =>
            {
                self.drain(marker.stream, Some(marker.seq))
            }
            Command::Wait(_) => Ok(()),
        }
    }

    fn operand(&self, desc: DescHandle, buffer: BufferHandle) -> Result<Operand, DriverError> {
        let api = "aclopCompileAndExecute";
        let desc = self.descs.get(&desc.0).cloned().ok_or_else(|| {
            DriverError::with_detail(api, codes::INVALID_RESOURCE_HANDLE, "unknown tensor desc")
        })?;
        let buffer = self.buffers.get(&buffer.0).ok_or_else(|| {
            DriverError::with_detail(api, codes::INVALID_RESOURCE_HANDLE, "unknown data buffer")
        })?;
        let data = match (&desc.constant, buffer) {
            (Some(constant), _) => Source::Host(constant.clone()),
            (None, BufferInfo::Host(bytes)) => Source::Host(bytes.clone()),
            (None, BufferInfo::Device { ptr, bytes }) => Source::Device {
                ptr: *ptr,
                bytes: *bytes,
            },
        };
        Ok(Operand { desc, data })
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &'static str {
        "host"
    }

    fn malloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
        let mut state = self.checked("aclrtMalloc").map_err(|e| DriverError {
            code: codes::BAD_ALLOC,
            ..e
        })?;
        let ptr = DevicePtr(state.next_addr);
        let span = (bytes.max(1) as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_addr += span;
        state.memory.insert(ptr, vec![0; bytes]);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        let mut state = self.checked("aclrtFree")?;
        if !state.memory.contains_key(&ptr) || state.retired.items().any(|p| *p == ptr) {
            return Err(DriverError::with_detail(
                "aclrtFree",
                codes::INVALID_RESOURCE_HANDLE,
                format!("double free of {:#x}", ptr.0),
            ));
        }
        let fences = state
            .streams
            .iter()
            .filter(|(_, q)| !q.pending.is_empty())
            .map(|(stream, q)| Marker {
                stream: *stream,
                seq: q.enqueued,
            })
            .collect();
        state.retired.push(fences, ptr);
        state.release_retired();
        Ok(())
    }

    fn memcpy_h2d_async(
        &self,
        dst: DevicePtr,
        src: Vec<u8>,
        stream: Stream,
    ) -> Result<(), DriverError> {
        let api = "aclrtMemcpyAsync";
        let mut state = self.checked(api)?;
        state.check_ptr(api, dst, src.len())?;
        state.enqueue(api, stream, Command::CopyH2D { dst, data: src })
    }

    fn memcpy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
        let api = "aclrtMemcpy";
        let state = self.checked(api)?;
        state.check_ptr(api, src, dst.len())?;
        let data = state
            .read(src, dst.len())
            .map_err(|e| DriverError::with_detail(api, codes::INVALID_PARAM, e))?;
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn memcpy_d2d_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: Stream,
    ) -> Result<(), DriverError> {
        let api = "aclrtMemcpyAsync";
        let mut state = self.checked(api)?;
        state.check_ptr(api, src, bytes)?;
        state.check_ptr(api, dst, bytes)?;
        state.enqueue(api, stream, Command::CopyD2D { dst, src, bytes })
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: Stream,
    ) -> Result<(), DriverError> {
        let api = "aclrtMemsetAsync";
        let mut state = self.checked(api)?;
        state.check_ptr(api, dst, bytes)?;
        state.enqueue(api, stream, Command::Memset { dst, value, bytes })
    }

    fn create_tensor_desc(
        &self,
        dtype: AclDataType,
        dims: &[i64],
        format: Format,
    ) -> Result<DescHandle, DriverError> {
        let api = "aclCreateTensorDesc";
        let mut state = self.checked(api)?;
        if let Some(d) = dims.iter().find(|d| **d < 0) {
            return Err(DriverError::with_detail(
                api,
                codes::INVALID_PARAM,
                format!("negative dimension {d}"),
            ));
        }
        let handle = state.handle();
        state.descs.insert(
            handle,
            DescInfo {
                dtype,
                dims: dims.to_vec(),
                format,
                placement: MemType::Device,
                name: None,
                constant: None,
            },
        );
        Ok(DescHandle(handle))
    }

    fn set_tensor_placement(&self, desc: DescHandle, mem: MemType) -> Result<(), DriverError> {
        let api = "aclSetTensorPlaceMent";
        let mut state = self.checked(api)?;
        let info = state.descs.get_mut(&desc.0).ok_or_else(|| {
            DriverError::new(api, codes::INVALID_RESOURCE_HANDLE)
        })?;
        info.placement = mem;
        Ok(())
    }

    fn set_tensor_const(&self, desc: DescHandle, data: &[u8]) -> Result<(), DriverError> {
        let api = "aclSetTensorConst";
        let mut state = self.checked(api)?;
        let info = state.descs.get_mut(&desc.0).ok_or_else(|| {
            DriverError::new(api, codes::INVALID_RESOURCE_HANDLE)
        })?;
        info.constant = Some(data.to_vec());
        Ok(())
    }

    fn set_tensor_name(&self, desc: DescHandle, name: &str) -> Result<(), DriverError> {
        let api = "aclSetTensorDescName";
        let mut state = self.checked(api)?;
        let info = state.descs.get_mut(&desc.0).ok_or_else(|| {
            DriverError::new(api, codes::INVALID_RESOURCE_HANDLE)
        })?;
        info.name = Some(name.to_string());
        Ok(())
    }

    fn destroy_tensor_desc(&self, desc: DescHandle) -> Result<(), DriverError> {
        let api = "aclDestroyTensorDesc";
        let mut state = self.lock();
        match state.descs.remove(&desc.0) {
            Some(_) => Ok(()),
            None => Err(DriverError::new(api, codes::INVALID_RESOURCE_HANDLE)),
        }
    }

    fn create_data_buffer(&self, data: BufferData<'_>) -> Result<BufferHandle, DriverError> {
        let api = "aclCreateDataBuffer";
        let mut state = self.checked(api)?;
        let info = match data {
            BufferData::Device { ptr: Some(ptr), bytes } => {
                state.check_ptr(api, ptr, bytes)?;
                BufferInfo::Device { ptr: Some(ptr), bytes }
            }
            BufferData::Device { ptr: None, bytes: 0 } => {
                BufferInfo::Device { ptr: None, bytes: 0 }
            }
            BufferData::Device { ptr: None, bytes } => {
                return Err(DriverError::with_detail(
                    api,
                    codes::INVALID_PARAM,
                    format!("null pointer for {bytes} bytes"),
                ))
            }
            BufferData::Host(bytes) => BufferInfo::Host(bytes.to_vec()),
        };
        let handle = state.handle();
        state.buffers.insert(handle, info);
        Ok(BufferHandle(handle))
    }

    fn destroy_data_buffer(&self, buffer: BufferHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        match state.buffers.remove(&buffer.0) {
            Some(_) => Ok(()),
            None => Err(DriverError::new(
                "aclDestroyDataBuffer",
                codes::INVALID_RESOURCE_HANDLE,
            )),
        }
    }

    fn create_op_attr(&self) -> Result<AttrHandle, DriverError> {
        let mut state = self.checked("aclopCreateAttr")?;
        let handle = state.handle();
        state.attrs.insert(handle, AttributeMap::new());
        Ok(AttrHandle(handle))
    }

    fn set_op_attr(
        &self,
        attr: AttrHandle,
        name: &str,
        value: &AttrValue,
    ) -> Result<(), DriverError> {
        let api = "aclopSetAttr";
        let mut state = self.checked(api)?;
        if name.is_empty() {
            let detail = format!("empty name for a {} attribute", value.kind());
            return Err(DriverError::with_detail(api, codes::INVALID_PARAM, detail));
        }
        let attrs = state
            .attrs
            .get_mut(&attr.0)
            .ok_or_else(|| DriverError::new(api, codes::INVALID_RESOURCE_HANDLE))?;
        attrs.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn destroy_op_attr(&self, attr: AttrHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        match state.attrs.remove(&attr.0) {
            Some(_) => Ok(()),
            None => Err(DriverError::new(
                "aclopDestroyAttr",
                codes::INVALID_RESOURCE_HANDLE,
            )),
        }
    }

    fn execute(&self, launch: &OpLaunch<'_>, stream: Stream) -> Result<(), DriverError> {
        let api = "aclopCompileAndExecute";
        let mut state = self.checked(api)?;
        if launch.input_descs.len() != launch.inputs.len()
            || launch.output_descs.len() != launch.outputs.len()
        {
            return Err(DriverError::with_detail(
                api,
                codes::INVALID_PARAM,
                "descriptor and buffer counts differ",
            ));
        }
        let inputs = launch
            .input_descs
            .iter()
            .zip(launch.inputs)
            .map(|(d, b)| state.operand(*d, *b))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = launch
            .output_descs
            .iter()
            .zip(launch.outputs)
            .map(|(d, b)| state.operand(*d, *b))
            .collect::<Result<Vec<_>, _>>()?;
        let attrs = state
            .attrs
            .get(&launch.attr.0)
            .cloned()
            .ok_or_else(|| DriverError::new(api, codes::INVALID_RESOURCE_HANDLE))?;
        let launch = Launch {
            op_type: launch.op_type.to_string(),
            inputs,
            outputs,
            attrs,
        };
        ops::validate(&launch).map_err(|(code, detail)| {
            DriverError::with_detail(api, code, format!("{}: {detail}", launch.op_type))
        })?;
        state.enqueue(api, stream, Command::Launch(launch))
    }

    fn create_stream(&self) -> Result<Stream, DriverError> {
        let mut state = self.checked("aclrtCreateStream")?;
        let stream = Stream(state.handle());
        state.streams.insert(stream, StreamQueue::default());
        Ok(stream)
    }

    fn destroy_stream(&self, stream: Stream) -> Result<(), DriverError> {
        let api = "aclrtDestroyStream";
        let mut state = self.checked(api)?;
        if stream == Stream::DEFAULT {
            return Err(DriverError::with_detail(
                api,
                codes::INVALID_PARAM,
                "the default stream cannot be destroyed",
            ));
        }
        state.queue(api, stream)?;
        state.drain(stream, None)?;
        state.streams.remove(&stream);
        state.release_retired();
        Ok(())
    }

    fn synchronize_stream(&self, stream: Stream) -> Result<(), DriverError> {
        let mut state = self.checked("aclrtSynchronizeStream")?;
        state.drain(stream, None)
    }

    fn create_event(&self) -> Result<Event, DriverError> {
        let mut state = self.checked("aclrtCreateEvent")?;
        let event = Event(state.handle());
        state.events.insert(event, None);
        Ok(event)
    }

    fn destroy_event(&self, event: Event) -> Result<(), DriverError> {
        let mut state = self.checked("aclrtDestroyEvent")?;
        match state.events.remove(&event) {
            Some(_) => Ok(()),
            None => Err(DriverError::new(
                "aclrtDestroyEvent",
                codes::INVALID_RESOURCE_HANDLE,
            )),
        }
    }

    fn record_event(&self, event: Event, stream: Stream) -> Result<(), DriverError> {
        let api = "aclrtRecordEvent";
        let mut state = self.checked(api)?;
        let seq = state.queue(api, stream)?.enqueued;
        let slot = state
            .events
            .get_mut(&event)
            .ok_or_else(|| DriverError::new(api, codes::INVALID_RESOURCE_HANDLE))?;
        *slot = Some(Marker { stream, seq });
        Ok(())
    }

    fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<(), DriverError> {
        let api = "aclrtStreamWaitEvent";
        let mut state = self.checked(api)?;
        let marker = *state
            .events
            .get(&event)
            .ok_or_else(|| DriverError::new(api, codes::INVALID_RESOURCE_HANDLE))?;
        match marker {
            Some(marker) => state.enqueue(api, stream, Command::Wait(marker)),
            // waiting on an event that was never recorded completes immediately
            None => state.queue(api, stream).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtypes::{to_le_bytes, Format};

    fn desc(driver: &HostDriver, dims: &[i64]) -> DescHandle {
        driver
            .create_tensor_desc(AclDataType::Float, dims, Format::Nd)
            .unwrap()
    }

    fn launch_muls(driver: &HostDriver, x: DevicePtr, y: DevicePtr, value: f32, stream: Stream) {
        let (dx, dy) = (desc(driver, &[2]), desc(driver, &[2]));
        let bx = driver
            .create_data_buffer(BufferData::Device { ptr: Some(x), bytes: 8 })
            .unwrap();
        let by = driver
            .create_data_buffer(BufferData::Device { ptr: Some(y), bytes: 8 })
            .unwrap();
        let attr = driver.create_op_attr().unwrap();
        driver
            .set_op_attr(attr, "value", &AttrValue::Float(value))
            .unwrap();
        let launch = OpLaunch {
            op_type: "Muls",
            input_descs: &[dx],
            inputs: &[bx],
            output_descs: &[dy],
            outputs: &[by],
            attr,
        };
        driver.execute(&launch, stream).unwrap();
        driver.destroy_tensor_desc(dx).unwrap();
        driver.destroy_tensor_desc(dy).unwrap();
        driver.destroy_data_buffer(bx).unwrap();
        driver.destroy_data_buffer(by).unwrap();
        driver.destroy_op_attr(attr).unwrap();
    }

    fn read_f32(driver: &HostDriver, ptr: DevicePtr) -> Vec<f32> {
        let mut out = vec![0u8; 8];
        driver.memcpy_d2h(&mut out, ptr).unwrap();
        crate::dtypes::from_le_bytes(&out)
    }

    #[test]
    fn test_work_runs_only_when_drained() {
        let driver = HostDriver::default();
        let x = driver.malloc(8).unwrap();
        let y = driver.malloc(8).unwrap();
        driver
            .memcpy_h2d_async(x, to_le_bytes(&[1.0f32, 2.0]), Stream::DEFAULT)
            .unwrap();
        launch_muls(&driver, x, y, 3.0, Stream::DEFAULT);
        assert_eq!(driver.pending(Stream::DEFAULT), 2);
        assert_eq!(read_f32(&driver, y), [0.0, 0.0]);

        driver.synchronize_stream(Stream::DEFAULT).unwrap();
        assert_eq!(read_f32(&driver, y), [3.0, 6.0]);
        assert_eq!(driver.history().len(), 1);
    }

    #[test]
    fn test_event_wait_drains_recording_stream() {
        let driver = HostDriver::default();
        let side = driver.create_stream().unwrap();
        let event = driver.create_event().unwrap();
        let x = driver.malloc(8).unwrap();
        let y = driver.malloc(8).unwrap();

        driver
            .memcpy_h2d_async(x, to_le_bytes(&[1.0f32, 2.0]), side)
            .unwrap();
        driver.record_event(event, side).unwrap();
        // enqueued after the record, must not be forced by the wait
        driver
            .memcpy_h2d_async(x, to_le_bytes(&[5.0f32, 5.0]), side)
            .unwrap();
        driver.stream_wait_event(Stream::DEFAULT, event).unwrap();
        launch_muls(&driver, x, y, 2.0, Stream::DEFAULT);

        driver.synchronize_stream(Stream::DEFAULT).unwrap();
        assert_eq!(read_f32(&driver, y), [2.0, 4.0]);
        assert_eq!(driver.pending(side), 1);
    }

    #[test]
    fn test_unjoined_streams_are_unordered() {
        let driver = HostDriver::default();
        let side = driver.create_stream().unwrap();
        let x = driver.malloc(8).unwrap();
        let y = driver.malloc(8).unwrap();
        driver
            .memcpy_h2d_async(x, to_le_bytes(&[1.0f32, 2.0]), side)
            .unwrap();
        launch_muls(&driver, x, y, 2.0, Stream::DEFAULT);
        driver.synchronize_stream(Stream::DEFAULT).unwrap();
        assert_eq!(read_f32(&driver, y), [0.0, 0.0]);
    }

    #[test]
    fn test_free_is_deferred_while_work_is_pending() {
        let driver = HostDriver::default();
        let x = driver.malloc(8).unwrap();
        let y = driver.malloc(8).unwrap();
        launch_muls(&driver, x, y, 2.0, Stream::DEFAULT);
        driver.free(x).unwrap();
        assert_eq!(driver.live_handles().allocations, 1);
        driver.synchronize_stream(Stream::DEFAULT).unwrap();
        assert_eq!(driver.live_handles().allocations, 1);
        assert!(driver.free(x).is_err());
        driver.free(y).unwrap();
        assert_eq!(driver.live_handles(), LiveHandles::default());
    }

    #[test]
    fn test_free_waits_only_for_work_enqueued_before_it() {
        let driver = HostDriver::default();
        let side = driver.create_stream().unwrap();
        let x = driver.malloc(8).unwrap();
        let y = driver.malloc(8).unwrap();
        launch_muls(&driver, x, y, 2.0, side);
        driver.free(x).unwrap();
        driver
            .memcpy_h2d_async(y, to_le_bytes(&[1.0f32, 1.0]), Stream::DEFAULT)
            .unwrap();
        assert_eq!(driver.live_handles().allocations, 1);

        driver.synchronize_stream(side).unwrap();
        assert_eq!(driver.pending(Stream::DEFAULT), 1);
        assert!(driver.free(x).is_err());
        assert_eq!(driver.live_handles().allocations, 1);

        driver.free(y).unwrap();
        driver.synchronize_stream(Stream::DEFAULT).unwrap();
        assert_eq!(driver.live_handles(), LiveHandles::default());
    }

    #[test]
    fn test_destroy_stream_and_event() {
        let driver = HostDriver::default();
        let side = driver.create_stream().unwrap();
        let event = driver.create_event().unwrap();
        let x = driver.malloc(8).unwrap();
        driver
            .memcpy_h2d_async(x, to_le_bytes(&[1.0f32, 2.0]), side)
            .unwrap();
        driver.record_event(event, side).unwrap();
        driver.stream_wait_event(Stream::DEFAULT, event).unwrap();

        driver.destroy_stream(side).unwrap();
        assert_eq!(driver.num_streams(), 1);
        assert_eq!(read_f32(&driver, x), [1.0, 2.0]);
        driver.synchronize_stream(Stream::DEFAULT).unwrap();
        assert!(driver.destroy_stream(side).is_err());
        assert!(driver.destroy_stream(Stream::DEFAULT).is_err());

        driver.destroy_event(event).unwrap();
        assert!(driver.destroy_event(event).is_err());
        assert!(driver.record_event(event, Stream::DEFAULT).is_err());
    }

    #[test]
    fn test_injected_faults() {
        let driver = HostDriver::default();
        driver.fail_on("aclrtCreateStream");
        let err = driver.create_stream().unwrap_err();
        assert_eq!(err.api, "aclrtCreateStream");
        driver.clear_faults();
        assert!(driver.create_stream().is_ok());
    }
}
