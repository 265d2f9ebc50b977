//! The seam between this crate and the accelerator driver.
//!
//! Everything above this module talks to the hardware only through [Driver]. Handles are
//! plain `Copy` integers so that an FFI backend can store raw pointers in them (the same
//! trick lets the backend satisfy `Send + Sync`). Ownership of handles is enforced one
//! level up, by the owning wrappers in [crate::runner] and [crate::tensor].
//!
//! Two backends exist:
//! 1. [HostDriver] - a simulated accelerator executing on host memory. Always available.
//! 2. `AclDriver` - the vendor runtime, loaded at run time. Requires the `acl` feature.

#[cfg(feature = "acl")]
mod acl;
mod deferred;
mod host;

#[cfg(feature = "acl")]
pub use acl::{AclDriver, LIBRARY_ENV};
pub use host::{ExecutedOp, HostDriver, LiveHandles};

use crate::attr::AttrValue;
use crate::dtypes::{AclDataType, Format, MemType};

/// Status codes shared by the backends. Values follow the vendor runtime.
pub mod codes {
    pub const INVALID_PARAM: i32 = 100_000;
    pub const INVALID_RESOURCE_HANDLE: i32 = 107_000;
    pub const OP_NOT_FOUND: i32 = 100_024;
    pub const BAD_ALLOC: i32 = 200_000;
    pub const INTERNAL: i32 = 500_000;
}

/// A failed driver call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverError {
    /// The driver entry point that failed.
    pub api: &'static str,
    pub code: i32,
    pub detail: Option<String>,
}

impl DriverError {
    pub fn new(api: &'static str, code: i32) -> Self {
        Self {
            api,
            code,
            detail: None,
        }
    }

    pub fn with_detail(api: &'static str, code: i32, detail: impl Into<String>) -> Self {
        Self {
            api,
            code,
            detail: Some(detail.into()),
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed with code {}", self.api, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DriverError {}

/// An ordered hardware execution queue. `Stream::DEFAULT` is the process wide default stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Stream(pub usize);

impl Stream {
    pub const DEFAULT: Stream = Stream(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Event(pub usize);

/// Address of a device allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescHandle(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttrHandle(pub usize);

/// The memory a data buffer wraps.
///
/// `Host` data is borrowed only for the call, but a backend may keep the raw pointer:
/// callers must keep the bytes alive and unmoved until the operation using the buffer
/// completed. [crate::runner::OpRunner] does so by owning its host tensors.
#[derive(Clone, Copy, Debug)]
pub enum BufferData<'a> {
    Device { ptr: Option<DevicePtr>, bytes: usize },
    Host(&'a [u8]),
}

/// Everything the driver needs to enqueue one operation.
#[derive(Clone, Copy, Debug)]
pub struct OpLaunch<'a> {
    pub op_type: &'a str,
    pub input_descs: &'a [DescHandle],
    pub inputs: &'a [BufferHandle],
    pub output_descs: &'a [DescHandle],
    pub outputs: &'a [BufferHandle],
    pub attr: AttrHandle,
}

/// The accelerator control API.
///
/// Calls that take a [Stream] only enqueue work; completion is observed by later work on
/// the same stream, by an event wait, or by [Driver::synchronize_stream].
pub trait Driver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn malloc(&self, bytes: usize) -> Result<DevicePtr, DriverError>;
    /// Releases an allocation. Work already enqueued that uses it still sees valid memory.
    fn free(&self, ptr: DevicePtr) -> Result<(), DriverError>;
    fn memcpy_h2d_async(
        &self,
        dst: DevicePtr,
        src: Vec<u8>,
        stream: Stream,
    ) -> Result<(), DriverError>;
    /// Blocking copy to the host. Does not wait for pending stream work.
    fn memcpy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError>;
    fn memcpy_d2d_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: Stream,
    ) -> Result<(), DriverError>;
    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: Stream,
    ) -> Result<(), DriverError>;

    fn create_tensor_desc(
        &self,
        dtype: AclDataType,
        dims: &[i64],
        format: Format,
    ) -> Result<DescHandle, DriverError>;
    fn set_tensor_placement(&self, desc: DescHandle, mem: MemType) -> Result<(), DriverError>;
    /// Marks a host descriptor as a compile time constant with the given contents.
    fn set_tensor_const(&self, desc: DescHandle, data: &[u8]) -> Result<(), DriverError>;
    fn set_tensor_name(&self, desc: DescHandle, name: &str) -> Result<(), DriverError>;
    fn destroy_tensor_desc(&self, desc: DescHandle) -> Result<(), DriverError>;

    fn create_data_buffer(&self, data: BufferData<'_>) -> Result<BufferHandle, DriverError>;
    fn destroy_data_buffer(&self, buffer: BufferHandle) -> Result<(), DriverError>;

    fn create_op_attr(&self) -> Result<AttrHandle, DriverError>;
    fn set_op_attr(&self, attr: AttrHandle, name: &str, value: &AttrValue)
        -> Result<(), DriverError>;
    fn destroy_op_attr(&self, attr: AttrHandle) -> Result<(), DriverError>;

    /// Enqueues an operation. Descriptors, buffers and attributes may be destroyed as
    /// soon as this returns.
    fn execute(&self, launch: &OpLaunch<'_>, stream: Stream) -> Result<(), DriverError>;

    fn create_stream(&self) -> Result<Stream, DriverError>;
    /// Waits for the stream's pending work, then releases it.
    fn destroy_stream(&self, stream: Stream) -> Result<(), DriverError>;
    fn synchronize_stream(&self, stream: Stream) -> Result<(), DriverError>;
    fn create_event(&self) -> Result<Event, DriverError>;
    fn destroy_event(&self, event: Event) -> Result<(), DriverError>;
    fn record_event(&self, event: Event, stream: Stream) -> Result<(), DriverError>;
    /// Makes all future work on `stream` wait until `event`'s last record completed.
    fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<(), DriverError>;
}
