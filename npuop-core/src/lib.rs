//! # npuop-core
//!
//! The dispatch layer between framework level compute kernels and an NPU driver.
//!
//! Kernels never talk to the driver directly. They build an [runner::OpRunner] for one
//! named hardware operation, feed it logical [tensor::Tensor]s (which the runner lowers
//! into driver descriptors and data buffers) and [attr::AttrValue]s, then submit it onto
//! a [driver::Stream]:
//!
//! ```rust
//! # use npuop_core::prelude::*;
//! let npu: Npu = Default::default();
//! let x = npu.tensor_from_vec(vec![1.0f32, 2.0, 3.0], &[3])?;
//! let y = npu.alloc(DType::Float32, &[3])?;
//! OpRunner::new(&npu, "Muls")
//!     .add_input(&x)?
//!     .add_output(&y)?
//!     .add_attr("value", 2.0f32)?
//!     .run(None, false)?;
//! assert_eq!(npu.to_vec::<f32>(&y)?, [2.0, 4.0, 6.0]);
//! # Ok::<(), npuop_core::Error>(())
//! ```
//!
//! Submission is asynchronous: work is ordered per stream, and work on different
//! streams is unordered unless an event wait joins them. [stream::SecondaryStream] owns
//! the one auxiliary stream used to overlap mask generation with main stream compute.
//!
//! # Backends
//!
//! [driver::HostDriver] simulates the accelerator on host memory; it backs
//! `Npu::default()` and every test in this workspace. With the `acl` feature,
//! `driver::AclDriver` binds the vendor runtime.

extern crate self as npuop_core;

pub mod attr;
pub mod driver;
pub mod dtypes;
pub mod runner;
pub mod stream;
pub mod tensor;
pub mod tensor_ops;

pub use driver::DriverError;

pub mod prelude {
    pub use crate::attr::{AttrValue, AttributeMap, IntoAttributeMap};
    pub use crate::driver::{Driver, HostDriver, Stream};
    pub use crate::dtypes::{DType, Layout, MemType, Unit};
    pub use crate::runner::OpRunner;
    pub use crate::stream::SecondaryStream;
    pub use crate::tensor::{Npu, Tensor};
    pub use crate::Error;
}

/// Represents the different errors that can occur while building or submitting
/// hardware operations. None of them is retried at this layer.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// The element type has no accelerator counterpart.
    UnsupportedDtype(dtypes::DType),
    /// The driver rejected a tensor descriptor or data buffer.
    DescriptorCreation(DriverError),
    /// The driver rejected (or failed) an enqueued operation.
    DriverSubmission {
        op_type: String,
        source: DriverError,
    },
    /// The secondary stream or its events could not be created.
    StreamInit(DriverError),
    /// Any other failed driver call (copies, synchronization, attributes).
    Driver(DriverError),
    /// Device is out of memory
    OutOfMemory,
    /// Arguments are inconsistent with each other (shapes, dtypes, modes).
    InvalidArgument(String),
    #[cfg(feature = "acl")]
    LibraryLoad(String),
}

impl From<DriverError> for Error {
    fn from(value: DriverError) -> Self {
        if value.code == driver::codes::BAD_ALLOC {
            Self::OutOfMemory
        } else {
            Self::Driver(value)
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnsupportedDtype(dtype) => {
                write!(f, "dtype {dtype:?} is not supported by the accelerator")
            }
            Error::DescriptorCreation(e) => write!(f, "failed to create tensor descriptor: {e}"),
            Error::DriverSubmission { op_type, source } => {
                write!(f, "failed to run operation {op_type}: {source}")
            }
            Error::StreamInit(e) => write!(f, "failed to initialize secondary stream: {e}"),
            Error::Driver(e) => write!(f, "{e}"),
            Error::OutOfMemory => write!(f, "device is out of memory"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            #[cfg(feature = "acl")]
            Error::LibraryLoad(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DescriptorCreation(e) | Error::StreamInit(e) | Error::Driver(e) => Some(e),
            Error::DriverSubmission { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    pub type TestDevice = crate::tensor::Npu;

    pub trait AssertClose {
        fn assert_close(&self, rhs: &Self, tolerance: f64);
    }

    impl AssertClose for [f32] {
        fn assert_close(&self, rhs: &Self, tolerance: f64) {
            assert_eq!(self.len(), rhs.len(), "lhs != rhs | {self:?} != {rhs:?}");
            for (l, r) in self.iter().zip(rhs.iter()) {
                if ((l - r).abs() as f64) > tolerance {
                    panic!("lhs != rhs | {l} != {r}\n\n{self:?}\n\n{rhs:?}");
                }
            }
        }
    }

    impl AssertClose for [f64] {
        fn assert_close(&self, rhs: &Self, tolerance: f64) {
            assert_eq!(self.len(), rhs.len(), "lhs != rhs | {self:?} != {rhs:?}");
            for (l, r) in self.iter().zip(rhs.iter()) {
                if (l - r).abs() > tolerance {
                    panic!("lhs != rhs | {l} != {r}\n\n{self:?}\n\n{rhs:?}");
                }
            }
        }
    }

    pub fn assert_close<T: AssertClose + ?Sized>(lhs: &T, rhs: &T) {
        lhs.assert_close(rhs, 1e-6);
    }
}
