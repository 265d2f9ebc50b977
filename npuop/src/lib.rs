//! # npuop
//!
//! Compute kernels for an NPU, built on the op dispatch layer of [npuop_core].
//!
//! Everything from `npuop-core` is re-exported here, so `npuop::runner::OpRunner`,
//! `npuop::tensor::Npu` and friends are reachable from this crate alone. On top of that
//! this crate adds:
//! 1. [kernels] - framework level kernels composed from hardware operations
//! 2. [OpAttrs] - a derive turning a plain struct into operation attributes
//!
//! See [feature_flags] for more information on features.
//!
//! # Running a kernel
//!
//! ```rust
//! # use npuop::prelude::*;
//! let dev: Npu = Default::default();
//! let x = dev.tensor_from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2])?;
//! let (mut out, mut mask) = (Tensor::empty(DType::Float32), Tensor::empty(DType::UInt8));
//!
//! let op = DropoutKernelOp { p: 1.0, ..Default::default() };
//! dev.forward(&op, &x, None, &mut out, &mut mask)?;
//! assert_eq!(dev.to_vec::<f32>(&out)?, [0.0; 4]);
//! assert_eq!(dev.to_vec::<u8>(&mask)?, [0; 16]);
//! # Ok::<(), npuop::Error>(())
//! ```
//!
//! # Building your own
//!
//! A kernel is a sequence of [runner::OpRunner]s:
//!
//! ```rust
//! # use npuop::prelude::*;
//! #[derive(OpAttrs)]
//! struct MulsAttrs {
//!     value: f32,
//! }
//!
//! let dev: Npu = Default::default();
//! let x = dev.tensor_from_vec(vec![1.0f32, -2.0], &[2])?;
//! let y = dev.alloc(DType::Float32, &[2])?;
//! OpRunner::with_io(&dev, "Muls", &[x], &[y.clone()], MulsAttrs { value: 3.0 })?
//!     .run(Some(dev.stream()), false)?;
//! assert_eq!(dev.to_vec::<f32>(&y)?, [3.0, -6.0]);
//! # Ok::<(), npuop::Error>(())
//! ```

extern crate self as npuop;

pub mod feature_flags;
pub mod kernels;

pub use npuop_core::*;

pub use npuop_derives::OpAttrs;

pub mod prelude {
    pub use crate::kernels::dropout::{
        dropout, dropout_grad, DropoutKernel, DropoutKernelOp, DropoutMode,
    };
    pub use crate::OpAttrs;
    pub use npuop_core::prelude::*;
}
