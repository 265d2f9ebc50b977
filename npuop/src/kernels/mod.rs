//! Framework level kernels. Each one is a trait implemented for [crate::tensor::Npu],
//! plus free functions that call it.

pub mod dropout;
