//! Logical tensors and the [Npu] device context.
//!
//! A [Tensor] is metadata (dtype, shape, layout) plus an optional, reference counted
//! device allocation. Cloning or [Tensor::reshaped] shares the allocation; it is freed
//! through the driver when the last view is dropped.

mod npu;

pub use npu::Npu;

use std::sync::Arc;

use crate::driver::{DevicePtr, Driver};
use crate::dtypes::{DType, Layout};
use crate::Error;

/// A device allocation owned by one or more [Tensor]s.
#[derive(Debug)]
pub struct DeviceMemory {
    driver: Arc<dyn Driver>,
    ptr: DevicePtr,
    bytes: usize,
}

impl DeviceMemory {
    pub(crate) fn new(driver: Arc<dyn Driver>, ptr: DevicePtr, bytes: usize) -> Self {
        Self { driver, ptr, bytes }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if let Err(e) = self.driver.free(self.ptr) {
            let (ptr, bytes) = (self.ptr.0, self.bytes);
            tracing::warn!(error = %e, ptr, bytes, "failed to release device memory");
        }
    }
}

/// A view of a multi dimensional array in device memory.
///
/// An output tensor may start out unallocated ([Tensor::empty]); kernels size and
/// allocate it with [Npu::ensure_alloc].
#[derive(Clone, Debug)]
pub struct Tensor {
    pub(crate) dtype: DType,
    pub(crate) shape: Vec<usize>,
    pub(crate) layout: Layout,
    pub(crate) storage: Option<Arc<DeviceMemory>>,
}

impl Tensor {
    /// An unallocated tensor of `dtype` with no shape yet.
    pub fn empty(dtype: DType) -> Self {
        Self {
            dtype,
            shape: Vec::new(),
            layout: Layout::Any,
            storage: None,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Number of elements. A rank 0 tensor holds one element.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn num_bytes(&self) -> usize {
        self.numel() * self.dtype.size_of()
    }

    pub fn is_allocated(&self) -> bool {
        self.storage.is_some()
    }

    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.storage.as_ref().map(|s| s.ptr())
    }

    /// A view of the same memory with a different shape. Only metadata changes.
    pub fn reshaped(&self, shape: &[usize]) -> Result<Self, Error> {
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(Error::InvalidArgument(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            ..self.clone()
        })
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }
}

/// A tensor materialized in host memory, used for small constant inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub bytes: Vec<u8>,
}

impl HostTensor {
    pub fn from_vec<E: crate::dtypes::Unit>(values: Vec<E>) -> Self {
        Self {
            dtype: E::DTYPE,
            dims: vec![values.len()],
            bytes: crate::dtypes::to_le_bytes(&values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestDevice;

    #[test]
    fn test_rank0_has_one_element() {
        let dev: TestDevice = Default::default();
        let t = dev.tensor_from_vec(vec![0.5f32], &[]).unwrap();
        assert_eq!(t.rank(), 0);
        assert_eq!(t.numel(), 1);
        assert_eq!(t.num_bytes(), 4);
    }

    #[test]
    fn test_reshape_shares_memory() {
        let dev: TestDevice = Default::default();
        let t = dev.tensor_from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[4]).unwrap();
        let r = t.reshaped(&[4, 1]).unwrap();
        assert_eq!(r.shape(), &[4, 1]);
        assert_eq!(r.device_ptr(), t.device_ptr());
        assert_eq!(dev.to_vec::<f64>(&r).unwrap(), [1.0, 2.0, 3.0, 4.0]);
        assert!(t.reshaped(&[3]).is_err());
    }

    #[test]
    fn test_memory_released_with_last_view() {
        let driver = Arc::new(crate::driver::HostDriver::default());
        let dev = Npu::new(driver.clone());
        let t = dev.alloc(DType::Float32, &[8]).unwrap();
        let view = t.reshaped(&[2, 4]).unwrap();
        drop(t);
        assert_eq!(driver.live_handles().allocations, 1);
        drop(view);
        assert_eq!(driver.live_handles().allocations, 0);
    }

    #[test]
    fn test_empty_tensor() {
        let t = Tensor::empty(DType::UInt8);
        assert!(!t.is_allocated());
        assert_eq!(t.device_ptr(), None);
    }
}
