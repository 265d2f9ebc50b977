//! Lowering logical tensors into driver descriptors and data buffers.
//!
//! Every driver object is held by an owning wrapper that releases it exactly once on
//! drop, so a half built [Operand] (descriptor created, buffer rejected) still cleans up.

use std::sync::Arc;

use crate::driver::{AttrHandle, BufferData, BufferHandle, DescHandle, Driver};
use crate::dtypes::{DType, Format, MemType};
use crate::tensor::{HostTensor, Tensor};
use crate::Error;

macro_rules! owned_handle {
    ($name:ident, $handle:ty, $destroy:ident, $what:literal) => {
        #[derive(Debug)]
        pub(crate) struct $name {
            driver: Arc<dyn Driver>,
            pub(crate) handle: $handle,
        }

        impl Drop for $name {
            fn drop(&mut self) {
                if let Err(e) = self.driver.$destroy(self.handle) {
                    tracing::warn!(error = %e, "failed to release {}", $what);
                }
            }
        }
    };
}

owned_handle!(TensorDesc, DescHandle, destroy_tensor_desc, "tensor descriptor");
owned_handle!(DataBuffer, BufferHandle, destroy_data_buffer, "data buffer");
owned_handle!(OpAttr, AttrHandle, destroy_op_attr, "op attribute set");

impl OpAttr {
    pub(crate) fn new(driver: &Arc<dyn Driver>) -> Result<Self, Error> {
        Ok(Self {
            handle: driver.create_op_attr()?,
            driver: driver.clone(),
        })
    }
}

/// A descriptor and the buffer it describes. They are created and released together.
#[derive(Debug)]
pub(crate) struct Operand {
    pub(crate) dtype: DType,
    pub(crate) dims: Vec<i64>,
    pub(crate) mem: MemType,
    pub(crate) desc: TensorDesc,
    pub(crate) buffer: DataBuffer,
}

fn create_desc(
    driver: &Arc<dyn Driver>,
    dtype: DType,
    dims: &[i64],
    format: Format,
    mem: MemType,
) -> Result<TensorDesc, Error> {
    let acl = dtype.to_acl()?;
    let handle = driver
        .create_tensor_desc(acl, dims, format)
        .map_err(Error::DescriptorCreation)?;
    let desc = TensorDesc {
        driver: driver.clone(),
        handle,
    };
    if mem == MemType::Host {
        driver
            .set_tensor_placement(desc.handle, mem)
            .map_err(Error::DescriptorCreation)?;
    }
    Ok(desc)
}

fn create_buffer(driver: &Arc<dyn Driver>, data: BufferData<'_>) -> Result<DataBuffer, Error> {
    let handle = driver
        .create_data_buffer(data)
        .map_err(Error::DescriptorCreation)?;
    Ok(DataBuffer {
        driver: driver.clone(),
        handle,
    })
}

/// Builds the descriptor and buffer of a device tensor.
pub(crate) fn describe(
    driver: &Arc<dyn Driver>,
    tensor: &Tensor,
    mem: MemType,
) -> Result<Operand, Error> {
    let dims: Vec<i64> = tensor.shape().iter().map(|&d| d as i64).collect();
    let desc = create_desc(driver, tensor.dtype(), &dims, tensor.layout().into(), mem)?;
    if !tensor.is_allocated() && tensor.num_bytes() > 0 {
        return Err(Error::InvalidArgument(format!(
            "tensor of shape {:?} is not allocated",
            tensor.shape()
        )));
    }
    let buffer = create_buffer(
        driver,
        BufferData::Device {
            ptr: tensor.device_ptr(),
            bytes: tensor.num_bytes(),
        },
    )?;
    Ok(Operand {
        dtype: tensor.dtype(),
        dims,
        mem,
        desc,
        buffer,
    })
}

/// Builds the descriptor and buffer of a host tensor, optionally marking it a constant.
///
/// The buffer points into `host.bytes`; the caller keeps `host` alive and unmoved until
/// the operation completed.
pub(crate) fn describe_host(
    driver: &Arc<dyn Driver>,
    host: &HostTensor,
    is_const: bool,
) -> Result<Operand, Error> {
    let dims: Vec<i64> = host.dims.iter().map(|&d| d as i64).collect();
    let desc = create_desc(driver, host.dtype, &dims, Format::Nd, MemType::Host)?;
    if is_const {
        driver
            .set_tensor_const(desc.handle, &host.bytes)
            .map_err(Error::DescriptorCreation)?;
    }
    let buffer = create_buffer(driver, BufferData::Host(&host.bytes))?;
    Ok(Operand {
        dtype: host.dtype,
        dims,
        mem: MemType::Host,
        desc,
        buffer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{HostDriver, LiveHandles};
    use crate::dtypes::Layout;
    use crate::tensor::Npu;

    #[test]
    fn test_describe_and_release() {
        let driver = Arc::new(HostDriver::default());
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let dev = Npu::new(dyn_driver.clone());
        let t = dev
            .alloc(DType::Float16, &[2, 3, 4, 5])
            .unwrap()
            .with_layout(Layout::Nchw);
        let operand = describe(&dyn_driver, &t, MemType::Device).unwrap();
        assert_eq!(operand.dims, [2, 3, 4, 5]);
        assert_eq!(driver.tensor_dims(operand.desc.handle), Some(vec![2, 3, 4, 5]));
        assert_eq!(driver.live_handles().descs, 1);
        assert_eq!(driver.live_handles().buffers, 1);
        drop(operand);
        drop(t);
        assert_eq!(driver.live_handles(), LiveHandles::default());
    }

    #[test]
    fn test_unsupported_dtype_creates_nothing() {
        let driver = Arc::new(HostDriver::default());
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let t = Tensor::empty(DType::Complex64);
        assert!(matches!(
            describe(&dyn_driver, &t, MemType::Device),
            Err(Error::UnsupportedDtype(DType::Complex64))
        ));
        assert_eq!(driver.live_handles(), LiveHandles::default());
    }

    #[test]
    fn test_rejected_buffer_releases_descriptor() {
        let driver = Arc::new(HostDriver::default());
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let dev = Npu::new(dyn_driver.clone());
        let t = dev.alloc(DType::Float32, &[4]).unwrap();
        driver.fail_on("aclCreateDataBuffer");
        assert!(matches!(
            describe(&dyn_driver, &t, MemType::Device),
            Err(Error::DescriptorCreation(_))
        ));
        assert_eq!(driver.live_handles().descs, 0);
    }

    #[test]
    fn test_host_constant() {
        let driver = Arc::new(HostDriver::default());
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let host = HostTensor::from_vec(vec![4i64, 1]);
        let operand = describe_host(&dyn_driver, &host, true).unwrap();
        assert_eq!(operand.mem, MemType::Host);
        assert_eq!(driver.tensor_placement(operand.desc.handle), Some(MemType::Host));
        assert_eq!(operand.dims, [2]);
    }
}
