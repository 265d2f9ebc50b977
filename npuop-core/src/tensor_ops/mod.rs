//! Small device side helpers kernels compose: casts, fills, copies and scaling.
//!
//! Each one enqueues on the main stream of the [Npu] it is called on and returns
//! without waiting.

use crate::dtypes::encode;
use crate::runner::OpRunner;
use crate::tensor::{Npu, Tensor};
use crate::Error;

/// Byte length of a packed dropout mask for `numel` elements: one bit per element,
/// rounded up to a multiple of 128 bits.
///
/// ```rust
/// # use npuop_core::tensor_ops::mask_len;
/// assert_eq!(mask_len(1), 16);
/// assert_eq!(mask_len(128), 16);
/// assert_eq!(mask_len(129), 32);
/// ```
pub const fn mask_len(numel: usize) -> usize {
    numel.div_ceil(128) * 128 / 8
}

fn same_size(src: &Tensor, dst: &Tensor) -> Result<(), Error> {
    if src.numel() != dst.numel() {
        return Err(Error::InvalidArgument(format!(
            "shape mismatch {:?} vs {:?}",
            src.shape(),
            dst.shape()
        )));
    }
    Ok(())
}

impl Npu {
    /// `dst = src as dst.dtype()`.
    pub fn cast(&self, src: &Tensor, dst: &Tensor) -> Result<(), Error> {
        same_size(src, dst)?;
        OpRunner::new(self, "Cast")
            .add_input(src)?
            .add_output(dst)?
            .add_attr_dtype("dst_type", dst.dtype())?
            .run(Some(self.stream), false)
    }

    /// Writes zeros into `dst`. `src` only supplies the shape.
    pub fn zeros_like(&self, src: &Tensor, dst: &Tensor) -> Result<(), Error> {
        same_size(src, dst)?;
        OpRunner::new(self, "ZerosLike")
            .add_input(src)?
            .add_output(dst)?
            .run(Some(self.stream), false)
    }

    /// `dst = src * value`.
    pub fn muls(&self, src: &Tensor, dst: &Tensor, value: f32) -> Result<(), Error> {
        same_size(src, dst)?;
        OpRunner::new(self, "Muls")
            .add_input(src)?
            .add_output(dst)?
            .add_attr("value", value)?
            .run(Some(self.stream), false)
    }

    /// Sets every element of `dst` to `value`, converted to the dtype of `dst`.
    pub fn fill(&self, dst: &Tensor, value: f64) -> Result<(), Error> {
        let bytes = encode(dst.dtype(), &vec![value; dst.numel()])?;
        match dst.device_ptr() {
            Some(ptr) if !bytes.is_empty() => {
                Ok(self.driver.memcpy_h2d_async(ptr, bytes, self.stream)?)
            }
            Some(_) => Ok(()),
            None => Err(Error::InvalidArgument("fill of an unallocated tensor".into())),
        }
    }

    /// Byte wise zeroing of the whole allocation.
    pub fn memset_zero(&self, dst: &Tensor) -> Result<(), Error> {
        match dst.device_ptr() {
            Some(ptr) if dst.num_bytes() > 0 => {
                Ok(self.driver.memset_async(ptr, 0, dst.num_bytes(), self.stream)?)
            }
            Some(_) => Ok(()),
            None => Err(Error::InvalidArgument("memset of an unallocated tensor".into())),
        }
    }

    /// Device to device copy of the raw contents.
    pub fn copy(&self, src: &Tensor, dst: &Tensor) -> Result<(), Error> {
        if src.num_bytes() != dst.num_bytes() {
            return Err(Error::InvalidArgument(format!(
                "copy of {} bytes into {}",
                src.num_bytes(),
                dst.num_bytes()
            )));
        }
        match (src.device_ptr(), dst.device_ptr()) {
            (Some(s), Some(d)) if src.num_bytes() > 0 => Ok(self
                .driver
                .memcpy_d2d_async(d, s, src.num_bytes(), self.stream)?),
            (Some(_), Some(_)) => Ok(()),
            _ => Err(Error::InvalidArgument("copy of an unallocated tensor".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtypes::{f16, DType};
    use crate::tests::*;

    #[test]
    fn test_mask_len() {
        for (numel, expected) in [(1, 16), (4, 16), (127, 16), (128, 16), (129, 32), (1000, 128)] {
            assert_eq!(mask_len(numel), expected);
        }
    }

    #[test]
    fn test_cast_f64_to_f32_and_back() {
        let dev: TestDevice = Default::default();
        let x = dev.tensor_from_vec(vec![0.5f64, -1.25, 3.0], &[3]).unwrap();
        let y = dev.alloc(DType::Float32, &[3]).unwrap();
        let z = dev.alloc(DType::Float64, &[3]).unwrap();
        dev.cast(&x, &y).unwrap();
        dev.cast(&y, &z).unwrap();
        assert_eq!(dev.to_vec::<f32>(&y).unwrap(), [0.5, -1.25, 3.0]);
        assert_eq!(dev.to_vec::<f64>(&z).unwrap(), [0.5, -1.25, 3.0]);
    }

    #[test]
    fn test_fill_and_zeros() {
        let dev: TestDevice = Default::default();
        let x = dev.alloc(DType::Float16, &[2, 2]).unwrap();
        dev.fill(&x, 0.75).unwrap();
        assert_eq!(dev.to_vec::<f16>(&x).unwrap(), [f16::from_f32(0.75); 4]);
        dev.zeros_like(&x, &x).unwrap();
        assert_eq!(dev.to_vec::<f16>(&x).unwrap(), [f16::ZERO; 4]);
    }

    #[test]
    fn test_muls_and_copy() {
        let dev: TestDevice = Default::default();
        let x = dev.tensor_from_vec(vec![1.0f32, -2.0], &[2]).unwrap();
        let y = dev.alloc(DType::Float32, &[2]).unwrap();
        let z = dev.alloc(DType::Float32, &[2]).unwrap();
        dev.muls(&x, &y, 0.5).unwrap();
        dev.copy(&y, &z).unwrap();
        assert_close(&dev.to_vec::<f32>(&z).unwrap()[..], &[0.5, -1.0]);
        assert!(dev.copy(&x, &dev.alloc(DType::Float64, &[2]).unwrap()).is_err());
    }

    #[test]
    fn test_memset_zero() {
        let dev: TestDevice = Default::default();
        let x = dev.tensor_from_vec(vec![7u8; 16], &[16]).unwrap();
        dev.memset_zero(&x).unwrap();
        assert_eq!(dev.to_vec::<u8>(&x).unwrap(), [0; 16]);
    }
}
