//! The hardware floating point exception flag.

use super::OpRunner;
use crate::driver::Stream;
use crate::dtypes::{from_le_bytes, DType};
use crate::tensor::{Npu, Tensor};
use crate::Error;

const STATUS_LEN: usize = 8;

/// The status buffer of `npu`, allocated and initialized on first use.
fn status_buffer(npu: &Npu, stream: Stream) -> Result<Tensor, Error> {
    let mut slot = npu.float_status.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(status) = slot.as_ref() {
        return Ok(status.clone());
    }
    let status = npu.alloc(DType::Float32, &[STATUS_LEN])?;
    OpRunner::new(npu, "NPUAllocFloatStatus")
        .add_output(&status)?
        .run(Some(stream), false)?;
    *slot = Some(status.clone());
    Ok(status)
}

impl OpRunner {
    /// Whether any operation overflowed since the flag was last cleared.
    ///
    /// The flag is shared by everything running on the device. Blocks until `stream`
    /// drained.
    pub fn get_float_status(npu: &Npu, stream: Option<Stream>) -> Result<bool, Error> {
        let stream = stream.unwrap_or(npu.stream);
        let status = status_buffer(npu, stream)?;
        let tmp = npu.alloc(DType::Float32, &[STATUS_LEN])?;
        OpRunner::new(npu, "NPUGetFloatStatus")
            .add_input(&status)?
            .add_output(&tmp)?
            .run(Some(stream), true)?;

        let mut bytes = vec![0u8; status.num_bytes()];
        if let Some(ptr) = status.device_ptr() {
            npu.driver.memcpy_d2h(&mut bytes, ptr)?;
        }
        let flags: Vec<f32> = from_le_bytes(&bytes);
        Ok(flags.iter().any(|f| *f != 0.0))
    }

    /// Resets the flag. Enqueued on `stream`, does not block.
    pub fn clear_float_status(npu: &Npu, stream: Option<Stream>) -> Result<(), Error> {
        let stream = stream.unwrap_or(npu.stream);
        let status = status_buffer(npu, stream)?;
        let tmp = npu.alloc(DType::Float32, &[STATUS_LEN])?;
        OpRunner::new(npu, "NPUClearFloatStatus")
            .add_input(&status)?
            .add_output(&tmp)?
            .run(Some(stream), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestDevice;

    #[test]
    fn test_overflow_sets_and_clear_resets() {
        let dev: TestDevice = Default::default();
        assert!(!OpRunner::get_float_status(&dev, None).unwrap());

        let x = dev.tensor_from_vec(vec![1e300f64, 1.0], &[2]).unwrap();
        let y = dev.alloc(DType::Float32, &[2]).unwrap();
        dev.cast(&x, &y).unwrap();
        assert!(OpRunner::get_float_status(&dev, None).unwrap());
        assert_eq!(dev.to_vec::<f32>(&y).unwrap(), [f32::INFINITY, 1.0]);

        OpRunner::clear_float_status(&dev, None).unwrap();
        assert!(!OpRunner::get_float_status(&dev, None).unwrap());
    }

    #[test]
    fn test_status_buffer_is_shared() {
        let dev: TestDevice = Default::default();
        let a = status_buffer(&dev, dev.stream()).unwrap();
        let b = status_buffer(&dev.clone(), dev.stream()).unwrap();
        assert_eq!(a.device_ptr(), b.device_ptr());
    }
}
