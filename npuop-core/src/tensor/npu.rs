use std::sync::{Arc, Mutex};

use super::{DeviceMemory, Tensor};
use crate::driver::{Driver, HostDriver, Stream};
use crate::dtypes::{to_le_bytes, DType, Unit};
use crate::stream::SecondaryStream;
use crate::Error;

/// A device context: the driver, the main stream kernels enqueue on, and the process
/// wide shared state (secondary stream, float status buffer).
///
/// Cloning is cheap and shares everything. [Npu::with_stream] gives a context that
/// enqueues on another main stream but still shares the secondary stream.
#[derive(Clone, Debug)]
pub struct Npu {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) stream: Stream,
    pub(crate) secondary: Arc<SecondaryStream>,
    pub(crate) float_status: Arc<Mutex<Option<Tensor>>>,
}

impl Default for Npu {
    fn default() -> Self {
        Self::seed_from_u64(0)
    }
}

impl Npu {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            secondary: Arc::new(SecondaryStream::new(driver.clone())),
            driver,
            stream: Stream::DEFAULT,
            float_status: Default::default(),
        }
    }

    /// A simulated device whose unseeded randomness derives from `seed`.
    pub fn seed_from_u64(seed: u64) -> Self {
        Self::new(Arc::new(HostDriver::seed_from_u64(seed)))
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// The main stream of this context.
    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn with_stream(&self, stream: Stream) -> Self {
        Self {
            stream,
            ..self.clone()
        }
    }

    pub fn create_stream(&self) -> Result<Stream, Error> {
        Ok(self.driver.create_stream()?)
    }

    pub fn secondary_stream(&self) -> &SecondaryStream {
        &self.secondary
    }

    /// Allocates an uninitialized tensor.
    pub fn alloc(&self, dtype: DType, shape: &[usize]) -> Result<Tensor, Error> {
        if dtype.size_of() == 0 {
            return Err(Error::UnsupportedDtype(dtype));
        }
        let bytes = shape.iter().product::<usize>() * dtype.size_of();
        let ptr = self.driver.malloc(bytes)?;
        Ok(Tensor {
            dtype,
            shape: shape.to_vec(),
            layout: Default::default(),
            storage: Some(Arc::new(DeviceMemory::new(self.driver.clone(), ptr, bytes))),
        })
    }

    /// Sizes and allocates `t` unless it already is an allocation of `dtype` and `shape`.
    pub fn ensure_alloc(&self, t: &mut Tensor, dtype: DType, shape: &[usize]) -> Result<(), Error> {
        if t.is_allocated() && t.dtype == dtype && t.shape == shape {
            return Ok(());
        }
        let layout = t.layout;
        *t = self.alloc(dtype, shape)?.with_layout(layout);
        Ok(())
    }

    /// Uploads `data` asynchronously on the main stream.
    pub fn tensor_from_vec<E: Unit>(&self, data: Vec<E>, shape: &[usize]) -> Result<Tensor, Error> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::InvalidArgument(format!(
                "{} values do not fill shape {shape:?}",
                data.len()
            )));
        }
        let t = self.alloc(E::DTYPE, shape)?;
        if let Some(ptr) = t.device_ptr() {
            if numel > 0 {
                self.driver
                    .memcpy_h2d_async(ptr, to_le_bytes(&data), self.stream)?;
            }
        }
        Ok(t)
    }

    /// Waits for the main stream, then copies `t` back to the host.
    pub fn to_vec<E: Unit>(&self, t: &Tensor) -> Result<Vec<E>, Error> {
        if t.dtype != E::DTYPE {
            return Err(Error::InvalidArgument(format!(
                "reading a {:?} tensor as {:?}",
                t.dtype,
                E::DTYPE
            )));
        }
        Ok(crate::dtypes::from_le_bytes(&self.to_bytes(t)?))
    }

    /// Waits for the main stream, then copies the raw contents of `t` back to the host.
    pub fn to_bytes(&self, t: &Tensor) -> Result<Vec<u8>, Error> {
        self.synchronize()?;
        let Some(ptr) = t.device_ptr() else {
            return Err(Error::InvalidArgument("tensor is not allocated".into()));
        };
        let mut out = vec![0u8; t.num_bytes()];
        self.driver.memcpy_d2h(&mut out, ptr)?;
        Ok(out)
    }

    /// Blocks until all work enqueued on the main stream completed.
    pub fn synchronize(&self) -> Result<(), Error> {
        Ok(self.driver.synchronize_stream(self.stream)?)
    }
}
