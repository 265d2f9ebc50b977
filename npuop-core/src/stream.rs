//! The secondary stream used to overlap mask generation with main stream compute.

use std::sync::{Arc, Mutex, OnceLock};

use crate::driver::{Driver, Event, Stream};
use crate::Error;

#[derive(Clone, Copy, Debug)]
struct Handles {
    stream: Stream,
    /// Recorded on the secondary stream, waited on by a main stream.
    done: Event,
    /// Recorded on a main stream, waited on by the secondary stream.
    ready: Event,
}

/// Owns the one secondary execution stream of a device.
///
/// The stream and its events are created on first use and live as long as the device
/// context. There is no degraded mode: if creation fails every call returns
/// [Error::StreamInit] and nothing is cached, so a later call retries.
///
/// All call sites share the same stream, so work from several main streams serializes
/// on its in-order queue. The only lock on the submission path pairs the record and the
/// wait in [SecondaryStream::wait_for].
#[derive(Debug)]
pub struct SecondaryStream {
    driver: Arc<dyn Driver>,
    handles: OnceLock<Handles>,
    init: Mutex<()>,
    /// `ready` is shared by every main stream; a wait must see its own record.
    submit: Mutex<()>,
}

impl SecondaryStream {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            handles: OnceLock::new(),
            init: Mutex::new(()),
            submit: Mutex::new(()),
        }
    }

    fn create(&self) -> Result<Handles, Error> {
        let stream = self.driver.create_stream().map_err(Error::StreamInit)?;
        let done = match self.driver.create_event() {
            Ok(event) => event,
            Err(e) => {
                self.release(stream, &[]);
                return Err(Error::StreamInit(e));
            }
        };
        let ready = match self.driver.create_event() {
            Ok(event) => event,
            Err(e) => {
                self.release(stream, &[done]);
                return Err(Error::StreamInit(e));
            }
        };
        Ok(Handles { stream, done, ready })
    }

    /// Tears down a partially created set of handles.
    fn release(&self, stream: Stream, events: &[Event]) {
        for event in events {
            if let Err(e) = self.driver.destroy_event(*event) {
                tracing::warn!(?event, error = %e, "failed to destroy event");
            }
        }
        if let Err(e) = self.driver.destroy_stream(stream) {
            tracing::warn!(?stream, error = %e, "failed to destroy stream");
        }
    }

    fn handles(&self) -> Result<Handles, Error> {
        if let Some(handles) = self.handles.get() {
            return Ok(*handles);
        }
        let _guard = self.init.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handles) = self.handles.get() {
            return Ok(*handles);
        }
        let handles = self.create()?;
        tracing::info!(stream = ?handles.stream, "created secondary stream");
        Ok(*self.handles.get_or_init(|| handles))
    }

    /// Whether the stream has been created yet.
    pub fn is_initialized(&self) -> bool {
        self.handles.get().is_some()
    }

    /// Returns the secondary stream, creating it on first call.
    pub fn get(&self, main: Stream) -> Result<Stream, Error> {
        let handles = self.handles()?;
        tracing::trace!(?main, secondary = ?handles.stream, "secondary stream requested");
        Ok(handles.stream)
    }

    /// Everything enqueued on the secondary stream so far happens before anything
    /// enqueued on `main` after this call. Does not block.
    pub fn record_before(&self, main: Stream) -> Result<(), Error> {
        let handles = self.handles()?;
        self.driver.record_event(handles.done, handles.stream)?;
        self.driver.stream_wait_event(main, handles.done)?;
        Ok(())
    }

    /// The converse of [SecondaryStream::record_before]: everything enqueued on `main`
    /// so far happens before anything enqueued on the secondary stream after this call.
    pub fn wait_for(&self, main: Stream) -> Result<(), Error> {
        let handles = self.handles()?;
        let _guard = self.submit.lock().unwrap_or_else(|e| e.into_inner());
        self.driver.record_event(handles.ready, main)?;
        self.driver.stream_wait_event(handles.stream, handles.ready)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::attr::AttrValue;
    use crate::driver::{
        AttrHandle, BufferData, BufferHandle, DescHandle, DevicePtr, DriverError, HostDriver,
        OpLaunch,
    };
    use crate::dtypes::{to_le_bytes, AclDataType, Format, MemType};
    use crate::tensor::Npu;

    #[test]
    fn test_created_once_and_lazily() {
        let driver = Arc::new(HostDriver::default());
        let dev = Npu::new(driver.clone());
        assert_eq!(driver.num_streams(), 1);
        assert!(!dev.secondary_stream().is_initialized());

        let a = dev.secondary_stream().get(dev.stream()).unwrap();
        let b = dev.clone().secondary_stream().get(dev.stream()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, dev.stream());
        assert_eq!(driver.num_streams(), 2);
    }

    #[test]
    fn test_record_before_orders_main_after_secondary() {
        let driver = Arc::new(HostDriver::default());
        let dev = Npu::new(driver.clone());
        let secondary = dev.secondary_stream().get(dev.stream()).unwrap();

        let t = dev.alloc(crate::dtypes::DType::Float32, &[2]).unwrap();
        let y = dev.alloc(crate::dtypes::DType::Float32, &[2]).unwrap();
        let ptr = t.device_ptr().unwrap();
        driver
            .memcpy_h2d_async(ptr, to_le_bytes(&[3.0f32, 4.0]), secondary)
            .unwrap();
        dev.secondary_stream().record_before(dev.stream()).unwrap();
        dev.copy(&t, &y).unwrap();
        assert_eq!(dev.to_vec::<f32>(&y).unwrap(), [3.0, 4.0]);
    }

    #[test]
    fn test_without_record_before_streams_are_unordered() {
        let driver = Arc::new(HostDriver::default());
        let dev = Npu::new(driver.clone());
        let secondary = dev.secondary_stream().get(dev.stream()).unwrap();

        let t = dev.alloc(crate::dtypes::DType::Float32, &[2]).unwrap();
        let y = dev.alloc(crate::dtypes::DType::Float32, &[2]).unwrap();
        driver
            .memcpy_h2d_async(t.device_ptr().unwrap(), to_le_bytes(&[3.0f32, 4.0]), secondary)
            .unwrap();
        dev.copy(&t, &y).unwrap();
        assert_eq!(dev.to_vec::<f32>(&y).unwrap(), [0.0, 0.0]);
        assert_eq!(driver.pending(secondary), 1);
    }

    #[test]
    fn test_wait_for_orders_secondary_after_main() {
        let driver = Arc::new(HostDriver::default());
        let dev = Npu::new(driver.clone());
        let secondary = dev.secondary_stream().get(dev.stream()).unwrap();

        let t = dev.tensor_from_vec(vec![1.0f32, 2.0], &[2]).unwrap();
        let y = dev.alloc(crate::dtypes::DType::Float32, &[2]).unwrap();
        dev.secondary_stream().wait_for(dev.stream()).unwrap();
        dev.with_stream(secondary).copy(&t, &y).unwrap();
        driver.synchronize_stream(secondary).unwrap();
        assert_eq!(driver.pending(dev.stream()), 0);
        assert_eq!(dev.to_vec::<f32>(&y).unwrap(), [1.0, 2.0]);
    }

    #[test]
    fn test_creation_failure_is_stream_init() {
        let driver = Arc::new(HostDriver::default());
        let dev = Npu::new(driver.clone());
        driver.fail_on("aclrtCreateEvent");
        assert!(matches!(
            dev.secondary_stream().get(dev.stream()),
            Err(Error::StreamInit(_))
        ));
        assert!(!dev.secondary_stream().is_initialized());
        assert_eq!(driver.num_streams(), 1);

        driver.clear_faults();
        assert!(dev.secondary_stream().get(dev.stream()).is_ok());
        assert_eq!(driver.num_streams(), 2);
    }

    /// Delegates to a [HostDriver] and runs a callback right after the first event
    /// recorded on `trigger`, before control returns to the recording thread.
    struct RecordHook {
        inner: HostDriver,
        trigger: Stream,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl std::fmt::Debug for RecordHook {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RecordHook").field("inner", &self.inner).finish()
        }
    }

    impl Driver for RecordHook {
        fn name(&self) -> &'static str {
            "record-hook"
        }
        fn malloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
            self.inner.malloc(bytes)
        }
        fn free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
            self.inner.free(ptr)
        }
        fn memcpy_h2d_async(
            &self,
            dst: DevicePtr,
            src: Vec<u8>,
            stream: Stream,
        ) -> Result<(), DriverError> {
            self.inner.memcpy_h2d_async(dst, src, stream)
        }
        fn memcpy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
            self.inner.memcpy_d2h(dst, src)
        }
        fn memcpy_d2d_async(
            &self,
            dst: DevicePtr,
            src: DevicePtr,
            bytes: usize,
            stream: Stream,
        ) -> Result<(), DriverError> {
            self.inner.memcpy_d2d_async(dst, src, bytes, stream)
        }
        fn memset_async(
            &self,
            dst: DevicePtr,
            value: u8,
            bytes: usize,
            stream: Stream,
        ) -> Result<(), DriverError> {
            self.inner.memset_async(dst, value, bytes, stream)
        }
        fn create_tensor_desc(
            &self,
            dtype: AclDataType,
            dims: &[i64],
            format: Format,
        ) -> Result<DescHandle, DriverError> {
            self.inner.create_tensor_desc(dtype, dims, format)
        }
        fn set_tensor_placement(&self, desc: DescHandle, mem: MemType) -> Result<(), DriverError> {
            self.inner.set_tensor_placement(desc, mem)
        }
        fn set_tensor_const(&self, desc: DescHandle, data: &[u8]) -> Result<(), DriverError> {
            self.inner.set_tensor_const(desc, data)
        }
        fn set_tensor_name(&self, desc: DescHandle, name: &str) -> Result<(), DriverError> {
            self.inner.set_tensor_name(desc, name)
        }
        fn destroy_tensor_desc(&self, desc: DescHandle) -> Result<(), DriverError> {
            self.inner.destroy_tensor_desc(desc)
        }
        fn create_data_buffer(&self, data: BufferData<'_>) -> Result<BufferHandle, DriverError> {
            self.inner.create_data_buffer(data)
        }
        fn destroy_data_buffer(&self, buffer: BufferHandle) -> Result<(), DriverError> {
            self.inner.destroy_data_buffer(buffer)
        }
        fn create_op_attr(&self) -> Result<AttrHandle, DriverError> {
            self.inner.create_op_attr()
        }
        fn set_op_attr(
            &self,
            attr: AttrHandle,
            name: &str,
            value: &AttrValue,
        ) -> Result<(), DriverError> {
            self.inner.set_op_attr(attr, name, value)
        }
        fn destroy_op_attr(&self, attr: AttrHandle) -> Result<(), DriverError> {
            self.inner.destroy_op_attr(attr)
        }
        fn execute(&self, launch: &OpLaunch<'_>, stream: Stream) -> Result<(), DriverError> {
            self.inner.execute(launch, stream)
        }
        fn create_stream(&self) -> Result<Stream, DriverError> {
            self.inner.create_stream()
        }
        fn destroy_stream(&self, stream: Stream) -> Result<(), DriverError> {
            self.inner.destroy_stream(stream)
        }
        fn synchronize_stream(&self, stream: Stream) -> Result<(), DriverError> {
            self.inner.synchronize_stream(stream)
        }
        fn create_event(&self) -> Result<Event, DriverError> {
            self.inner.create_event()
        }
        fn destroy_event(&self, event: Event) -> Result<(), DriverError> {
            self.inner.destroy_event(event)
        }
        fn record_event(&self, event: Event, stream: Stream) -> Result<(), DriverError> {
            self.inner.record_event(event, stream)?;
            if stream == self.trigger {
                let hook = self.hook.lock().unwrap().take();
                if let Some(hook) = hook {
                    hook();
                }
            }
            Ok(())
        }
        fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<(), DriverError> {
            self.inner.stream_wait_event(stream, event)
        }
    }

    #[test]
    fn test_concurrent_wait_for_keeps_each_main_stream() {
        let driver = Arc::new(RecordHook {
            inner: HostDriver::default(),
            trigger: Stream::DEFAULT,
            hook: Mutex::new(None),
        });
        let dev = Npu::new(driver.clone());
        let other = dev.with_stream(dev.create_stream().unwrap());
        let secondary = dev.secondary_stream().get(dev.stream()).unwrap();

        let x = dev.tensor_from_vec(vec![7.0f32, 8.0], &[2]).unwrap();
        let y = dev.alloc(crate::dtypes::DType::Float32, &[2]).unwrap();

        // another thread joins its own main stream while this one sits between the
        // record and the wait
        let (started_tx, started_rx) = mpsc::channel();
        let (racer_tx, racer_rx) = mpsc::channel();
        *driver.hook.lock().unwrap() = Some(Box::new(move || {
            let racer = thread::spawn(move || {
                started_tx.send(()).unwrap();
                other.secondary_stream().wait_for(other.stream())
            });
            started_rx.recv().unwrap();
            thread::sleep(Duration::from_millis(50));
            racer_tx.send(racer).unwrap();
        }));

        dev.secondary_stream().wait_for(dev.stream()).unwrap();
        racer_rx.recv().unwrap().join().unwrap().unwrap();

        dev.with_stream(secondary).copy(&x, &y).unwrap();
        driver.synchronize_stream(secondary).unwrap();
        assert_eq!(dev.to_vec::<f32>(&y).unwrap(), [7.0, 8.0]);
    }
}
