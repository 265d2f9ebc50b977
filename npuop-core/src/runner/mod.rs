//! [OpRunner] assembles one named hardware operation and submits it onto a stream.
//!
//! A runner owns every driver object it creates (descriptors, data buffers, the
//! attribute set and any host tensors) and releases them exactly once when dropped,
//! whether or not [OpRunner::run] was called or succeeded. It is deliberately not
//! `Clone`: a copy would own the same driver handles twice.
//!
//! Example:
//! ```rust
//! # use npuop_core::prelude::*;
//! let npu: Npu = Default::default();
//! let x = npu.tensor_from_vec(vec![1.0f64, 2.0], &[2])?;
//! let y = npu.alloc(DType::Float32, &[2])?;
//! let mut runner = OpRunner::new(&npu, "Cast");
//! runner
//!     .add_input(&x)?
//!     .add_output(&y)?
//!     .add_attr_dtype("dst_type", DType::Float32)?;
//! assert_eq!(runner.input_descs().len(), 1);
//! runner.run(Some(npu.stream()), true)?;
//! assert_eq!(npu.to_vec::<f32>(&y)?, [1.0, 2.0]);
//! # Ok::<(), npuop_core::Error>(())
//! ```

mod descriptor;
mod float_status;
mod type_adapter;

use std::sync::Arc;

use crate::attr::{AttrValue, AttributeMap, IntoAttributeMap};
use crate::driver::{AttrHandle, BufferHandle, DescHandle, Driver, OpLaunch, Stream};
use crate::dtypes::{DType, MemType, Unit};
use crate::tensor::{HostTensor, Npu, Tensor};
use crate::Error;

use descriptor::{describe, describe_host, OpAttr, Operand};

/// Builder and executor of one hardware operation. See the [module docs](self).
#[derive(Debug)]
pub struct OpRunner {
    driver: Arc<dyn Driver>,
    op_type: String,
    inputs: Vec<Operand>,
    outputs: Vec<Operand>,
    attr: Option<OpAttr>,
    attrs: AttributeMap,
    host_tensors: Vec<HostTensor>,
}

impl OpRunner {
    pub fn new(npu: &Npu, op_type: impl Into<String>) -> Self {
        Self {
            driver: npu.driver.clone(),
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attr: None,
            attrs: AttributeMap::new(),
            host_tensors: Vec::new(),
        }
    }

    /// A runner with its inputs, outputs and attributes already added.
    pub fn with_io(
        npu: &Npu,
        op_type: impl Into<String>,
        inputs: &[Tensor],
        outputs: &[Tensor],
        attrs: impl IntoAttributeMap,
    ) -> Result<Self, Error> {
        let mut runner = Self::new(npu, op_type);
        runner
            .add_inputs(inputs)?
            .add_outputs(outputs)?
            .add_attrs(attrs)?;
        Ok(runner)
    }

    pub fn set_type(&mut self, op_type: impl Into<String>) -> &mut Self {
        self.op_type = op_type.into();
        self
    }

    fn attr_handle(&mut self) -> Result<AttrHandle, Error> {
        if let Some(attr) = &self.attr {
            return Ok(attr.handle);
        }
        let attr = OpAttr::new(&self.driver)?;
        let handle = attr.handle;
        self.attr = Some(attr);
        Ok(handle)
    }

    /// Sets an attribute. Setting the same name again overwrites it.
    pub fn add_attr(
        &mut self,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> Result<&mut Self, Error> {
        let value = value.into();
        let handle = self.attr_handle()?;
        self.driver.set_op_attr(handle, name, &value)?;
        self.attrs.insert(name.to_string(), value);
        Ok(self)
    }

    /// Sets an attribute to the accelerator code of `dtype`.
    pub fn add_attr_dtype(&mut self, name: &str, dtype: DType) -> Result<&mut Self, Error> {
        let code = dtype.to_acl()?.code();
        self.add_attr(name, code)
    }

    pub fn add_attrs(&mut self, attrs: impl IntoAttributeMap) -> Result<&mut Self, Error> {
        for (name, value) in attrs.into_attribute_map() {
            self.add_attr(&name, value)?;
        }
        Ok(self)
    }

    /// Appends a device resident input. Order must match the operation's signature.
    pub fn add_input(&mut self, tensor: &Tensor) -> Result<&mut Self, Error> {
        self.add_input_with(tensor, MemType::Device)
    }

    pub fn add_input_with(&mut self, tensor: &Tensor, mem: MemType) -> Result<&mut Self, Error> {
        self.inputs.push(describe(&self.driver, tensor, mem)?);
        Ok(self)
    }

    /// Appends a 1-D input materialized on the host from `values`, e.g. a shape argument.
    /// With `is_const` the driver may fold it in at compile time. The host copy lives
    /// as long as the runner.
    pub fn add_host_input<E: Unit>(
        &mut self,
        values: Vec<E>,
        is_const: bool,
    ) -> Result<&mut Self, Error> {
        let host = HostTensor::from_vec(values);
        let operand = describe_host(&self.driver, &host, is_const)?;
        self.host_tensors.push(host);
        self.inputs.push(operand);
        Ok(self)
    }

    pub fn add_output(&mut self, tensor: &Tensor) -> Result<&mut Self, Error> {
        self.outputs.push(describe(&self.driver, tensor, MemType::Device)?);
        Ok(self)
    }

    pub fn add_inputs(&mut self, tensors: &[Tensor]) -> Result<&mut Self, Error> {
        for t in tensors {
            self.add_input(t)?;
        }
        Ok(self)
    }

    pub fn add_outputs(&mut self, tensors: &[Tensor]) -> Result<&mut Self, Error> {
        for t in tensors {
            self.add_output(t)?;
        }
        Ok(self)
    }

    /// Names the input descriptors, in order. Needs one name per input.
    pub fn add_input_names(&mut self, names: &[&str]) -> Result<&mut Self, Error> {
        if names.len() != self.inputs.len() {
            return Err(Error::InvalidArgument(format!(
                "{} names for {} inputs",
                names.len(),
                self.inputs.len()
            )));
        }
        for (name, input) in names.iter().zip(&self.inputs) {
            self.driver
                .set_tensor_name(input.desc.handle, name)
                .map_err(Error::DescriptorCreation)?;
        }
        Ok(self)
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn attrs(&self) -> &AttributeMap {
        &self.attrs
    }

    pub fn input_descs(&self) -> Vec<DescHandle> {
        self.inputs.iter().map(|o| o.desc.handle).collect()
    }

    pub fn output_descs(&self) -> Vec<DescHandle> {
        self.outputs.iter().map(|o| o.desc.handle).collect()
    }

    pub fn input_buffers(&self) -> Vec<BufferHandle> {
        self.inputs.iter().map(|o| o.buffer.handle).collect()
    }

    pub fn output_buffers(&self) -> Vec<BufferHandle> {
        self.outputs.iter().map(|o| o.buffer.handle).collect()
    }

    pub fn input_desc(&self, index: usize) -> Option<DescHandle> {
        self.inputs.get(index).map(|o| o.desc.handle)
    }

    pub fn output_desc(&self, index: usize) -> Option<DescHandle> {
        self.outputs.get(index).map(|o| o.desc.handle)
    }

    pub fn attr(&self) -> Option<AttrHandle> {
        self.attr.as_ref().map(|a| a.handle)
    }

    fn trace_op_info(&self) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        tracing::trace!(op_type = %self.op_type, attrs = ?self.attrs, "op info");
        for (index, input) in self.inputs.iter().enumerate() {
            let (dtype, dims, mem) = (input.dtype, &input.dims, input.mem);
            tracing::trace!(index, ?dtype, ?dims, ?mem, "input");
        }
        for (index, output) in self.outputs.iter().enumerate() {
            tracing::trace!(index, dtype = ?output.dtype, dims = ?output.dims, "output");
        }
    }

    /// Enqueues the operation on `stream` (the default stream if `None`).
    ///
    /// Returns right after the enqueue unless `sync` is set, in which case it blocks
    /// until the stream drained. Rejections surface as [Error::DriverSubmission] and are
    /// not retried.
    pub fn run(&self, stream: Option<Stream>, sync: bool) -> Result<(), Error> {
        let stream = stream.unwrap_or(Stream::DEFAULT);
        tracing::debug!(
            op_type = %self.op_type,
            ?stream,
            sync,
            inputs = self.inputs.len(),
            outputs = self.outputs.len(),
            "run"
        );
        self.trace_op_info();

        let submission = |source| Error::DriverSubmission {
            op_type: self.op_type.clone(),
            source,
        };
        let empty_attr;
        let attr = match &self.attr {
            Some(attr) => attr.handle,
            None => {
                empty_attr = OpAttr::new(&self.driver)?;
                empty_attr.handle
            }
        };
        let input_descs = self.input_descs();
        let inputs = self.input_buffers();
        let output_descs = self.output_descs();
        let outputs = self.output_buffers();
        let launch = OpLaunch {
            op_type: &self.op_type,
            input_descs: &input_descs,
            inputs: &inputs,
            output_descs: &output_descs,
            outputs: &outputs,
            attr,
        };
        self.driver.execute(&launch, stream).map_err(submission)?;
        if sync {
            self.driver.synchronize_stream(stream).map_err(submission)?;
        }
        Ok(())
    }
}
