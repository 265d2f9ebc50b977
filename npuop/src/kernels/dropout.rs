//! Dropout forward and backward on the NPU.
//!
//! Training mode generates a packed keep mask with `DropOutGenMask` on the device's
//! secondary stream and applies it with `DropOutDoMask` on the main stream. The mask
//! holds one bit per element, least significant bit first, padded to a multiple of
//! 128 bits; see [mask_len].

use std::str::FromStr;

use crate::attr::AttributeMap;
use crate::dtypes::DType;
use crate::runner::OpRunner;
use crate::tensor::{Npu, Tensor};
use crate::tensor_ops::mask_len;
use crate::{Error, OpAttrs};

/// The framework's `dropout_implementation` attribute.
///
/// Only upscale-in-train is computed: training output is `x * mask / keep` and
/// inference output is `x`. `DowngradeInInfer` is parsed so callers can pass the
/// attribute through, and runs the same way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DropoutMode {
    #[default]
    UpscaleInTrain,
    DowngradeInInfer,
}

impl FromStr for DropoutMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upscale_in_train" => Ok(Self::UpscaleInTrain),
            "downgrade_in_infer" => Ok(Self::DowngradeInInfer),
            other => Err(Error::InvalidArgument(format!("unknown dropout mode `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutKernelOp {
    /// Probability of dropping an element.
    pub p: f32,
    pub is_test: bool,
    pub mode: DropoutMode,
    /// Only used with `fix_seed` and no seed tensor.
    pub seed: i32,
    pub fix_seed: bool,
}

impl Default for DropoutKernelOp {
    fn default() -> Self {
        Self {
            p: 0.5,
            is_test: false,
            mode: DropoutMode::UpscaleInTrain,
            seed: 0,
            fix_seed: false,
        }
    }
}

impl DropoutKernelOp {
    pub fn keep_prob(&self) -> f32 {
        1.0 - self.p
    }

    fn check(&self, dtype: DType) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.p) {
            return Err(Error::InvalidArgument(format!(
                "dropout probability {} is outside [0, 1]",
                self.p
            )));
        }
        match dtype {
            DType::Float16 | DType::Float32 | DType::Float64 => Ok(()),
            other => Err(Error::UnsupportedDtype(other)),
        }
    }
}

#[derive(OpAttrs)]
struct GenMaskAttrs {
    seed: i32,
    seed2: i32,
}

pub trait DropoutKernel {
    /// Writes the dropout of `x` into `out`, sizing it like `x`. In training mode `mask`
    /// is sized to [mask_len] bytes and receives the keep bits; in inference mode it is
    /// left alone.
    ///
    /// The seed is read from `seed_tensor` (one `i32`) when given. Otherwise it is
    /// `op.seed` with `op.fix_seed`, or unseeded.
    fn forward(
        &self,
        op: &DropoutKernelOp,
        x: &Tensor,
        seed_tensor: Option<&Tensor>,
        out: &mut Tensor,
        mask: &mut Tensor,
    ) -> Result<(), Error>;

    /// Writes the gradient of the input into `grad_inp` from the `mask` the forward
    /// pass produced. The mask is not regenerated.
    fn backward(
        &self,
        op: &DropoutKernelOp,
        mask: &Tensor,
        grad_out: &Tensor,
        grad_inp: &mut Tensor,
    ) -> Result<(), Error>;
}

/// The driver's mask operations misbehave on rank-1 input, so vectors run as columns.
fn at_least_2d(t: &Tensor) -> Result<Tensor, Error> {
    if t.rank() >= 2 {
        Ok(t.clone())
    } else {
        t.reshaped(&[t.numel(), 1])
    }
}

fn read_seed(
    npu: &Npu,
    op: &DropoutKernelOp,
    seed_tensor: Option<&Tensor>,
) -> Result<i32, Error> {
    match seed_tensor {
        Some(t) => npu
            .to_vec::<i32>(t)?
            .first()
            .copied()
            .ok_or_else(|| Error::InvalidArgument("empty seed tensor".into())),
        None if op.fix_seed => Ok(op.seed),
        None => Ok(0),
    }
}

impl DropoutKernel for Npu {
    fn forward(
        &self,
        op: &DropoutKernelOp,
        x: &Tensor,
        seed_tensor: Option<&Tensor>,
        out: &mut Tensor,
        mask: &mut Tensor,
    ) -> Result<(), Error> {
        op.check(x.dtype())?;
        self.ensure_alloc(out, x.dtype(), x.shape())?;
        if !op.is_test {
            self.ensure_alloc(mask, DType::UInt8, &[mask_len(x.numel())])?;
        }

        if op.p == 1.0 {
            tracing::debug!(numel = x.numel(), "dropout forward drops everything");
            self.zeros_like(out, out)?;
            if !op.is_test {
                self.memset_zero(mask)?;
            }
            return Ok(());
        }

        if op.is_test {
            tracing::debug!(mode = ?op.mode, "dropout forward in inference mode");
            return self.copy(x, out);
        }

        let keep = op.keep_prob();
        let seed = read_seed(self, op, seed_tensor)?;
        let x2 = at_least_2d(x)?;
        let out2 = at_least_2d(out)?;
        let shape: Vec<i64> = out2.shape().iter().map(|&d| d as i64).collect();
        let compute = x.dtype().mask_compute_dtype();

        OpRunner::type_adapter(
            &[x2, mask.clone()],
            &[out2],
            &AttributeMap::new(),
            self,
            |inputs, outputs, _, npu| {
                let (x, mask, out) = (&inputs[0], &inputs[1], &outputs[0]);
                let secondary = npu.secondary_stream();
                let side = secondary.get(npu.stream())?;
                // the mask buffer may still be read by earlier main stream work
                secondary.wait_for(npu.stream())?;

                let keep_prob = npu.alloc(x.dtype(), &[])?;
                npu.with_stream(side).fill(&keep_prob, keep as f64)?;

                OpRunner::new(npu, "DropOutGenMask")
                    .add_host_input(shape, true)?
                    .add_input(&keep_prob)?
                    .add_output(mask)?
                    .add_attrs(GenMaskAttrs { seed, seed2: 0 })?
                    .run(Some(side), false)?;
                secondary.record_before(npu.stream())?;

                OpRunner::new(npu, "DropOutDoMask")
                    .add_input(x)?
                    .add_input(mask)?
                    .add_input(&keep_prob)?
                    .add_output(out)?
                    .run(Some(npu.stream()), false)
            },
            &[Some(compute), None],
            &[Some(compute)],
        )
    }

    fn backward(
        &self,
        op: &DropoutKernelOp,
        mask: &Tensor,
        grad_out: &Tensor,
        grad_inp: &mut Tensor,
    ) -> Result<(), Error> {
        op.check(grad_out.dtype())?;
        self.ensure_alloc(grad_inp, grad_out.dtype(), grad_out.shape())?;

        if op.p == 1.0 {
            tracing::debug!(numel = grad_out.numel(), "dropout backward drops everything");
            return self.zeros_like(grad_inp, grad_inp);
        }

        if op.is_test {
            return self.copy(grad_out, grad_inp);
        }

        let expected = mask_len(grad_out.numel());
        if mask.dtype() != DType::UInt8 || mask.num_bytes() != expected {
            return Err(Error::InvalidArgument(format!(
                "mask of {} {:?} elements does not match a gradient of {} elements \
                 ({expected} bytes expected)",
                mask.numel(),
                mask.dtype(),
                grad_out.numel()
            )));
        }

        let keep = op.keep_prob();
        let compute = grad_out.dtype().mask_compute_dtype();
        OpRunner::type_adapter(
            &[at_least_2d(grad_out)?, mask.clone()],
            &[at_least_2d(grad_inp)?],
            &AttributeMap::new(),
            self,
            |inputs, outputs, _, npu| {
                let keep_prob = npu.alloc(inputs[0].dtype(), &[1])?;
                npu.fill(&keep_prob, keep as f64)?;
                OpRunner::new(npu, "DropOutDoMask")
                    .add_inputs(inputs)?
                    .add_input(&keep_prob)?
                    .add_output(&outputs[0])?
                    .run(Some(npu.stream()), false)
            },
            &[Some(compute), None],
            &[Some(compute)],
        )
    }
}

/// Runs [DropoutKernel::forward] into fresh tensors and returns `(out, mask)`. The mask
/// is unallocated in inference mode.
///
/// ```rust
/// # use npuop::prelude::*;
/// let dev: Npu = Default::default();
/// let x = dev.tensor_from_vec(vec![1.0f32, 2.0, 3.0], &[3])?;
/// let op = DropoutKernelOp { is_test: true, ..Default::default() };
/// let (out, mask) = dropout(&dev, &x, &op)?;
/// assert_eq!(dev.to_vec::<f32>(&out)?, [1.0, 2.0, 3.0]);
/// assert!(!mask.is_allocated());
/// # Ok::<(), npuop::Error>(())
/// ```
pub fn dropout(npu: &Npu, x: &Tensor, op: &DropoutKernelOp) -> Result<(Tensor, Tensor), Error> {
    let mut out = Tensor::empty(x.dtype());
    let mut mask = Tensor::empty(DType::UInt8);
    npu.forward(op, x, None, &mut out, &mut mask)?;
    Ok((out, mask))
}

/// Runs [DropoutKernel::backward] into a fresh tensor.
pub fn dropout_grad(
    npu: &Npu,
    mask: &Tensor,
    grad_out: &Tensor,
    op: &DropoutKernelOp,
) -> Result<Tensor, Error> {
    let mut grad_inp = Tensor::empty(grad_out.dtype());
    npu.backward(op, mask, grad_out, &mut grad_inp)?;
    Ok(grad_inp)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::{HostDriver, LiveHandles};
    use crate::dtypes::f16;

    fn setup() -> (Arc<HostDriver>, Npu) {
        let driver = Arc::new(HostDriver::seed_from_u64(0));
        let npu = Npu::new(driver.clone());
        (driver, npu)
    }

    fn bit(mask: &[u8], i: usize) -> bool {
        mask[i / 8] & (1 << (i % 8)) != 0
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!(
            "upscale_in_train".parse::<DropoutMode>().unwrap(),
            DropoutMode::UpscaleInTrain
        );
        assert_eq!(
            "downgrade_in_infer".parse::<DropoutMode>().unwrap(),
            DropoutMode::DowngradeInInfer
        );
        assert!(matches!("upscale".parse::<DropoutMode>(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_drop_everything_zeros_out_and_mask() {
        let (driver, dev) = setup();
        let x = dev.tensor_from_vec(vec![f16::ONE; 6], &[2, 3]).unwrap();
        let op = DropoutKernelOp { p: 1.0, ..Default::default() };
        let (out, mask) = dropout(&dev, &x, &op).unwrap();
        assert_eq!(dev.to_vec::<f16>(&out).unwrap(), [f16::ZERO; 6]);
        assert_eq!(dev.to_vec::<u8>(&mask).unwrap(), [0; 16]);
        assert!(driver.history().iter().all(|op| op.op_type == "ZerosLike"));
        assert!(!dev.secondary_stream().is_initialized());
    }

    #[test]
    fn test_drop_everything_in_inference_leaves_mask() {
        let (_driver, dev) = setup();
        let x = dev.tensor_from_vec(vec![1.0f32; 3], &[3]).unwrap();
        let op = DropoutKernelOp { p: 1.0, is_test: true, ..Default::default() };
        let (out, mask) = dropout(&dev, &x, &op).unwrap();
        assert_eq!(dev.to_vec::<f32>(&out).unwrap(), [0.0; 3]);
        assert!(!mask.is_allocated());
    }

    #[test]
    fn test_inference_copies_in_every_mode() {
        let (driver, dev) = setup();
        let x = dev.tensor_from_vec(vec![2.0f32, -4.0], &[2]).unwrap();
        for mode in [DropoutMode::UpscaleInTrain, DropoutMode::DowngradeInInfer] {
            let op = DropoutKernelOp { p: 0.25, is_test: true, mode, ..Default::default() };
            let (out, mask) = dropout(&dev, &x, &op).unwrap();
            assert_eq!(dev.to_vec::<f32>(&out).unwrap(), [2.0, -4.0]);
            assert!(!mask.is_allocated());

            let dx = dropout_grad(&dev, &mask, &x, &op).unwrap();
            assert_eq!(dev.to_vec::<f32>(&dx).unwrap(), [2.0, -4.0]);
        }
        assert!(driver.history().iter().all(|op| op.op_type != "Muls"));
    }

    #[test]
    fn test_training_f32_applies_mask() {
        let (driver, dev) = setup();
        let data: Vec<f32> = (0..20).map(|i| i as f32 - 7.5).collect();
        let x = dev.tensor_from_vec(data.clone(), &[4, 5]).unwrap();
        let op = DropoutKernelOp { p: 0.2, fix_seed: true, seed: 3, ..Default::default() };
        let (out, mask) = dropout(&dev, &x, &op).unwrap();

        let y = dev.to_vec::<f32>(&out).unwrap();
        let m = dev.to_vec::<u8>(&mask).unwrap();
        assert_eq!(m.len(), 16);
        for (i, (x, y)) in data.iter().zip(&y).enumerate() {
            let expected = if bit(&m, i) { x / 0.8 } else { 0.0 };
            assert_eq!(*y, expected);
        }
        assert!(m[3..].iter().all(|b| *b == 0));

        let ops: Vec<String> = driver.history().into_iter().map(|op| op.op_type).collect();
        assert_eq!(ops, ["DropOutGenMask", "DropOutDoMask"]);
        assert_eq!(driver.history()[0].stream, dev.secondary_stream().get(dev.stream()).unwrap());
        assert_eq!(driver.history()[1].stream, dev.stream());
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let (_driver, dev) = setup();
        let x = dev.tensor_from_vec(vec![1.0f32; 300], &[10, 30]).unwrap();
        let op = DropoutKernelOp { fix_seed: true, seed: 42, ..Default::default() };
        let (_, a) = dropout(&dev, &x, &op).unwrap();
        let (_, b) = dropout(&dev, &x, &op).unwrap();
        assert_eq!(dev.to_vec::<u8>(&a).unwrap(), dev.to_vec::<u8>(&b).unwrap());
    }

    #[test]
    fn test_seed_tensor_overrides_attribute() {
        let (_driver, dev) = setup();
        let x = dev.tensor_from_vec(vec![1.0f32; 300], &[300, 1]).unwrap();
        let seed = dev.tensor_from_vec(vec![42i32], &[1]).unwrap();
        let from_tensor = DropoutKernelOp { fix_seed: true, seed: 7, ..Default::default() };
        let from_attr = DropoutKernelOp { fix_seed: true, seed: 42, ..Default::default() };

        let (mut out, mut a) = (Tensor::empty(DType::Float32), Tensor::empty(DType::UInt8));
        dev.forward(&from_tensor, &x, Some(&seed), &mut out, &mut a).unwrap();
        let (_, b) = dropout(&dev, &x, &from_attr).unwrap();
        assert_eq!(dev.to_vec::<u8>(&a).unwrap(), dev.to_vec::<u8>(&b).unwrap());
    }

    #[test]
    fn test_rejects_bad_probability_and_dtype() {
        let (_driver, dev) = setup();
        let x = dev.tensor_from_vec(vec![1.0f32; 2], &[2]).unwrap();
        let op = DropoutKernelOp { p: 1.5, ..Default::default() };
        assert!(matches!(dropout(&dev, &x, &op), Err(Error::InvalidArgument(_))));

        let x = dev.tensor_from_vec(vec![1i32; 2], &[2]).unwrap();
        assert!(matches!(
            dropout(&dev, &x, &Default::default()),
            Err(Error::UnsupportedDtype(DType::Int32))
        ));
    }

    #[test]
    fn test_backward_mask_mismatch() {
        let (_driver, dev) = setup();
        let grad = dev.tensor_from_vec(vec![1.0f32; 200], &[200]).unwrap();
        let mask = dev.tensor_from_vec(vec![0xffu8; 16], &[16]).unwrap();
        let result = dropout_grad(&dev, &mask, &grad, &Default::default());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_backward_inference_is_identity() {
        let (_driver, dev) = setup();
        let grad = dev.tensor_from_vec(vec![1.0f32, 2.0], &[2]).unwrap();
        let op = DropoutKernelOp { is_test: true, ..Default::default() };
        let dx = dropout_grad(&dev, &Tensor::empty(DType::UInt8), &grad, &op).unwrap();
        assert_eq!(dev.to_vec::<f32>(&dx).unwrap(), [1.0, 2.0]);
    }

    #[test]
    fn test_no_handles_leak() {
        let (driver, dev) = setup();
        {
            let x = dev.tensor_from_vec(vec![0.5f64; 10], &[10]).unwrap();
            let (out, mask) = dropout(&dev, &x, &Default::default()).unwrap();
            let dx = dropout_grad(&dev, &mask, &out, &Default::default()).unwrap();
            dev.synchronize().unwrap();
            drop((x, out, mask, dx));
        }
        assert_eq!(driver.live_handles(), LiveHandles::default());
    }
}
