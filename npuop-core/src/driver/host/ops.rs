//! Reference kernels of the simulated accelerator.
//!
//! [validate] runs when an operation is enqueued and mirrors the checks the real driver
//! does at compile time of the op. [run] runs when the stream is drained.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::Bernoulli;

use super::{DescInfo, HostState, Launch, Operand, Source};
use crate::attr::AttrValue;
use crate::driver::codes;
use crate::dtypes::{decode, encode, AclDataType};
use crate::tensor_ops::mask_len;

type Rejection = (i32, String);

fn reject<T>(detail: impl Into<String>) -> Result<T, Rejection> {
    Err((codes::INVALID_PARAM, detail.into()))
}

fn arity(launch: &Launch, inputs: usize, outputs: usize) -> Result<(), Rejection> {
    if launch.inputs.len() != inputs || launch.outputs.len() != outputs {
        return reject(format!(
            "expected {inputs} inputs and {outputs} outputs, got {} and {}",
            launch.inputs.len(),
            launch.outputs.len()
        ));
    }
    Ok(())
}

fn attr<'a>(launch: &'a Launch, name: &str) -> Result<&'a AttrValue, Rejection> {
    launch
        .attrs
        .get(name)
        .ok_or_else(|| (codes::INVALID_PARAM, format!("missing attribute `{name}`")))
}

fn same_numel(a: &DescInfo, b: &DescInfo) -> Result<(), Rejection> {
    if a.numel() != b.numel() {
        return reject(format!("shape mismatch {:?} vs {:?}", a.dims, b.dims));
    }
    Ok(())
}

fn is_scalar_float(desc: &DescInfo) -> bool {
    desc.numel() == 1 && desc.dtype.to_dtype().is_float()
}

pub(super) fn validate(launch: &Launch) -> Result<(), Rejection> {
    let (ins, outs) = (&launch.inputs, &launch.outputs);
    match launch.op_type.as_str() {
        "Cast" => {
            arity(launch, 1, 1)?;
            same_numel(&ins[0].desc, &outs[0].desc)?;
            let dst = attr(launch, "dst_type")?;
            let Some(code) = dst.as_i64() else {
                return reject(format!("attribute `dst_type` must be an int, got {}", dst.kind()));
            };
            match AclDataType::from_code(code) {
                Some(dtype) if dtype == outs[0].desc.dtype => {}
                Some(dtype) => {
                    return reject(format!(
                        "dst_type {dtype:?} does not match output {:?}",
                        outs[0].desc.dtype
                    ))
                }
                None => return reject(format!("unknown dst_type code {code}")),
            }
        }
        "ZerosLike" => {
            arity(launch, 1, 1)?;
            same_numel(&ins[0].desc, &outs[0].desc)?;
        }
        "Muls" => {
            arity(launch, 1, 1)?;
            same_numel(&ins[0].desc, &outs[0].desc)?;
            if ins[0].desc.dtype != outs[0].desc.dtype {
                return reject("input and output dtypes differ");
            }
            let value = attr(launch, "value")?;
            if value.as_f32().is_none() {
                return reject(format!("attribute `value` must be a float, got {}", value.kind()));
            }
        }
        "DropOutGenMask" => {
            arity(launch, 2, 1)?;
            let shape = &ins[0].desc;
            let integral = matches!(shape.dtype, AclDataType::Int32 | AclDataType::Int64);
            if !integral || shape.dims.len() != 1 {
                return reject("shape must be a 1-D integer tensor");
            }
            if !is_scalar_float(&ins[1].desc) {
                return reject("prob must be a single float");
            }
            if outs[0].desc.dtype != AclDataType::Uint8 {
                return reject("mask must be uint8");
            }
            for name in ["seed", "seed2"] {
                if let Some(v) = launch.attrs.get(name) {
                    if v.as_i64().is_none() {
                        let kind = v.kind();
                        return reject(format!("attribute `{name}` must be an int, got {kind}"));
                    }
                }
            }
        }
        "DropOutDoMask" => {
            arity(launch, 3, 1)?;
            let x = &ins[0].desc;
            if !matches!(x.dtype, AclDataType::Float16 | AclDataType::Float) {
                return reject(format!("unsupported dtype {:?}", x.dtype));
            }
            if x.dims.len() < 2 {
                return reject(format!("input of rank {} is not supported", x.dims.len()));
            }
            if ins[1].desc.dtype != AclDataType::Uint8 {
                return reject("mask must be uint8");
            }
            if ins[1].desc.numel() < mask_len(x.numel()) {
                return reject(format!(
                    "mask of {} bytes is too small for {} elements",
                    ins[1].desc.numel(),
                    x.numel()
                ));
            }
            if ins[2].desc.dtype != x.dtype || ins[2].desc.numel() != 1 {
                return reject("keep_prob must be a single element of the input dtype");
            }
            if outs[0].desc.dtype != x.dtype {
                return reject("input and output dtypes differ");
            }
            same_numel(x, &outs[0].desc)?;
        }
        "NPUAllocFloatStatus" => {
            arity(launch, 0, 1)?;
        }
        "NPUGetFloatStatus" | "NPUClearFloatStatus" => {
            arity(launch, 1, 1)?;
        }
        other => return Err((codes::OP_NOT_FOUND, format!("unknown op `{other}`"))),
    }
    for operand in outs {
        if matches!(operand.data, Source::Host(_)) {
            return reject("outputs must live on the device");
        }
    }
    Ok(())
}

impl HostState {
    fn fetch(&self, operand: &Operand) -> Result<Vec<u8>, String> {
        match &operand.data {
            Source::Host(bytes) => Ok(bytes.clone()),
            Source::Device { ptr: Some(ptr), bytes } => self.read(*ptr, *bytes),
            Source::Device { ptr: None, .. } => Ok(Vec::new()),
        }
    }

    fn fetch_values(&self, operand: &Operand) -> Result<Vec<f64>, String> {
        let bytes = self.fetch(operand)?;
        decode(operand.desc.dtype.to_dtype(), &bytes).map_err(|e| e.to_string())
    }

    fn store(&mut self, operand: &Operand, bytes: &[u8]) -> Result<(), String> {
        match &operand.data {
            Source::Device { ptr: Some(ptr), .. } => self.write(*ptr, bytes),
            Source::Device { ptr: None, .. } if bytes.is_empty() => Ok(()),
            _ => Err("output has no device memory".to_string()),
        }
    }

    fn store_values(&mut self, operand: &Operand, values: &[f64]) -> Result<(), String> {
        let bytes = encode(operand.desc.dtype.to_dtype(), values).map_err(|e| e.to_string())?;
        self.store(operand, &bytes)
    }

    /// Writes `values` in the output's dtype. Narrowing finite `input` to a non finite
    /// result raises the float exception register.
    fn store_narrowed(
        &mut self,
        operand: &Operand,
        input: &[f64],
        values: &[f64],
    ) -> Result<(), String> {
        let dtype = operand.desc.dtype.to_dtype();
        let bytes = encode(dtype, values).map_err(|e| e.to_string())?;
        let narrowed = decode(dtype, &bytes).map_err(|e| e.to_string())?;
        self.track_overflow(input, &narrowed);
        self.store(operand, &bytes)
    }

    /// Raises the float exception register when finite inputs produced a non finite result.
    fn track_overflow(&mut self, input: &[f64], output: &[f64]) {
        if input.iter().all(|x| x.is_finite()) && output.iter().any(|y| !y.is_finite()) {
            self.float_status = true;
        }
    }
}

/// `x / keep` rounded like a kernel computing in single precision.
fn upscale(x: f64, keep: f64) -> f64 {
    (x as f32 / keep as f32) as f64
}

fn gen_mask(rng: &mut StdRng, numel: usize, keep: f64) -> Result<Vec<u8>, String> {
    let bernoulli = Bernoulli::new(keep).map_err(|e| format!("prob {keep}: {e}"))?;
    let mut mask = vec![0u8; mask_len(numel)];
    for i in 0..numel {
        if rng.sample(bernoulli) {
            mask[i / 8] |= 1 << (i % 8);
        }
    }
    Ok(mask)
}

pub(super) fn run(state: &mut HostState, launch: &Launch) -> Result<(), String> {
    let (ins, outs) = (&launch.inputs, &launch.outputs);
    match launch.op_type.as_str() {
        "Cast" => {
            let x = state.fetch_values(&ins[0])?;
            state.store_narrowed(&outs[0], &x, &x)
        }
        "ZerosLike" => {
            let bytes = outs[0].desc.numel() * outs[0].desc.dtype.size_of();
            state.store(&outs[0], &vec![0; bytes])
        }
        "Muls" => {
            let value = launch
                .attrs
                .get("value")
                .and_then(AttrValue::as_f32)
                .unwrap_or_default() as f64;
            let x = state.fetch_values(&ins[0])?;
            let y: Vec<f64> = x.iter().map(|v| v * value).collect();
            state.store_narrowed(&outs[0], &x, &y)
        }
        "DropOutGenMask" => {
            let shape = state.fetch_values(&ins[0])?;
            let numel = shape.iter().map(|d| *d as usize).product::<usize>();
            let keep = state.fetch_values(&ins[1])?.first().copied().unwrap_or_default();
            let read_seed =
                |name: &str| launch.attrs.get(name).and_then(AttrValue::as_i64).unwrap_or(0);
            let (seed, seed2) = (read_seed("seed"), read_seed("seed2"));
            let mask = if seed == 0 && seed2 == 0 {
                gen_mask(&mut state.rng, numel, keep)?
            } else {
                let seed = ((seed as u64) << 32) | (seed2 as u32 as u64);
                gen_mask(&mut StdRng::seed_from_u64(seed), numel, keep)?
            };
            if outs[0].desc.numel() < mask.len() {
                return Err(format!(
                    "mask output of {} bytes, {} needed",
                    outs[0].desc.numel(),
                    mask.len()
                ));
            }
            state.store(&outs[0], &mask)
        }
        "DropOutDoMask" => {
            let x = state.fetch_values(&ins[0])?;
            let mask = state.fetch(&ins[1])?;
            let keep = state.fetch_values(&ins[2])?.first().copied().unwrap_or_default();
            let y: Vec<f64> = x
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    if mask.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0) {
                        upscale(*v, keep)
                    } else {
                        0.0
                    }
                })
                .collect();
            state.store_narrowed(&outs[0], &x, &y)
        }
        "NPUAllocFloatStatus" => {
            let status = vec![0.0; outs[0].desc.numel()];
            state.store_values(&outs[0], &status)
        }
        "NPUGetFloatStatus" => {
            let mut status = vec![0.0; ins[0].desc.numel()];
            if let Some(first) = status.first_mut() {
                *first = state.float_status as u8 as f64;
            }
            state.store_values(&ins[0], &status)?;
            state.store_values(&outs[0], &status[..outs[0].desc.numel().min(status.len())])
        }
        "NPUClearFloatStatus" => {
            state.float_status = false;
            let status = vec![0.0; ins[0].desc.numel()];
            state.store_values(&ins[0], &status)?;
            state.store_values(&outs[0], &status[..outs[0].desc.numel().min(status.len())])
        }
        other => Err(format!("unknown op `{other}`")),
    }
}
