use super::OpRunner;
use crate::attr::AttributeMap;
use crate::dtypes::DType;
use crate::tensor::{Npu, Tensor};
use crate::Error;

/// The dtype a tensor must be converted to, if any. `None` means "as is".
fn cast_target(required: Option<&Option<DType>>, actual: DType) -> Option<DType> {
    required.copied().flatten().filter(|dtype| *dtype != actual)
}

impl OpRunner {
    /// Runs `body` on tensors of the dtypes it was written for.
    ///
    /// For every input whose entry in `input_types` names a different dtype than the
    /// tensor has, a temporary of that dtype is allocated and filled with a `Cast`
    /// before `body` runs. Outputs get temporaries the same way, and after `body`
    /// returns each temporary is cast back into the caller's output. Tensors with a
    /// matching dtype, a `None` entry or no entry at all are passed through untouched.
    ///
    /// `None` is the unspecified dtype. It never triggers a cast, even though some
    /// framework adapters cast on it: an unspecified dtype has no driver code, so such
    /// a `Cast` could not be described.
    ///
    /// All casts are enqueued on the main stream of `npu`.
    pub fn type_adapter<F>(
        inputs: &[Tensor],
        outputs: &[Tensor],
        attrs: &AttributeMap,
        npu: &Npu,
        body: F,
        input_types: &[Option<DType>],
        output_types: &[Option<DType>],
    ) -> Result<(), Error>
    where
        F: FnOnce(&[Tensor], &[Tensor], &AttributeMap, &Npu) -> Result<(), Error>,
    {
        let mut casts = 0;
        let mut tmp_inputs = Vec::with_capacity(inputs.len());
        for (i, x) in inputs.iter().enumerate() {
            match cast_target(input_types.get(i), x.dtype()) {
                Some(dtype) => {
                    let tmp = npu.alloc(dtype, x.shape())?.with_layout(x.layout());
                    npu.cast(x, &tmp)?;
                    casts += 1;
                    tmp_inputs.push(tmp);
                }
                None => tmp_inputs.push(x.clone()),
            }
        }

        let mut tmp_outputs = Vec::with_capacity(outputs.len());
        for (i, y) in outputs.iter().enumerate() {
            match cast_target(output_types.get(i), y.dtype()) {
                Some(dtype) => {
                    tmp_outputs.push(npu.alloc(dtype, y.shape())?.with_layout(y.layout()))
                }
                None => tmp_outputs.push(y.clone()),
            }
        }

        body(&tmp_inputs, &tmp_outputs, attrs, npu)?;

        for (i, (tmp, y)) in tmp_outputs.iter().zip(outputs).enumerate() {
            if cast_target(output_types.get(i), y.dtype()).is_some() {
                npu.cast(tmp, y)?;
                casts += 1;
            }
        }
        if casts > 0 {
            tracing::debug!(casts, "type adapter inserted casts");
        }
        Ok(())
    }
}
