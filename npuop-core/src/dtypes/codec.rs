use num_traits::AsPrimitive;

use super::{bf16, f16, DType, Unit};
use crate::Error;

fn decode_as<E: Unit + AsPrimitive<f64>>(bytes: &[u8]) -> Vec<f64> {
    super::from_le_bytes::<E>(bytes)
        .into_iter()
        .map(|x| x.as_())
        .collect()
}

fn encode_as<E: Unit>(values: &[f64]) -> Vec<u8>
where
    f64: AsPrimitive<E>,
{
    let mut out = Vec::with_capacity(values.len() * E::DTYPE.size_of());
    for v in values {
        <f64 as AsPrimitive<E>>::as_(*v).write_le(&mut out);
    }
    out
}

/// Widens raw little endian elements of `dtype` into `f64`.
pub fn decode(dtype: DType, bytes: &[u8]) -> Result<Vec<f64>, Error> {
    let values = match dtype {
        DType::Bool => bytes.iter().map(|b| (*b != 0) as u8 as f64).collect(),
        DType::UInt8 => decode_as::<u8>(bytes),
        DType::Int8 => decode_as::<i8>(bytes),
        DType::UInt16 => decode_as::<u16>(bytes),
        DType::Int16 => decode_as::<i16>(bytes),
        DType::UInt32 => decode_as::<u32>(bytes),
        DType::Int32 => decode_as::<i32>(bytes),
        DType::UInt64 => decode_as::<u64>(bytes),
        DType::Int64 => decode_as::<i64>(bytes),
        DType::Float32 => decode_as::<f32>(bytes),
        DType::Float64 => decode_as::<f64>(bytes),
        DType::Float16 => super::from_le_bytes::<f16>(bytes)
            .into_iter()
            .map(f16::to_f64)
            .collect(),
        DType::BFloat16 => super::from_le_bytes::<bf16>(bytes)
            .into_iter()
            .map(bf16::to_f64)
            .collect(),
        DType::Undefined | DType::Complex64 | DType::Complex128 | DType::PString => {
            return Err(Error::UnsupportedDtype(dtype))
        }
    };
    Ok(values)
}

/// Narrows `f64` values into raw little endian elements of `dtype`, with `as` cast semantics.
pub fn encode(dtype: DType, values: &[f64]) -> Result<Vec<u8>, Error> {
    let bytes = match dtype {
        DType::Bool => values.iter().map(|v| (*v != 0.0) as u8).collect(),
        DType::UInt8 => encode_as::<u8>(values),
        DType::Int8 => encode_as::<i8>(values),
        DType::UInt16 => encode_as::<u16>(values),
        DType::Int16 => encode_as::<i16>(values),
        DType::UInt32 => encode_as::<u32>(values),
        DType::Int32 => encode_as::<i32>(values),
        DType::UInt64 => encode_as::<u64>(values),
        DType::Int64 => encode_as::<i64>(values),
        DType::Float32 => encode_as::<f32>(values),
        DType::Float64 => encode_as::<f64>(values),
        DType::Float16 => {
            let values: Vec<f16> = values.iter().map(|v| f16::from_f64(*v)).collect();
            super::to_le_bytes(&values)
        }
        DType::BFloat16 => {
            let values: Vec<bf16> = values.iter().map(|v| bf16::from_f64(*v)).collect();
            super::to_le_bytes(&values)
        }
        DType::Undefined | DType::Complex64 | DType::Complex128 | DType::PString => {
            return Err(Error::UnsupportedDtype(dtype))
        }
    };
    Ok(bytes)
}
