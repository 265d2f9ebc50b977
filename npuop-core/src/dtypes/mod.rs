//! Module for data type related tables and traits. Contains the framework side [DType],
//! its accelerator counterpart [AclDataType], the layout tags ([Layout], [Format], [MemType])
//! and the [Unit] trait for host element types.
//!
//! Every dtype decision in this crate goes through one of the tables below
//! ([DType::to_acl], [DType::size_of], [DType::mask_compute_dtype]) instead of ad-hoc
//! conditionals, so the dispatch stays total.

mod codec;

pub use codec::{decode, encode};
pub use half::{bf16, f16};

use crate::Error;

/// The element type of a logical tensor, as the enclosing framework knows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Undefined,
    Bool,
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float16,
    BFloat16,
    Float32,
    Float64,
    Complex64,
    Complex128,
    PString,
}

/// The accelerator native element type codes.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AclDataType {
    Float = 0,
    Float16 = 1,
    Int8 = 2,
    Int32 = 3,
    Uint8 = 4,
    Int16 = 6,
    Uint16 = 7,
    Uint32 = 8,
    Int64 = 9,
    Uint64 = 10,
    Double = 11,
    Bool = 12,
    BFloat16 = 27,
}

impl AclDataType {
    /// The raw code, as passed to the driver and stored in `dst_type` attributes.
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let dtype = match code {
            0 => Self::Float,
            1 => Self::Float16,
            2 => Self::Int8,
            3 => Self::Int32,
            4 => Self::Uint8,
            6 => Self::Int16,
            7 => Self::Uint16,
            8 => Self::Uint32,
            9 => Self::Int64,
            10 => Self::Uint64,
            11 => Self::Double,
            12 => Self::Bool,
            27 => Self::BFloat16,
            _ => return None,
        };
        Some(dtype)
    }

    pub const fn to_dtype(self) -> DType {
        match self {
            Self::Float => DType::Float32,
            Self::Float16 => DType::Float16,
            Self::Int8 => DType::Int8,
            Self::Int32 => DType::Int32,
            Self::Uint8 => DType::UInt8,
            Self::Int16 => DType::Int16,
            Self::Uint16 => DType::UInt16,
            Self::Uint32 => DType::UInt32,
            Self::Int64 => DType::Int64,
            Self::Uint64 => DType::UInt64,
            Self::Double => DType::Float64,
            Self::Bool => DType::Bool,
            Self::BFloat16 => DType::BFloat16,
        }
    }

    pub const fn size_of(self) -> usize {
        self.to_dtype().size_of()
    }
}

impl DType {
    /// Maps a framework dtype onto the accelerator. Types without an accelerator
    /// counterpart are [Error::UnsupportedDtype].
    pub fn to_acl(self) -> Result<AclDataType, Error> {
        let acl = match self {
            Self::Bool => AclDataType::Bool,
            Self::UInt8 => AclDataType::Uint8,
            Self::Int8 => AclDataType::Int8,
            Self::UInt16 => AclDataType::Uint16,
            Self::Int16 => AclDataType::Int16,
            Self::UInt32 => AclDataType::Uint32,
            Self::Int32 => AclDataType::Int32,
            Self::UInt64 => AclDataType::Uint64,
            Self::Int64 => AclDataType::Int64,
            Self::Float16 => AclDataType::Float16,
            Self::BFloat16 => AclDataType::BFloat16,
            Self::Float32 => AclDataType::Float,
            Self::Float64 => AclDataType::Double,
            Self::Undefined | Self::Complex64 | Self::Complex128 | Self::PString => {
                return Err(Error::UnsupportedDtype(self))
            }
        };
        Ok(acl)
    }

    /// Width of one element in bytes. `0` for types with no fixed width.
    pub const fn size_of(self) -> usize {
        match self {
            Self::Bool | Self::UInt8 | Self::Int8 => 1,
            Self::UInt16 | Self::Int16 | Self::Float16 | Self::BFloat16 => 2,
            Self::UInt32 | Self::Int32 | Self::Float32 => 4,
            Self::UInt64 | Self::Int64 | Self::Float64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
            Self::Undefined | Self::PString => 0,
        }
    }

    /// The dtype the mask generation / application ops compute in.
    /// The driver has no double precision kernel for them, so `Float64` runs in `Float32`.
    pub const fn mask_compute_dtype(self) -> DType {
        match self {
            Self::Float64 => Self::Float32,
            other => other,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(
            self,
            Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64
        )
    }
}

/// Memory layout tag carried by a logical tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Layout {
    #[default]
    Any,
    Nchw,
    Nhwc,
    Ncdhw,
    Ndhwc,
}

/// Driver side tensor format.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Nchw = 0,
    Nhwc = 1,
    Nd = 2,
    Ndhwc = 27,
    Ncdhw = 30,
}

impl From<Layout> for Format {
    fn from(layout: Layout) -> Self {
        match layout {
            Layout::Any => Format::Nd,
            Layout::Nchw => Format::Nchw,
            Layout::Nhwc => Format::Nhwc,
            Layout::Ncdhw => Format::Ncdhw,
            Layout::Ndhwc => Format::Ndhwc,
        }
    }
}

/// Where the data behind a descriptor lives.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemType {
    #[default]
    Device = 0,
    Host = 1,
}

/// Represents a host element type that can be uploaded to or read back from the device.
pub trait Unit: 'static + Copy + Default + std::fmt::Debug + PartialEq + Send + Sync {
    const DTYPE: DType;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! unit {
    ($type:ty, $dtype:expr) => {
        impl Unit for $type {
            const DTYPE: DType = $dtype;
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$type>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$type>()]);
                <$type>::from_le_bytes(raw)
            }
        }
    };
}

unit!(u8, DType::UInt8);
unit!(i8, DType::Int8);
unit!(u16, DType::UInt16);
unit!(i16, DType::Int16);
unit!(u32, DType::UInt32);
unit!(i32, DType::Int32);
unit!(u64, DType::UInt64);
unit!(i64, DType::Int64);
unit!(f16, DType::Float16);
unit!(bf16, DType::BFloat16);
unit!(f32, DType::Float32);
unit!(f64, DType::Float64);

impl Unit for bool {
    const DTYPE: DType = DType::Bool;
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Serializes a slice of host values into little endian bytes.
pub fn to_le_bytes<E: Unit>(values: &[E]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * E::DTYPE.size_of());
    for v in values {
        v.write_le(&mut out);
    }
    out
}

/// Inverse of [to_le_bytes]. Trailing bytes that do not form a whole element are ignored.
pub fn from_le_bytes<E: Unit>(bytes: &[u8]) -> Vec<E> {
    bytes
        .chunks_exact(E::DTYPE.size_of())
        .map(E::read_le)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DType; 17] = [
        DType::Undefined,
        DType::Bool,
        DType::UInt8,
        DType::Int8,
        DType::UInt16,
        DType::Int16,
        DType::UInt32,
        DType::Int32,
        DType::UInt64,
        DType::Int64,
        DType::Float16,
        DType::BFloat16,
        DType::Float32,
        DType::Float64,
        DType::Complex64,
        DType::Complex128,
        DType::PString,
    ];

    #[test]
    fn test_acl_mapping_round_trips() {
        for dtype in ALL {
            match dtype.to_acl() {
                Ok(acl) => {
                    assert_eq!(acl.to_dtype(), dtype);
                    assert_eq!(AclDataType::from_code(acl.code() as i64), Some(acl));
                    assert_eq!(acl.size_of(), dtype.size_of());
                }
                Err(Error::UnsupportedDtype(d)) => assert_eq!(d, dtype),
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
    }

    #[test]
    fn test_unsupported_dtypes() {
        for dtype in [
            DType::Undefined,
            DType::Complex64,
            DType::Complex128,
            DType::PString,
        ] {
            assert!(matches!(dtype.to_acl(), Err(Error::UnsupportedDtype(d)) if d == dtype));
        }
    }

    #[test]
    fn test_mask_compute_dtype() {
        assert_eq!(DType::Float64.mask_compute_dtype(), DType::Float32);
        assert_eq!(DType::Float32.mask_compute_dtype(), DType::Float32);
        assert_eq!(DType::Float16.mask_compute_dtype(), DType::Float16);
    }

    #[test]
    fn test_le_bytes() {
        let values = [1.5f32, -2.0, 0.25];
        let bytes = to_le_bytes(&values);
        assert_eq!(bytes.len(), 12);
        assert_eq!(from_le_bytes::<f32>(&bytes), values);
        assert_eq!(to_le_bytes(&[true, false]), vec![1, 0]);
    }
}
