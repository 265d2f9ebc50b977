//! Operator attributes: a closed set of scalar and vector values keyed by name.

use std::collections::HashMap;

/// A single operator attribute value.
///
/// The set of variants is closed; lowering an attribute into a driver call is an
/// exhaustive match, so a new kind of attribute is a compile time checked change.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum AttrValue {
    #[default]
    Blank,
    Int(i32),
    Float(f32),
    String(String),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
    Bool(bool),
    Bools(Vec<bool>),
    Int64(i64),
    Int64s(Vec<i64>),
    Float64s(Vec<f64>),
    Int64Lists(Vec<Vec<i64>>),
}

/// Attributes of one operation invocation. Insertion order is irrelevant.
pub type AttributeMap = HashMap<String, AttrValue>;

macro_rules! attr_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for AttrValue {
            fn from(value: $type) -> Self {
                AttrValue::$variant(value)
            }
        }
    };
}

attr_from!(i32, Int);
attr_from!(f32, Float);
attr_from!(String, String);
attr_from!(Vec<i32>, Ints);
attr_from!(Vec<f32>, Floats);
attr_from!(Vec<String>, Strings);
attr_from!(bool, Bool);
attr_from!(Vec<bool>, Bools);
attr_from!(i64, Int64);
attr_from!(Vec<i64>, Int64s);
attr_from!(Vec<f64>, Float64s);
attr_from!(Vec<Vec<i64>>, Int64Lists);

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<()> for AttrValue {
    fn from(_: ()) -> Self {
        AttrValue::Blank
    }
}

impl AttrValue {
    /// Name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            AttrValue::Blank => "blank",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::String(_) => "string",
            AttrValue::Ints(_) => "list<int>",
            AttrValue::Floats(_) => "list<float>",
            AttrValue::Strings(_) => "list<string>",
            AttrValue::Bool(_) => "bool",
            AttrValue::Bools(_) => "list<bool>",
            AttrValue::Int64(_) => "int64",
            AttrValue::Int64s(_) => "list<int64>",
            AttrValue::Float64s(_) => "list<double>",
            AttrValue::Int64Lists(_) => "list<list<int64>>",
        }
    }

    /// Reads an integral scalar regardless of its width.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v as i64),
            AttrValue::Int64(v) => Some(*v),
            AttrValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }
}

/// Something that lowers into an [AttributeMap]. Implemented by `#[derive(OpAttrs)]`.
pub trait IntoAttributeMap {
    fn into_attribute_map(self) -> AttributeMap;
}

impl IntoAttributeMap for AttributeMap {
    fn into_attribute_map(self) -> AttributeMap {
        self
    }
}

impl<K: Into<String>, V: Into<AttrValue>, const N: usize> IntoAttributeMap for [(K, V); N] {
    fn into_attribute_map(self) -> AttributeMap {
        self.into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect()
    }
}
