//! Dynamically typed values exchanged with remote bus objects.
//!
//! Every integer width on the wire is carried as [`Value::Int64`]; the
//! exact width is only chosen (and range checked) when a value is
//! marshalled against a signature.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A tagged dynamic value.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Void,
    Bool(bool),
    Int64(i64),
    Double(f64),
    String(String),
    /// Variant wrapper around a nested value.
    Variant(Box<Value>),
    /// Homogeneous arrays and positional structs.
    Array(Vec<Value>),
    /// Dictionaries, keyed by the stringified wire key.
    Dict(BTreeMap<String, Value>),
}

/// Coarse value category, used to check values against prototypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Void,
    Bool,
    Int64,
    Double,
    String,
    Variant,
    Array,
    Dict,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Void => "void",
            ValueKind::Bool => "bool",
            ValueKind::Int64 => "int64",
            ValueKind::Double => "double",
            ValueKind::String => "string",
            ValueKind::Variant => "variant",
            ValueKind::Array => "array",
            ValueKind::Dict => "dict",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Void => ValueKind::Void,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int64(_) => ValueKind::Int64,
            Value::Double(_) => ValueKind::Double,
            Value::String(_) => ValueKind::String,
            Value::Variant(_) => ValueKind::Variant,
            Value::Array(_) => ValueKind::Array,
            Value::Dict(_) => ValueKind::Dict,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn variant(inner: impl Into<Value>) -> Self {
        Value::Variant(Box::new(inner.into()))
    }

    /// Strip any number of variant wrappers.
    pub fn unwrap_variant(&self) -> &Value {
        let mut value = self;
        while let Value::Variant(inner) = value {
            value = inner;
        }
        value
    }

    pub fn into_unwrapped(self) -> Value {
        let mut value = self;
        while let Value::Variant(inner) = value {
            value = *inner;
        }
        value
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Numeric conversion used when marshalling integer codes.
    ///
    /// Doubles must be integral; strings must parse. Nothing is truncated.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Double(d) => {
                if d.is_finite() && d.fract() == 0.0 && *d >= i64::MIN as f64 && *d < i64::MAX as f64 {
                    Some(*d as i64)
                } else {
                    None
                }
            }
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int64(v) => Some(*v as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int64(v) => Some(*v != 0),
            Value::Double(d) => Some(*d != 0.0),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// String conversion for `s`, `o`, `g` codes and dictionary keys.
    pub fn to_string_value(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int64(v) => Some(v.to_string()),
            Value::Double(d) => Some(d.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Variant(inner) => write!(f, "<{}>", inner),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Dict(map) => {
                f.write_str("{")?;
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}: {}", key, item)?;
                }
                f.write_str("}")
            }
        }
    }
}

macro_rules! int_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Int64(i64::from(v))
            }
        })*
    };
}

int_from!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Double(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Dict(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_normalization() {
        assert_eq!(Value::from(7u8), Value::Int64(7));
        assert_eq!(Value::from(-3i16), Value::Int64(-3));
        assert_eq!(Value::from(u32::MAX), Value::Int64(4_294_967_295));
    }

    #[test]
    fn test_numeric_conversion_rejects_truncation() {
        assert_eq!(Value::Double(3.0).to_i64(), Some(3));
        assert_eq!(Value::Double(3.5).to_i64(), None);
        assert_eq!(Value::Double(f64::NAN).to_i64(), None);
        assert_eq!(Value::from("42").to_i64(), Some(42));
        assert_eq!(Value::from("forty-two").to_i64(), None);
        assert_eq!(Value::Array(vec![]).to_i64(), None);
    }

    #[test]
    fn test_bool_and_string_conversion() {
        assert_eq!(Value::from("TRUE").to_bool(), Some(true));
        assert_eq!(Value::from("maybe").to_bool(), None);
        assert_eq!(Value::Int64(5).to_string_value().as_deref(), Some("5"));
        assert_eq!(Value::Void.to_string_value(), None);
    }

    #[test]
    fn test_unwrap_variant() {
        let nested = Value::variant(Value::variant(Value::from("x")));
        assert_eq!(nested.unwrap_variant(), &Value::from("x"));
        assert_eq!(nested.kind(), ValueKind::Variant);
        assert_eq!(nested.into_unwrapped(), Value::from("x"));
    }

    #[test]
    fn test_display() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::from(1));
        let value = Value::Array(vec![Value::from(true), Value::Dict(map)]);
        assert_eq!(value.to_string(), "[true, {\"a\": 1}]");
    }

    #[test]
    fn test_json_export() {
        let value = Value::Array(vec![Value::from(1), Value::from("two"), Value::Void]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, "[1,\"two\",null]");
    }
}
