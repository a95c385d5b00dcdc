//! Value → zvariant encoding driven by type signatures.
//!
//! Every argument is converted into a [`zvariant::Value`] of exactly the
//! requested D-Bus type, range checked on the way; zbus then serializes
//! the collected fields as the message body.

use crate::error::{DbusError, Result};
use crate::message::{Builder, Message};
use crate::signature;
use crate::value::Value;
use zbus::zvariant::{self, Array, Dict, ObjectPath, Signature, StructureBuilder};

type ZValue = zvariant::Value<'static>;

/// A value with an optional explicit signature. An empty signature
/// means the signature is inferred from the value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Argument {
    pub signature: String,
    pub value: Value,
}

impl Argument {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            signature: String::new(),
            value: value.into(),
        }
    }

    pub fn typed(signature: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            signature: signature.into(),
            value: value.into(),
        }
    }
}

fn mismatch(value: &Value, sig: &str) -> DbusError {
    DbusError::type_mismatch(format!("cannot marshal {} as {:?}", value.kind(), sig))
}

fn integer(value: &Value, sig: &str, min: i64, max: i64) -> Result<i64> {
    let v = value.to_i64().ok_or_else(|| mismatch(value, sig))?;
    if v < min || v > max {
        return Err(DbusError::type_mismatch(format!("{} is out of range for {:?}", v, sig)));
    }
    Ok(v)
}

fn zsignature(sig: &str) -> Result<Signature<'static>> {
    Ok(Signature::try_from(sig.to_string())?)
}

/// Collects the arguments of one message body.
///
/// Nothing reaches a message until [`Marshaller::finish`]; after any
/// rejection the marshaller refuses further input and `finish` fails, so
/// a half-converted body can never be sent.
#[derive(Default)]
pub struct Marshaller {
    fields: Vec<ZValue>,
    signature: String,
    rejected: bool,
}

impl Marshaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signature of the arguments appended so far.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn append_argument(&mut self, arg: &Argument) -> Result<()> {
        self.guard(|this| {
            let sig = if arg.signature.is_empty() {
                signature::infer_signature(&arg.value).ok_or_else(|| {
                    DbusError::type_mismatch(format!("cannot infer a signature for {}", arg.value))
                })?
            } else {
                arg.signature.clone()
            };
            if !signature::validate_signature(&sig, true) {
                return Err(DbusError::type_mismatch(format!("invalid signature {:?}", sig)));
            }
            let field = to_zvariant(&sig, &arg.value)?;
            this.push(&sig, field);
            Ok(())
        })
    }

    pub fn append_arguments(&mut self, args: &[Argument]) -> Result<()> {
        for arg in args {
            self.append_argument(arg)?;
        }
        Ok(())
    }

    /// Append a variant whose contained type is `inner.signature`, or the
    /// inferred one when that is empty.
    pub fn append_variant(&mut self, inner: &Argument) -> Result<()> {
        self.guard(|this| {
            let sig = if inner.signature.is_empty() {
                signature::infer_signature(inner.value.unwrap_variant())
                    .ok_or_else(|| mismatch(&inner.value, "v"))?
            } else {
                inner.signature.clone()
            };
            if !signature::validate_signature(&sig, true) {
                return Err(DbusError::type_mismatch(format!("invalid signature {:?}", sig)));
            }
            let value = if sig == "v" { &inner.value } else { inner.value.unwrap_variant() };
            let field = ZValue::Value(Box::new(to_zvariant(&sig, value)?));
            this.push("v", field);
            Ok(())
        })
    }

    /// Build the message with the collected arguments as its body.
    pub fn finish(self, builder: Builder<'_>) -> Result<Message> {
        if self.rejected {
            return Err(DbusError::type_mismatch("message has a rejected argument"));
        }
        if self.fields.is_empty() {
            return Ok(builder.build(&())?);
        }
        let body = self
            .fields
            .into_iter()
            .fold(StructureBuilder::new(), |body, field| body.append_field(field))
            .build();
        Ok(builder.build(&body)?)
    }

    fn push(&mut self, sig: &str, field: ZValue) {
        self.signature.push_str(sig);
        self.fields.push(field);
    }

    fn guard(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        if self.rejected {
            return Err(DbusError::type_mismatch("message has a rejected argument"));
        }
        let result = f(self);
        if result.is_err() {
            self.rejected = true;
        }
        result
    }
}

/// Convert `value` into a zvariant value of type `sig`.
///
/// Void members of arrays, dicts and inferred structs carry nothing and
/// are skipped.
pub fn to_zvariant(sig: &str, value: &Value) -> Result<ZValue> {
    let code = *sig
        .as_bytes()
        .first()
        .ok_or_else(|| DbusError::type_mismatch("empty signature"))?;
    let converted = match code {
        b'y' => ZValue::U8(integer(value, sig, 0, i64::from(u8::MAX))? as u8),
        b'b' => ZValue::Bool(value.to_bool().ok_or_else(|| mismatch(value, sig))?),
        b'n' => ZValue::I16(integer(value, sig, i64::from(i16::MIN), i64::from(i16::MAX))? as i16),
        b'q' => ZValue::U16(integer(value, sig, 0, i64::from(u16::MAX))? as u16),
        b'i' => ZValue::I32(integer(value, sig, i64::from(i32::MIN), i64::from(i32::MAX))? as i32),
        b'u' => ZValue::U32(integer(value, sig, 0, i64::from(u32::MAX))? as u32),
        b'x' => ZValue::I64(integer(value, sig, i64::MIN, i64::MAX)?),
        // u64 travels as its i64 bit pattern
        b't' => ZValue::U64(integer(value, sig, i64::MIN, i64::MAX)? as u64),
        b'd' => ZValue::F64(value.to_f64().ok_or_else(|| mismatch(value, sig))?),
        b's' => ZValue::from(value.to_string_value().ok_or_else(|| mismatch(value, sig))?),
        b'o' => {
            let v = value.to_string_value().ok_or_else(|| mismatch(value, sig))?;
            if !signature::validate_object_path(&v) {
                return Err(DbusError::type_mismatch(format!("invalid object path {:?}", v)));
            }
            ZValue::ObjectPath(ObjectPath::try_from(v)?)
        }
        b'g' => {
            let v = value.to_string_value().ok_or_else(|| mismatch(value, sig))?;
            if !signature::validate_signature(&v, false) {
                return Err(DbusError::type_mismatch(format!("invalid signature value {:?}", v)));
            }
            ZValue::Signature(zsignature(&v)?)
        }
        b'a' => array_to_zvariant(sig, value)?,
        b'(' => {
            let Value::Array(items) = value else {
                return Err(mismatch(value, sig));
            };
            let members = signature::sub_elements(sig)
                .ok_or_else(|| DbusError::type_mismatch(format!("invalid struct {:?}", sig)))?;
            let items: Vec<&Value> = items.iter().filter(|item| !item.is_void()).collect();
            if members.len() != items.len() {
                return Err(DbusError::type_mismatch(format!(
                    "struct {:?} needs {} members, got {}",
                    sig,
                    members.len(),
                    items.len()
                )));
            }
            let mut fields = StructureBuilder::new();
            for (member, item) in members.iter().zip(items) {
                fields = fields.append_field(to_zvariant(member, item)?);
            }
            ZValue::Structure(fields.build())
        }
        b'v' => {
            let inner = match value {
                Value::Variant(inner) => inner.as_ref(),
                other => other,
            };
            let inner_sig = signature::infer_signature(inner).ok_or_else(|| mismatch(inner, "v"))?;
            ZValue::Value(Box::new(to_zvariant(&inner_sig, inner)?))
        }
        other => {
            return Err(DbusError::type_mismatch(format!(
                "type code {:?} is not supported",
                other as char
            )))
        }
    };
    Ok(converted)
}

fn array_to_zvariant(sig: &str, value: &Value) -> Result<ZValue> {
    let element = signature::array_element(sig)
        .ok_or_else(|| DbusError::type_mismatch(format!("invalid array {:?}", sig)))?;

    if element.starts_with('{') {
        let Value::Dict(map) = value else {
            return Err(mismatch(value, sig));
        };
        let members = signature::sub_elements(element)
            .ok_or_else(|| DbusError::type_mismatch(format!("invalid dict entry {:?}", element)))?;
        let mut dict = Dict::new(zsignature(members[0])?, zsignature(members[1])?);
        for (key, item) in map.iter().filter(|(_, item)| !item.is_void()) {
            let key = to_zvariant(members[0], &Value::String(key.clone()))?;
            dict.append(key, to_zvariant(members[1], item)?)?;
        }
        Ok(ZValue::Dict(dict))
    } else {
        let Value::Array(items) = value else {
            return Err(mismatch(value, sig));
        };
        let mut array = Array::new(zsignature(element)?);
        for item in items.iter().filter(|item| !item.is_void()) {
            array.append(to_zvariant(element, item)?)?;
        }
        Ok(ZValue::Array(array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{method_call, MessageExt};
    use std::collections::BTreeMap;

    fn finish(marshaller: Marshaller) -> Result<Message> {
        marshaller.finish(method_call("org.example.Service", "/org/example", "org.example.Iface", "Do")?)
    }

    #[test]
    fn test_explicit_and_inferred_signatures() {
        let mut marshaller = Marshaller::new();
        marshaller.append_argument(&Argument::new("text")).unwrap();
        marshaller.append_argument(&Argument::typed("y", 200)).unwrap();
        marshaller.append_argument(&Argument::typed("t", -1i64)).unwrap();
        marshaller.append_argument(&Argument::new(vec![Value::from(1), Value::from(2)])).unwrap();
        assert_eq!(marshaller.signature(), "sytai");
        let message = finish(marshaller).unwrap();
        assert_eq!(message.body_signature(), "sytai");
    }

    #[test]
    fn test_range_checks() {
        assert!(Marshaller::new().append_argument(&Argument::typed("y", 256)).is_err());
        assert!(Marshaller::new().append_argument(&Argument::typed("u", -1)).is_err());
        assert!(Marshaller::new().append_argument(&Argument::typed("i", 2.5)).is_err());
        assert!(Marshaller::new().append_argument(&Argument::typed("n", 40000)).is_err());
        assert!(Marshaller::new().append_argument(&Argument::typed("q", 65535)).is_ok());
    }

    #[test]
    fn test_rejection_poisons_message() {
        let mut marshaller = Marshaller::new();
        marshaller.append_argument(&Argument::new("ok")).unwrap();
        assert!(marshaller.append_argument(&Argument::typed("o", "not/a/path")).is_err());
        assert!(marshaller.append_argument(&Argument::new("more")).is_err());
        assert_eq!(marshaller.len(), 1);
        assert!(finish(marshaller).is_err());
    }

    #[test]
    fn test_struct_arity_and_dict() {
        let mut marshaller = Marshaller::new();
        let pair = Value::Array(vec![Value::from("a"), Value::from(1)]);
        assert!(marshaller.append_argument(&Argument::typed("(si)", pair.clone())).is_ok());
        assert!(marshaller.append_argument(&Argument::typed("(sii)", pair)).is_err());

        let mut marshaller = Marshaller::new();
        let mut map = BTreeMap::new();
        map.insert("7".to_string(), Value::from("seven"));
        marshaller.append_argument(&Argument::typed("a{is}", Value::Dict(map))).unwrap();
        let message = finish(marshaller).unwrap();
        assert_eq!(message.body_signature(), "a{is}");

        let mut map = BTreeMap::new();
        map.insert("x".to_string(), Value::from("seven"));
        assert!(Marshaller::new().append_argument(&Argument::typed("a{is}", Value::Dict(map))).is_err());
    }

    #[test]
    fn test_void_members_are_skipped() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::from(1));
        map.insert("gone".to_string(), Value::Void);
        map.insert("wide".to_string(), Value::Int64(1 << 40));
        let mut marshaller = Marshaller::new();
        marshaller.append_argument(&Argument::new(Value::Dict(map))).unwrap();
        marshaller
            .append_argument(&Argument::new(vec![Value::from(1), Value::Void, Value::Int64(1 << 40)]))
            .unwrap();
        assert_eq!(marshaller.signature(), "a{sx}ax");
        assert!(finish(marshaller).is_ok());
    }

    #[test]
    fn test_uninferable_and_invalid() {
        assert!(Marshaller::new().append_argument(&Argument::new(Value::Array(vec![]))).is_err());
        assert!(Marshaller::new().append_argument(&Argument::typed("ii", 1)).is_err());
        assert!(Marshaller::new().append_argument(&Argument::typed("h", 1)).is_err());
    }

    #[test]
    fn test_explicit_variant() {
        let mut marshaller = Marshaller::new();
        marshaller.append_argument(&Argument::new("prop")).unwrap();
        marshaller.append_variant(&Argument::typed("u", 7)).unwrap();
        let message = finish(marshaller).unwrap();
        assert_eq!(message.body_signature(), "sv");

        let (name, value): (String, zvariant::OwnedValue) = message.body().deserialize().unwrap();
        assert_eq!(name, "prop");
        assert_eq!(value.value_signature().as_str(), "u");
    }

    #[test]
    fn test_empty_body() {
        let message = finish(Marshaller::new()).unwrap();
        assert_eq!(message.body_signature(), "");
    }
}
