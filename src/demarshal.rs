//! zvariant → value decoding.

use crate::error::{DbusError, Result};
use crate::marshal::Argument;
use crate::message::{Message, MessageExt};
use crate::signature;
use crate::value::Value;
use std::collections::BTreeMap;
use zbus::zvariant::{self, Structure};

/// Reads the arguments of a message back into [`Argument`]s.
pub struct Demarshaller {
    fields: Vec<zvariant::Value<'static>>,
    signatures: Vec<String>,
    cursor: usize,
    decode_error: Option<DbusError>,
}

impl Demarshaller {
    /// Decode the body of `message`. A body zbus cannot parse leaves the
    /// demarshaller empty, with the failure reported by the first read.
    pub fn new(message: &Message) -> Self {
        match body_fields(message) {
            Ok((fields, signatures)) => Self {
                fields,
                signatures,
                cursor: 0,
                decode_error: None,
            },
            Err(err) => Self {
                fields: Vec::new(),
                signatures: Vec::new(),
                cursor: 0,
                decode_error: Some(err),
            },
        }
    }

    pub fn has_more(&self) -> bool {
        self.cursor < self.fields.len() || self.decode_error.is_some()
    }

    /// Decode the current item without advancing.
    ///
    /// A non-empty `expected` signature must match the message's.
    pub fn get_argument(&self, expected: &str) -> Result<Argument> {
        if let Some(err) = &self.decode_error {
            return Err(DbusError::type_mismatch(format!("undecodable body: {}", err)));
        }
        let (Some(field), Some(actual)) = (self.fields.get(self.cursor), self.signatures.get(self.cursor)) else {
            return Err(DbusError::type_mismatch("no more arguments"));
        };
        if !expected.is_empty() && expected != actual {
            return Err(DbusError::type_mismatch(format!(
                "expected {:?} but message carries {:?}",
                expected, actual
            )));
        }
        Ok(Argument {
            signature: actual.clone(),
            value: from_zvariant(field)?,
        })
    }

    /// Move to the next item. Returns whether one exists.
    pub fn next(&mut self) -> Result<bool> {
        if self.cursor < self.fields.len() {
            self.cursor += 1;
        }
        Ok(self.cursor < self.fields.len())
    }

    /// Decode every remaining item, stopping at the first failure.
    ///
    /// Items decoded before the failure stay in `out`.
    pub fn get_arguments_into(&mut self, out: &mut Vec<Argument>) -> Result<()> {
        while self.has_more() {
            out.push(self.get_argument("")?);
            self.next()?;
        }
        Ok(())
    }

    pub fn get_arguments(&mut self) -> Result<Vec<Argument>> {
        let mut out = Vec::new();
        self.get_arguments_into(&mut out)?;
        Ok(out)
    }
}

/// Top-level body fields and their complete type signatures.
fn body_fields(message: &Message) -> Result<(Vec<zvariant::Value<'static>>, Vec<String>)> {
    let body_sig = message.body_signature();
    if body_sig.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let expected: Vec<String> = signature::split_types(&body_sig)
        .ok_or_else(|| DbusError::type_mismatch(format!("invalid body signature {:?}", body_sig)))?
        .into_iter()
        .map(str::to_owned)
        .collect();

    let body = message.body();
    let structure: Structure<'_> = body.deserialize()?;
    let fields: Vec<zvariant::Value<'static>> = structure
        .fields()
        .iter()
        .map(|field| field.try_to_owned().map(Into::into))
        .collect::<std::result::Result<_, _>>()?;

    let matches = fields.len() == expected.len()
        && fields
            .iter()
            .zip(&expected)
            .all(|(field, sig)| field.value_signature().as_str() == sig.as_str());
    if matches {
        return Ok((fields, expected));
    }
    // A body made of a single struct decodes as that struct's members.
    if expected.len() == 1 && expected[0].starts_with('(') {
        let whole = fields
            .into_iter()
            .fold(zvariant::StructureBuilder::new(), |whole, field| whole.append_field(field))
            .build();
        return Ok((vec![zvariant::Value::Structure(whole)], expected));
    }
    Err(DbusError::type_mismatch(format!(
        "body does not match its signature {:?}",
        body_sig
    )))
}

/// Convert a decoded zvariant value. Integers widen to `Int64`, structs
/// become arrays, and dict keys are stringified.
pub fn from_zvariant(value: &zvariant::Value<'_>) -> Result<Value> {
    use zvariant::Value as Z;
    let converted = match value {
        Z::U8(v) => Value::Int64(i64::from(*v)),
        Z::Bool(v) => Value::Bool(*v),
        Z::I16(v) => Value::Int64(i64::from(*v)),
        Z::U16(v) => Value::Int64(i64::from(*v)),
        Z::I32(v) => Value::Int64(i64::from(*v)),
        Z::U32(v) => Value::Int64(i64::from(*v)),
        Z::I64(v) => Value::Int64(*v),
        Z::U64(v) => Value::Int64(*v as i64),
        Z::F64(v) => Value::Double(*v),
        Z::Str(v) => Value::String(v.as_str().to_owned()),
        Z::Signature(v) => Value::String(v.as_str().to_owned()),
        Z::ObjectPath(v) => Value::String(v.as_str().to_owned()),
        Z::Value(inner) => Value::Variant(Box::new(from_zvariant(inner)?)),
        Z::Array(array) => Value::Array(array.iter().map(from_zvariant).collect::<Result<_>>()?),
        Z::Dict(dict) => {
            let mut map = BTreeMap::new();
            for (key, item) in dict.iter() {
                let key = from_zvariant(key)?
                    .to_string_value()
                    .ok_or_else(|| DbusError::type_mismatch("dict key is not a basic type"))?;
                map.insert(key, from_zvariant(item)?);
            }
            Value::Dict(map)
        }
        Z::Structure(structure) => Value::Array(
            structure
                .fields()
                .iter()
                .map(from_zvariant)
                .collect::<Result<_>>()?,
        ),
        other => {
            return Err(DbusError::type_mismatch(format!(
                "type {} is not supported",
                other.value_signature()
            )))
        }
    };
    Ok(converted)
}
