//! Type signatures and bus name grammar.
//!
//! A signature is a sequence of complete types:
//!
//! ```text
//! basic  := y | b | n | q | i | u | x | t | d | s | o | g | h
//! type   := basic | v | a type | a { basic type } | ( type+ )
//! ```
//!
//! Dict entries may only appear directly inside an array. Arrays and
//! structs may each nest at most 32 deep, and a whole signature is at most
//! 255 bytes long.

use crate::value::{Value, ValueKind};

pub const MAX_SIGNATURE_LENGTH: usize = 255;
pub const MAX_NAME_LENGTH: usize = 255;
const MAX_CONTAINER_DEPTH: u32 = 32;

pub fn is_basic_code(code: u8) -> bool {
    matches!(
        code,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

/// End offset of the complete type starting at `pos`, if well formed.
fn single_type_end(sig: &[u8], pos: usize, arrays: u32, structs: u32) -> Option<usize> {
    let code = *sig.get(pos)?;
    match code {
        b'v' => Some(pos + 1),
        c if is_basic_code(c) => Some(pos + 1),
        b'a' => {
            if arrays >= MAX_CONTAINER_DEPTH {
                return None;
            }
            if sig.get(pos + 1) == Some(&b'{') {
                if structs >= MAX_CONTAINER_DEPTH {
                    return None;
                }
                let key = *sig.get(pos + 2)?;
                if !is_basic_code(key) {
                    return None;
                }
                let value_end = single_type_end(sig, pos + 3, arrays + 1, structs + 1)?;
                if sig.get(value_end) != Some(&b'}') {
                    return None;
                }
                Some(value_end + 1)
            } else {
                single_type_end(sig, pos + 1, arrays + 1, structs)
            }
        }
        b'(' => {
            if structs >= MAX_CONTAINER_DEPTH {
                return None;
            }
            let mut cursor = pos + 1;
            if sig.get(cursor) == Some(&b')') {
                return None;
            }
            while sig.get(cursor) != Some(&b')') {
                cursor = single_type_end(sig, cursor, arrays, structs + 1)?;
            }
            Some(cursor + 1)
        }
        _ => None,
    }
}

/// Validate a signature. With `single` set it must hold exactly one
/// complete type.
pub fn validate_signature(sig: &str, single: bool) -> bool {
    if sig.len() > MAX_SIGNATURE_LENGTH {
        return false;
    }
    let bytes = sig.as_bytes();
    let mut cursor = 0;
    let mut count = 0;
    while cursor < bytes.len() {
        match single_type_end(bytes, cursor, 0, 0) {
            Some(end) => cursor = end,
            None => return false,
        }
        count += 1;
    }
    if single {
        count == 1
    } else {
        true
    }
}

/// The first complete type of `sig`.
pub fn element_type(sig: &str) -> Option<&str> {
    let end = single_type_end(sig.as_bytes(), 0, 0, 0)?;
    Some(&sig[..end])
}

/// Split a signature into its complete types.
pub fn split_types(sig: &str) -> Option<Vec<&str>> {
    let bytes = sig.as_bytes();
    let mut types = Vec::new();
    let mut cursor = 0;
    while cursor < bytes.len() {
        let end = single_type_end(bytes, cursor, 0, 0)?;
        types.push(&sig[cursor..end]);
        cursor = end;
    }
    Some(types)
}

/// Element signature of an array type, `"{sv}"` for `"a{sv}"`.
pub fn array_element(sig: &str) -> Option<&str> {
    let end = single_type_end(sig.as_bytes(), 0, 0, 0)?;
    if !sig.starts_with('a') || end != sig.len() {
        return None;
    }
    Some(&sig[1..end])
}

/// Member types of a struct `(...)` or dict entry `{..}`.
pub fn sub_elements(container: &str) -> Option<Vec<&str>> {
    let bytes = container.as_bytes();
    let (open, close) = (*bytes.first()?, *bytes.last()?);
    if bytes.len() < 3 || !matches!((open, close), (b'(', b')') | (b'{', b'}')) {
        return None;
    }
    let members = split_types(&container[1..container.len() - 1])?;
    if open == b'{' && (members.len() != 2 || !is_basic_code(members[0].as_bytes()[0])) {
        return None;
    }
    Some(members)
}

/// The value kind a signature accepts, or `None` when any kind goes (`v`).
pub fn expected_kind(sig: &str) -> Option<ValueKind> {
    let bytes = sig.as_bytes();
    match bytes.first()? {
        b'b' => Some(ValueKind::Bool),
        b'y' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'h' => Some(ValueKind::Int64),
        b'd' => Some(ValueKind::Double),
        b's' | b'o' | b'g' => Some(ValueKind::String),
        b'a' if bytes.get(1) == Some(&b'{') => Some(ValueKind::Dict),
        b'a' | b'(' | b'{' => Some(ValueKind::Array),
        _ => None,
    }
}

/// Derive a signature from a value.
///
/// Integers that fit 32 bits infer `i`, wider ones `x`; a sequence mixing
/// both widens every element to `x`. Arrays whose elements disagree
/// otherwise degrade to a struct, and elements that infer nothing (e.g.
/// empty nested arrays or void) are skipped. Dict values follow the same
/// rules but must agree. Void, empty arrays and empty dicts infer nothing.
pub fn infer_signature(value: &Value) -> Option<String> {
    match value {
        Value::Void => None,
        Value::Bool(_) => Some("b".to_string()),
        Value::Int64(v) => {
            if i32::try_from(*v).is_ok() {
                Some("i".to_string())
            } else {
                Some("x".to_string())
            }
        }
        Value::Double(_) => Some("d".to_string()),
        Value::String(_) => Some("s".to_string()),
        Value::Variant(_) => Some("v".to_string()),
        Value::Array(items) => {
            let signatures = widen_integers(items.iter().filter_map(infer_signature).collect());
            let first = signatures.first()?;
            if signatures.iter().all(|sig| sig == first) {
                Some(format!("a{}", first))
            } else {
                Some(format!("({})", signatures.concat()))
            }
        }
        Value::Dict(map) => {
            let signatures = widen_integers(map.values().filter_map(infer_signature).collect());
            let first = signatures.first()?;
            if signatures.iter().all(|sig| sig == first) {
                Some(format!("a{{s{}}}", first))
            } else {
                None
            }
        }
    }
}

/// `i` and `x` siblings all become `x`, so 32-bit values in a sequence of
/// 64-bit ones are not split into a struct.
fn widen_integers(mut signatures: Vec<String>) -> Vec<String> {
    let integers_only = signatures.iter().all(|sig| sig == "i" || sig == "x");
    if integers_only && signatures.iter().any(|sig| sig == "x") {
        for sig in &mut signatures {
            *sig = "x".to_string();
        }
    }
    signatures
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `/` or `/a/b_c/d0`: no empty components, no trailing slash.
pub fn validate_object_path(path: &str) -> bool {
    if !path.starts_with('/') {
        return false;
    }
    if path == "/" {
        return true;
    }
    path[1..]
        .split('/')
        .all(|component| !component.is_empty() && component.chars().all(is_name_char))
}

/// Dotted interface name with at least two elements, none starting with a digit.
pub fn validate_interface(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let elements: Vec<&str> = name.split('.').collect();
    elements.len() >= 2
        && elements.iter().all(|element| {
            element.chars().next().is_some_and(|c| !c.is_ascii_digit())
                && element.chars().all(is_name_char)
        })
}

/// Unique (`:1.42`) or well-known (`org.example.Service`) bus name.
pub fn validate_bus_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let (unique, body) = match name.strip_prefix(':') {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    let elements: Vec<&str> = body.split('.').collect();
    elements.len() >= 2
        && elements.iter().all(|element| {
            let mut chars = element.chars();
            match chars.next() {
                None => false,
                Some(first) if !unique && first.is_ascii_digit() => false,
                Some(_) => element.chars().all(|c| is_name_char(c) || c == '-'),
            }
        })
}

pub fn validate_member(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name.chars().next().is_some_and(|c| !c.is_ascii_digit())
        && name.chars().all(is_name_char)
}
