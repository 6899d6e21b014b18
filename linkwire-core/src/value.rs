//! Restricted value tree and its format-descriptor codec.
//!
//! A [`Value`] encodes to a `(format, body)` pair: `format` is a compact
//! textual descriptor of the shape and leaf sizes, `body` is the
//! concatenation of leaf bytes in traversal order. This is the container
//! codec described for structured payloads; ordinary user commands carry
//! only a leaf's raw bytes on the wire (see the crate-level docs), but the
//! full format+body pair is exercised here and by callers that want to
//! serialize a whole value tree in one shot.

use std::fmt;

use crate::error::TypeCoercionError;

/// A value in the restricted tree the codec understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Bytes(Vec<u8>),
    Int(i64),
    Float(f32),
    Bool(bool),
    Null,
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered key/value pairs; keys are always text.
    Dict(Vec<(String, Value)>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Encode a value to its `(format, body)` pair.
pub fn encode(value: &Value) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    let (format, _) = write_value(value, &mut body, true);
    (format, body)
}

/// Decode a value from a previously produced `(format, body)` pair.
pub fn decode(format: &str, body: &[u8]) -> Result<Value, TypeCoercionError> {
    if format.is_empty() {
        return Ok(Value::Null);
    }

    let first = format.as_bytes()[0] as char;
    let mut pos = 0usize;

    match first {
        'l' | 't' | 'd' => {
            let inner = &format[1..];
            let items = parse_sequence(inner, body, &mut pos)?;
            Ok(match first {
                'l' => Value::List(items),
                't' => Value::Tuple(items),
                _ => Value::Dict(pair_up(items)?),
            })
        }
        _ => {
            let (value, rest) = parse_one(format, body, &mut pos)?;
            if !rest.is_empty() {
                return Err(TypeCoercionError::new(
                    "value",
                    format!("trailing format data after top-level leaf: {:?}", rest),
                ));
            }
            Ok(value)
        }
    }
}

fn write_value(value: &Value, body: &mut Vec<u8>, top: bool) -> (String, usize) {
    match value {
        Value::Text(s) => leaf(body, 's', s.as_bytes()),
        Value::Bytes(b) => leaf(body, 'b', b),
        Value::Int(i) => leaf(body, 'i', i.to_string().as_bytes()),
        Value::Float(f) => leaf(body, 'f', &f.to_be_bytes()),
        Value::Bool(b) => leaf(body, 'o', &[if *b { 1 } else { 0 }]),
        Value::Null => leaf(body, 'n', &[]),
        Value::List(items) => write_container(items.iter(), body, top, 'l', '[', ']'),
        Value::Tuple(items) => write_container(items.iter(), body, top, 't', '(', ')'),
        Value::Dict(pairs) => {
            let mut inner = String::new();
            let mut total = 0usize;
            for (k, v) in pairs {
                let (kf, kl) = write_value(&Value::Text(k.clone()), body, false);
                inner.push_str(&kf);
                total += kl;
                let (vf, vl) = write_value(v, body, false);
                inner.push_str(&vf);
                total += vl;
            }
            if top {
                (format!("d{inner}"), total)
            } else {
                (format!("{total}{{{inner}}}"), total)
            }
        }
    }
}

fn write_container<'a>(
    items: impl Iterator<Item = &'a Value>,
    body: &mut Vec<u8>,
    top: bool,
    top_tag: char,
    open: char,
    close: char,
) -> (String, usize) {
    let mut inner = String::new();
    let mut total = 0usize;
    for item in items {
        let (f, l) = write_value(item, body, false);
        inner.push_str(&f);
        total += l;
    }
    if top {
        (format!("{top_tag}{inner}"), total)
    } else {
        (format!("{total}{open}{inner}{close}"), total)
    }
}

fn leaf(body: &mut Vec<u8>, tag: char, bytes: &[u8]) -> (String, usize) {
    body.extend_from_slice(bytes);
    (format!("{}{}", bytes.len(), tag), bytes.len())
}

fn parse_sequence<'a>(
    mut fmt: &'a str,
    body: &[u8],
    pos: &mut usize,
) -> Result<Vec<Value>, TypeCoercionError> {
    let mut items = Vec::new();
    while !fmt.is_empty() {
        let (value, rest) = parse_one(fmt, body, pos)?;
        items.push(value);
        fmt = rest;
    }
    Ok(items)
}

fn pair_up(items: Vec<Value>) -> Result<Vec<(String, Value)>, TypeCoercionError> {
    if items.len() % 2 != 0 {
        return Err(TypeCoercionError::new(
            "dict",
            "odd number of items in dict format",
        ));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        match key {
            Value::Text(k) => pairs.push((k, value)),
            other => {
                return Err(TypeCoercionError::new(
                    "dict",
                    format!("dict key was not a text leaf: {other:?}"),
                ))
            }
        }
    }
    Ok(pairs)
}

fn parse_one<'a>(
    fmt: &'a str,
    body: &[u8],
    pos: &mut usize,
) -> Result<(Value, &'a str), TypeCoercionError> {
    let digit_end = fmt
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| TypeCoercionError::new("value", format!("no marker after digits in {fmt:?}")))?;
    if digit_end == 0 {
        return Err(TypeCoercionError::new(
            "value",
            format!("expected a length prefix in {fmt:?}"),
        ));
    }
    let len: usize = fmt[..digit_end]
        .parse()
        .map_err(|_| TypeCoercionError::new("value", format!("bad length prefix in {fmt:?}")))?;
    let marker = fmt.as_bytes()[digit_end] as char;
    let after_marker = &fmt[digit_end + 1..];

    match marker {
        's' | 'b' | 'i' | 'f' | 'o' | 'n' => {
            let end = *pos + len;
            let slice = body.get(*pos..end).ok_or_else(|| {
                TypeCoercionError::new("value", "body shorter than format declared")
            })?;
            *pos = end;
            Ok((decode_leaf(marker, slice)?, after_marker))
        }
        '[' | '(' | '{' => {
            let close = match marker {
                '[' => ']',
                '(' => ')',
                _ => '}',
            };
            let end = find_matching_close(after_marker, close)?;
            let inner_fmt = &after_marker[..end];
            let rest = &after_marker[end + close.len_utf8()..];
            let items = parse_sequence(inner_fmt, body, pos)?;
            let value = match marker {
                '[' => Value::List(items),
                '(' => Value::Tuple(items),
                _ => Value::Dict(pair_up(items)?),
            };
            Ok((value, rest))
        }
        _ => Err(TypeCoercionError::new(
            "value",
            format!("unknown format marker '{marker}'"),
        )),
    }
}

fn find_matching_close(s: &str, close: char) -> Result<usize, TypeCoercionError> {
    let mut depth = 1i32;
    for (idx, c) in s.char_indices() {
        match c {
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth -= 1,
            _ => {}
        }
        if depth == 0 {
            if c != close {
                return Err(TypeCoercionError::new(
                    "value",
                    format!("mismatched close bracket: expected '{close}', got '{c}'"),
                ));
            }
            return Ok(idx);
        }
    }
    Err(TypeCoercionError::new(
        "value",
        "unterminated container in format string",
    ))
}

fn decode_leaf(marker: char, bytes: &[u8]) -> Result<Value, TypeCoercionError> {
    match marker {
        's' => std::str::from_utf8(bytes)
            .map(|s| Value::Text(s.to_string()))
            .map_err(|e| TypeCoercionError::new("text", e.to_string())),
        'b' => Ok(Value::Bytes(bytes.to_vec())),
        'i' => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::Int)
            .ok_or_else(|| TypeCoercionError::new("int", "not a decimal integer")),
        'f' => {
            let arr: [u8; 4] = bytes
                .try_into()
                .map_err(|_| TypeCoercionError::new("float", "expected 4 bytes"))?;
            Ok(Value::Float(f32::from_be_bytes(arr)))
        }
        'o' => match bytes {
            [0] => Ok(Value::Bool(false)),
            [_] => Ok(Value::Bool(true)),
            _ => Err(TypeCoercionError::new("bool", "expected 1 byte")),
        },
        'n' => {
            if bytes.is_empty() {
                Ok(Value::Null)
            } else {
                Err(TypeCoercionError::new("null", "expected 0 bytes"))
            }
        }
        _ => Err(TypeCoercionError::new("value", "unknown leaf tag")),
    }
}

/// Shallow coercion used for user-command payloads, which carry only a
/// leaf's raw bytes (no format string) on the wire.
pub mod shallow {
    use super::*;

    pub fn encode(value: &Value) -> Result<Vec<u8>, TypeCoercionError> {
        match value {
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            Value::Bytes(b) => Ok(b.clone()),
            Value::Int(i) => Ok(i.to_string().into_bytes()),
            Value::Null => Ok(Vec::new()),
            other => Err(TypeCoercionError::new(
                "bytes|text|int|null",
                format!("{other:?} is not valid for a user-command payload"),
            )),
        }
    }

    pub fn decode_as(bytes: &[u8], target: Target) -> Result<Value, TypeCoercionError> {
        match target {
            Target::Bytes => Ok(Value::Bytes(bytes.to_vec())),
            Target::Text => std::str::from_utf8(bytes)
                .map(|s| Value::Text(s.to_string()))
                .map_err(|e| TypeCoercionError::new("text", e.to_string())),
            Target::Int => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .map(Value::Int)
                .ok_or_else(|| TypeCoercionError::new("int", "not a decimal integer")),
        }
    }

    /// Target types a user-command parameter may request coercion to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Target {
        Bytes,
        Text,
        Int,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let (format, body) = encode(&value);
        let decoded = decode(&format, &body).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn primitives_roundtrip() {
        roundtrip(Value::Text("hello".into()));
        roundtrip(Value::Bytes(vec![1, 2, 3]));
        roundtrip(Value::Int(-42));
        roundtrip(Value::Int(0));
        roundtrip(Value::Float(3.5));
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Null);
    }

    #[test]
    fn empty_containers_roundtrip() {
        roundtrip(Value::List(vec![]));
        roundtrip(Value::Tuple(vec![]));
        roundtrip(Value::Dict(vec![]));
    }

    #[test]
    fn flat_list_roundtrips() {
        roundtrip(Value::List(vec![
            Value::Int(1),
            Value::Text("two".into()),
            Value::Bytes(vec![3]),
        ]));
    }

    #[test]
    fn nested_containers_roundtrip() {
        roundtrip(Value::List(vec![
            Value::Tuple(vec![Value::Int(1), Value::Int(2)]),
            Value::Dict(vec![
                ("a".into(), Value::Bool(true)),
                ("b".into(), Value::List(vec![Value::Null, Value::Float(1.25)])),
            ]),
        ]));
    }

    #[test]
    fn dict_preserves_key_order() {
        let value = Value::Dict(vec![
            ("z".into(), Value::Int(1)),
            ("a".into(), Value::Int(2)),
        ]);
        let (format, body) = encode(&value);
        let decoded = decode(&format, &body).unwrap();
        match decoded {
            Value::Dict(pairs) => {
                assert_eq!(pairs[0].0, "z");
                assert_eq!(pairs[1].0, "a");
            }
            _ => panic!("expected dict"),
        }
    }

    #[test]
    fn malformed_format_is_type_coercion_error() {
        assert!(decode("5s", b"ab").is_err());
        assert!(decode("xyz", b"").is_err());
    }

    #[test]
    fn shallow_bytes_for_user_commands() {
        assert_eq!(
            shallow::encode(&Value::Text("hi".into())).unwrap(),
            b"hi".to_vec()
        );
        assert_eq!(
            shallow::decode_as(b"42", shallow::Target::Int).unwrap(),
            Value::Int(42)
        );
        assert!(shallow::encode(&Value::List(vec![])).is_err());
    }
}
