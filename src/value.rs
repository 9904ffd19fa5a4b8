//! Decoding of wire `TypedValue`s into host scalars.

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::proto::gnmi::{typed_value, Decimal64, TypedValue};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("typed value carries no value")]
    Empty,

    #[error("unsupported value type {0}")]
    Unsupported(&'static str),

    #[error("invalid json value: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded scalar. `Json` holds the decoded tree for `json`/`json_ietf`
/// encodings, `Leaflist` recursively decodes each element.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Ascii(String),
    Bool(bool),
    Bytes(Vec<u8>),
    Decimal { digits: i64, precision: u32 },
    Float(f64),
    Int(i64),
    Uint(u64),
    String(String),
    Json(serde_json::Value),
    Leaflist(Vec<Value>),
}

pub fn decode(value: &TypedValue) -> Result<Value, DecodeError> {
    let value = value.value.as_ref().ok_or(DecodeError::Empty)?;

    let decoded = match value {
        typed_value::Value::AsciiVal(s) => Value::Ascii(s.clone()),
        typed_value::Value::BoolVal(b) => Value::Bool(*b),
        typed_value::Value::BytesVal(b) => Value::Bytes(b.clone()),
        typed_value::Value::DecimalVal(Decimal64 { digits, precision }) => Value::Decimal {
            digits: *digits,
            precision: *precision,
        },
        typed_value::Value::FloatVal(f) => Value::Float(f64::from(*f)),
        typed_value::Value::DoubleVal(d) => Value::Float(*d),
        typed_value::Value::IntVal(i) => Value::Int(*i),
        typed_value::Value::UintVal(u) => Value::Uint(*u),
        typed_value::Value::StringVal(s) => Value::String(s.clone()),
        typed_value::Value::JsonVal(raw) | typed_value::Value::JsonIetfVal(raw) => {
            Value::Json(serde_json::from_slice(raw)?)
        }
        typed_value::Value::LeaflistVal(array) => {
            let elements = array
                .element
                .iter()
                .map(decode)
                .collect::<Result<Vec<_>, _>>()?;
            Value::Leaflist(elements)
        }
        typed_value::Value::AnyVal(_) => return Err(DecodeError::Unsupported("any")),
        typed_value::Value::ProtoBytes(_) => return Err(DecodeError::Unsupported("proto_bytes")),
    };

    Ok(decoded)
}

impl Value {
    /// Numeric coercion used by the prometheus entry builder. Strings are
    /// parsed, booleans map to 0/1, everything else is not a sample.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Uint(u) => Some(*u as f64),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Decimal { digits, precision } => {
                Some(*digits as f64 / 10f64.powi(*precision as i32))
            }
            Value::String(s) | Value::Ascii(s) => s.parse().ok(),
            Value::Json(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Ascii(s) | Value::String(s) => serializer.serialize_str(s),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::Decimal { digits, precision } => {
                serializer.serialize_f64(*digits as f64 / 10f64.powi(*precision as i32))
            }
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Uint(u) => serializer.serialize_u64(*u),
            Value::Json(v) => v.serialize(serializer),
            Value::Leaflist(elements) => {
                let mut seq = serializer.serialize_seq(Some(elements.len()))?;
                for element in elements {
                    seq.serialize_element(element)?;
                }
                seq.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(value: typed_value::Value) -> TypedValue {
        TypedValue { value: Some(value) }
    }

    #[test]
    fn decode_scalars() {
        for (input, expected) in [
            (typed_value::Value::IntVal(-7), Value::Int(-7)),
            (typed_value::Value::UintVal(42), Value::Uint(42)),
            (typed_value::Value::BoolVal(true), Value::Bool(true)),
            (
                typed_value::Value::StringVal("up".into()),
                Value::String("up".into()),
            ),
            (
                typed_value::Value::AsciiVal("eth0".into()),
                Value::Ascii("eth0".into()),
            ),
            (typed_value::Value::DoubleVal(1.5), Value::Float(1.5)),
            (
                typed_value::Value::DecimalVal(Decimal64 {
                    digits: 1234,
                    precision: 2,
                }),
                Value::Decimal {
                    digits: 1234,
                    precision: 2,
                },
            ),
        ] {
            assert_eq!(decode(&typed(input)).unwrap(), expected);
        }
    }

    #[test]
    fn decode_json_tree() {
        let raw = br#"{"counters": {"in-octets": "123"}}"#.to_vec();
        let value = decode(&typed(typed_value::Value::JsonIetfVal(raw))).unwrap();
        match value {
            Value::Json(tree) => {
                assert_eq!(tree["counters"]["in-octets"], "123");
            }
            other => panic!("expected json tree, got {other:?}"),
        }
    }

    #[test]
    fn decode_leaflist() {
        let value = typed(typed_value::Value::LeaflistVal(crate::proto::gnmi::ScalarArray {
            element: vec![
                typed(typed_value::Value::IntVal(1)),
                typed(typed_value::Value::StringVal("two".into())),
            ],
        }));

        assert_eq!(
            decode(&value).unwrap(),
            Value::Leaflist(vec![Value::Int(1), Value::String("two".into())])
        );
    }

    #[test]
    fn decode_empty_is_error() {
        assert!(matches!(
            decode(&TypedValue { value: None }),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn float_coercion() {
        assert_eq!(Value::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(Value::Uint(3).as_f64(), Some(3.0));
        assert_eq!(Value::String("2.5".into()).as_f64(), Some(2.5));
        assert_eq!(Value::String("up".into()).as_f64(), None);
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(
            Value::Decimal {
                digits: 1234,
                precision: 2
            }
            .as_f64(),
            Some(12.34)
        );
        assert_eq!(Value::Bytes(vec![1]).as_f64(), None);
    }
}
