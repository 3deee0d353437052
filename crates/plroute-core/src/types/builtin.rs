//! Marshalers for the builtin scalar types.

use std::sync::Arc;

use bytes::Bytes;

use super::{TypeId, TypeMarshaler, Value};
use crate::error::{Result, RouteError};

fn mismatch(expected: &str, value: &Value) -> RouteError {
    RouteError::Type(format!("expected {expected} value, got {}", value.kind()))
}

fn bad_length(type_name: &str, expected: usize, got: usize) -> RouteError {
    RouteError::Type(format!(
        "invalid binary {type_name}: expected {expected} bytes, got {got}"
    ))
}

fn integer_arg<T: TryFrom<i64>>(type_name: &str, value: &Value) -> Result<T> {
    let wide = value.as_i64().ok_or_else(|| mismatch(type_name, value))?;
    T::try_from(wide).map_err(|_| RouteError::Type(format!("value {wide} is out of range for type {type_name}")))
}

#[derive(Debug)]
pub struct BoolType;

impl TypeMarshaler for BoolType {
    fn send(&self, value: &Value) -> Result<Bytes> {
        match value {
            Value::Bool(b) => Ok(Bytes::copy_from_slice(&[u8::from(*b)])),
            other => Err(mismatch("bool", other)),
        }
    }

    fn receive(&self, raw: &[u8]) -> Result<Value> {
        match raw {
            [b] => Ok(Value::Bool(*b != 0)),
            _ => Err(bad_length("bool", 1, raw.len())),
        }
    }

    fn output(&self, value: &Value) -> Result<String> {
        match value {
            Value::Bool(b) => Ok(if *b { "t" } else { "f" }.to_string()),
            other => Err(mismatch("bool", other)),
        }
    }

    fn input(&self, raw: &str) -> Result<Value> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
            "f" | "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
            _ => Err(RouteError::Type(format!(
                "invalid input syntax for type boolean: \"{raw}\""
            ))),
        }
    }
}

macro_rules! int_marshaler {
    ($name:ident, $ty:ty, $variant:ident, $label:literal) => {
        #[derive(Debug)]
        pub struct $name;

        impl TypeMarshaler for $name {
            fn send(&self, value: &Value) -> Result<Bytes> {
                let v: $ty = integer_arg($label, value)?;
                Ok(Bytes::copy_from_slice(&v.to_be_bytes()))
            }

            fn receive(&self, raw: &[u8]) -> Result<Value> {
                let bytes: [u8; std::mem::size_of::<$ty>()] = raw
                    .try_into()
                    .map_err(|_| bad_length($label, std::mem::size_of::<$ty>(), raw.len()))?;
                Ok(Value::$variant(<$ty>::from_be_bytes(bytes)))
            }

            fn output(&self, value: &Value) -> Result<String> {
                let v: $ty = integer_arg($label, value)?;
                Ok(v.to_string())
            }

            fn input(&self, raw: &str) -> Result<Value> {
                raw.trim().parse::<$ty>().map(Value::$variant).map_err(|_| {
                    RouteError::Type(format!(
                        "invalid input syntax for type {}: \"{raw}\"",
                        $label
                    ))
                })
            }
        }
    };
}

int_marshaler!(Int2Type, i16, Int2, "int2");
int_marshaler!(Int4Type, i32, Int4, "int4");
int_marshaler!(Int8Type, i64, Int8, "int8");

#[derive(Debug)]
pub struct Float8Type;

impl TypeMarshaler for Float8Type {
    fn send(&self, value: &Value) -> Result<Bytes> {
        match value {
            Value::Float8(v) => Ok(Bytes::copy_from_slice(&v.to_bits().to_be_bytes())),
            other => Err(mismatch("float8", other)),
        }
    }

    fn receive(&self, raw: &[u8]) -> Result<Value> {
        let bytes: [u8; 8] = raw.try_into().map_err(|_| bad_length("float8", 8, raw.len()))?;
        Ok(Value::Float8(f64::from_bits(u64::from_be_bytes(bytes))))
    }

    fn output(&self, value: &Value) -> Result<String> {
        match value {
            Value::Float8(v) if v.is_nan() => Ok("NaN".to_string()),
            Value::Float8(v) if v.is_infinite() => {
                Ok(if *v > 0.0 { "Infinity" } else { "-Infinity" }.to_string())
            }
            Value::Float8(v) => Ok(v.to_string()),
            other => Err(mismatch("float8", other)),
        }
    }

    fn input(&self, raw: &str) -> Result<Value> {
        let v = match raw.trim() {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            other => other.parse::<f64>().map_err(|_| {
                RouteError::Type(format!(
                    "invalid input syntax for type double precision: \"{raw}\""
                ))
            })?,
        };
        Ok(Value::Float8(v))
    }
}

#[derive(Debug)]
pub struct TextType;

impl TypeMarshaler for TextType {
    fn send(&self, value: &Value) -> Result<Bytes> {
        self.output(value).map(Bytes::from)
    }

    fn receive(&self, raw: &[u8]) -> Result<Value> {
        String::from_utf8(raw.to_vec())
            .map(Value::Text)
            .map_err(|e| RouteError::Type(format!("invalid utf8 in text value: {e}")))
    }

    fn output(&self, value: &Value) -> Result<String> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(mismatch("text", other)),
        }
    }

    fn input(&self, raw: &str) -> Result<Value> {
        Ok(Value::Text(raw.to_string()))
    }
}

#[derive(Debug)]
pub struct ByteaType;

impl TypeMarshaler for ByteaType {
    fn send(&self, value: &Value) -> Result<Bytes> {
        match value {
            Value::Bytea(b) => Ok(Bytes::copy_from_slice(b)),
            other => Err(mismatch("bytea", other)),
        }
    }

    fn receive(&self, raw: &[u8]) -> Result<Value> {
        Ok(Value::Bytea(raw.to_vec()))
    }

    fn output(&self, value: &Value) -> Result<String> {
        match value {
            Value::Bytea(b) => Ok(hex_encode(b)),
            other => Err(mismatch("bytea", other)),
        }
    }

    fn input(&self, raw: &str) -> Result<Value> {
        hex_decode(raw).map(Value::Bytea)
    }
}

/// Rows of an anonymous record travel as their text form only.
#[derive(Debug)]
pub struct RecordType;

impl TypeMarshaler for RecordType {
    fn supports_binary(&self) -> bool {
        false
    }

    fn send(&self, _value: &Value) -> Result<Bytes> {
        Err(RouteError::Type("record values have no binary form".to_string()))
    }

    fn receive(&self, _raw: &[u8]) -> Result<Value> {
        Err(RouteError::Type("record values have no binary form".to_string()))
    }

    fn output(&self, value: &Value) -> Result<String> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(mismatch("record", other)),
        }
    }

    fn input(&self, raw: &str) -> Result<Value> {
        Ok(Value::Text(raw.to_string()))
    }
}

/// void results carry no data; whatever a node sends back is discarded.
#[derive(Debug)]
pub struct VoidType;

impl TypeMarshaler for VoidType {
    fn send(&self, _value: &Value) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    fn receive(&self, _raw: &[u8]) -> Result<Value> {
        Ok(Value::Text(String::new()))
    }

    fn output(&self, _value: &Value) -> Result<String> {
        Ok(String::new())
    }

    fn input(&self, _raw: &str) -> Result<Value> {
        Ok(Value::Text(String::new()))
    }
}

/// Name and marshaler of a builtin type.
pub fn lookup(id: TypeId) -> Option<(&'static str, Arc<dyn TypeMarshaler>)> {
    let entry: (&'static str, Arc<dyn TypeMarshaler>) = match id {
        TypeId::BOOL => ("bool", Arc::new(BoolType)),
        TypeId::BYTEA => ("bytea", Arc::new(ByteaType)),
        TypeId::INT8 => ("int8", Arc::new(Int8Type)),
        TypeId::INT2 => ("int2", Arc::new(Int2Type)),
        TypeId::INT4 => ("int4", Arc::new(Int4Type)),
        TypeId::TEXT => ("text", Arc::new(TextType)),
        TypeId::FLOAT8 => ("float8", Arc::new(Float8Type)),
        TypeId::RECORD => ("record", Arc::new(RecordType)),
        TypeId::VOID => ("void", Arc::new(VoidType)),
        _ => return None,
    };
    Some(entry)
}

/// Resolves the usual spellings of a builtin type name.
pub fn id_by_name(name: &str) -> Option<TypeId> {
    let id = match name.trim().to_ascii_lowercase().as_str() {
        "bool" | "boolean" => TypeId::BOOL,
        "bytea" => TypeId::BYTEA,
        "int8" | "bigint" => TypeId::INT8,
        "int2" | "smallint" => TypeId::INT2,
        "int4" | "int" | "integer" => TypeId::INT4,
        "text" | "varchar" => TypeId::TEXT,
        "float8" | "double precision" => TypeId::FLOAT8,
        "record" => TypeId::RECORD,
        "void" => TypeId::VOID,
        _ => return None,
    };
    Some(id)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push(DIGITS[usize::from(b >> 4)] as char);
        out.push(DIGITS[usize::from(b & 0x0f)] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>> {
    let invalid = || RouteError::Type(format!("invalid input syntax for type bytea: \"{raw}\""));
    let digits = raw.strip_prefix("\\x").ok_or_else(invalid)?;
    if digits.len() % 2 != 0 {
        return Err(invalid());
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).ok_or_else(invalid)?;
            let lo = (pair[1] as char).to_digit(16).ok_or_else(invalid)?;
            Ok((hi * 16 + lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int4_binary_is_big_endian() {
        let bytes = Int4Type.send(&Value::Int4(258)).unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 1, 2]);
        assert_eq!(Int4Type.receive(&bytes).unwrap(), Value::Int4(258));
    }

    #[test]
    fn int2_rejects_wide_values() {
        let err = Int2Type.send(&Value::Int8(70_000)).unwrap_err();
        assert!(err.to_string().contains("out of range for type int2"));
    }

    #[test]
    fn int8_accepts_narrower_integers() {
        let bytes = Int8Type.send(&Value::Int2(-1)).unwrap();
        assert_eq!(bytes.as_ref(), &[0xff; 8]);
    }

    #[test]
    fn receive_checks_length() {
        assert!(Int8Type.receive(&[0, 1]).is_err());
        assert!(BoolType.receive(&[]).is_err());
    }

    #[test]
    fn float8_text_special_values() {
        assert_eq!(Float8Type.output(&Value::Float8(f64::INFINITY)).unwrap(), "Infinity");
        assert_eq!(Float8Type.input("-Infinity").unwrap(), Value::Float8(f64::NEG_INFINITY));
        assert_eq!(Float8Type.input("1.5").unwrap(), Value::Float8(1.5));
    }

    #[test]
    fn bytea_hex_text_form() {
        let text = ByteaType.output(&Value::Bytea(vec![0xde, 0xad, 0x01])).unwrap();
        assert_eq!(text, "\\xdead01");
        assert_eq!(ByteaType.input(&text).unwrap(), Value::Bytea(vec![0xde, 0xad, 0x01]));
        assert!(ByteaType.input("\\xabc").is_err());
    }

    #[test]
    fn record_has_no_binary_form() {
        assert!(!RecordType.supports_binary());
        assert!(TextType.supports_binary());
    }

    #[test]
    fn builtin_lookup_by_id_and_name() {
        assert_eq!(id_by_name("integer"), Some(TypeId::INT4));
        assert_eq!(id_by_name("BIGINT"), Some(TypeId::INT8));
        let (name, _) = lookup(TypeId::INT2).unwrap();
        assert_eq!(name, "int2");
        assert!(lookup(TypeId(99_999)).is_none());
    }
}
