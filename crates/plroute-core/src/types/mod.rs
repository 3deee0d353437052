//! Values, type ids and the marshalers that move them on and off the wire.

pub mod builtin;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::catalog::Stamp;
use crate::error::{Result, RouteError};

/// Object id of a type in the host catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const BOOL: TypeId = TypeId(16);
    pub const BYTEA: TypeId = TypeId(17);
    pub const INT8: TypeId = TypeId(20);
    pub const INT2: TypeId = TypeId(21);
    pub const INT4: TypeId = TypeId(23);
    pub const TEXT: TypeId = TypeId(25);
    pub const FLOAT8: TypeId = TypeId(701);
    pub const RECORD: TypeId = TypeId(2249);
    pub const VOID: TypeId = TypeId(2278);

    /// int2, int4 and int8 are the only types a node number may come from.
    pub fn is_integer(self) -> bool {
        matches!(self, Self::INT2 | Self::INT4 | Self::INT8)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A non-null value. SQL NULL is `Option::None` wherever values travel.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int2(v) => Some(i64::from(*v)),
            Value::Int4(v) => Some(i64::from(*v)),
            Value::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int2(_) => "int2",
            Value::Int4(_) => "int4",
            Value::Int8(_) => "int8",
            Value::Float8(_) => "float8",
            Value::Text(_) => "text",
            Value::Bytea(_) => "bytea",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", if *v { "t" } else { "f" }),
            Value::Int2(v) => write!(f, "{v}"),
            Value::Int4(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Float8(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bytea(v) => write!(f, "{}", builtin::hex_encode(v)),
        }
    }
}

/// Encodes and decodes one type in both wire formats.
pub trait TypeMarshaler: fmt::Debug {
    fn supports_binary(&self) -> bool {
        true
    }
    fn send(&self, value: &Value) -> Result<Bytes>;
    fn receive(&self, raw: &[u8]) -> Result<Value>;
    fn output(&self, value: &Value) -> Result<String>;
    fn input(&self, raw: &str) -> Result<Value>;
}

/// A catalog type as the engine caches it.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: String,
    pub stamp: Stamp,
    marshaler: Arc<dyn TypeMarshaler>,
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name && self.stamp == other.stamp
    }
}

impl TypeInfo {
    pub fn new(id: TypeId, name: impl Into<String>, stamp: Stamp, marshaler: Arc<dyn TypeMarshaler>) -> Self {
        Self {
            id,
            name: name.into(),
            stamp,
            marshaler,
        }
    }

    pub fn supports_binary(&self) -> bool {
        self.marshaler.supports_binary()
    }

    pub fn encode(&self, value: Option<&Value>, binary: bool) -> Result<Option<Bytes>> {
        let Some(value) = value else {
            return Ok(None);
        };
        if binary {
            self.marshaler.send(value).map(Some)
        } else {
            self.marshaler.output(value).map(|s| Some(Bytes::from(s)))
        }
    }

    pub fn decode(&self, raw: Option<&[u8]>, binary: bool) -> Result<Option<Value>> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        if binary {
            self.marshaler.receive(raw).map(Some)
        } else {
            let text = std::str::from_utf8(raw)
                .map_err(|e| RouteError::Type(format!("{}: invalid utf8 in text value: {e}", self.name)))?;
            self.marshaler.input(text).map(Some)
        }
    }

    /// Parses a value written in the type's text form.
    pub fn parse_text(&self, raw: &str) -> Result<Value> {
        self.marshaler.input(raw)
    }

    pub fn format_text(&self, value: &Value) -> Result<String> {
        self.marshaler.output(value)
    }
}
