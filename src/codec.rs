//! Value Codec
//!
//! Values are stored in the `value` column as JSON text.
//!
//! ## Encoding
//! - `Value::Bytes` that are valid UTF-8 → JSON string
//! - other `Value::Bytes` → byte object `{"type":"Buffer","data":[..]}`
//! - `Value::Json` → stored verbatim
//!
//! ## Read shaping
//! By default values come back as bytes. With `as_buffer = false` or
//! `raw = true` the decoded JSON value is returned instead.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::Result;

/// A value written to or read from the store
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Opaque bytes
    Bytes(Vec<u8>),

    /// A structured value
    Json(Json),
}

impl Value {
    /// The bytes, if this is a byte value
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Json(_) => None,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(bytes: &[u8; N]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        Value::Json(json)
    }
}

/// Read-shaping flags for `get` and iterators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Return bytes (default true)
    pub as_buffer: bool,

    /// Return the decoded value untouched
    pub raw: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            as_buffer: true,
            raw: false,
        }
    }
}

impl ReadOptions {
    /// Shape results as decoded JSON values
    pub fn json() -> Self {
        Self {
            as_buffer: false,
            raw: false,
        }
    }

    pub fn wants_bytes(&self) -> bool {
        self.as_buffer && !self.raw
    }
}

/// JSON form of non-UTF-8 bytes
#[derive(Debug, Serialize, Deserialize)]
struct ByteObject {
    #[serde(rename = "type")]
    kind: String,
    data: Vec<u8>,
}

const BYTE_OBJECT_TAG: &str = "Buffer";

/// Serialize a value into its stored text form
pub fn encode(value: &Value) -> Result<String> {
    let text = match value {
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => serde_json::to_string(s)?,
            Err(_) => serde_json::to_string(&ByteObject {
                kind: BYTE_OBJECT_TAG.to_string(),
                data: bytes.clone(),
            })?,
        },
        Value::Json(json) => serde_json::to_string(json)?,
    };
    Ok(text)
}

/// Parse stored text and shape it per `options`
pub fn decode(text: &str, options: &ReadOptions) -> Result<Value> {
    let json: Json = serde_json::from_str(text)?;

    if !options.wants_bytes() {
        return Ok(Value::Json(json));
    }

    let bytes = match json {
        Json::String(s) => s.into_bytes(),
        other => match byte_object_data(&other) {
            Some(data) => data,
            None => serde_json::to_vec(&other)?,
        },
    };
    Ok(Value::Bytes(bytes))
}

fn byte_object_data(json: &Json) -> Option<Vec<u8>> {
    if !json.is_object() {
        return None;
    }
    match ByteObject::deserialize(json) {
        Ok(obj) if obj.kind == BYTE_OBJECT_TAG => Some(obj.data),
        _ => None,
    }
}
