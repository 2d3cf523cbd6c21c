//! JSON wire encoding of [`Message`].
//!
//! Strings, longs and booleans map onto their JSON counterparts. Types JSON
//! cannot express directly use single-key tagged objects:
//!
//! - double: `{"_d_": 1.5}` (non-finite as `"NaN"`, `"Infinity"`, `"-Infinity"`)
//! - timestamp: `{"_m_": <epoch millis>}`
//! - opaque: `{"_o_": "<base64>"}`
//!
//! Any other object is a nested message. Arrays hold the encoding of their
//! elements; an empty array decodes as an empty string array.
//!
//! Field names that look like a tag (`_d_`, `__d_`, ...) gain one extra
//! leading underscore on the wire, so a nested message holding a single such
//! field is never mistaken for a tagged value.

use std::borrow::Cow;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};

use super::{FieldValue, Message};
use crate::utils::error::{Error, Result};

const DOUBLE_TAG: &str = "_d_";
const MILLIS_TAG: &str = "_m_";
const OPAQUE_TAG: &str = "_o_";

pub fn encode(message: &Message) -> Value {
    let mut map = Map::with_capacity(message.len());
    for (name, value) in message.iter() {
        map.insert(escape_name(name).into_owned(), encode_value(value));
    }
    Value::Object(map)
}

pub fn decode(value: &Value) -> Result<Message> {
    let Value::Object(map) = value else {
        return Err(Error::invalid_argument("message body must be a JSON object"));
    };
    let mut message = Message::new();
    for (name, raw) in map {
        let field = decode_value(raw)
            .map_err(|e| Error::invalid_argument(format!("field '{name}': {}", e.reason())))?;
        message.set(unescape_name(name).into_owned(), field);
    }
    Ok(message)
}

pub fn to_bytes(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&encode(message))?)
}

pub fn from_slice(bytes: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode(&value)
}

/// True for one or more underscores followed by a tag body (`d_`, `m_`, `o_`).
fn is_tag_like(name: &str) -> bool {
    let rest = name.trim_start_matches('_');
    rest.len() < name.len() && matches!(rest, "d_" | "m_" | "o_")
}

fn escape_name(name: &str) -> Cow<'_, str> {
    if is_tag_like(name) {
        Cow::Owned(format!("_{name}"))
    } else {
        Cow::Borrowed(name)
    }
}

fn unescape_name(name: &str) -> Cow<'_, str> {
    if is_tag_like(name) && name.starts_with("__") {
        Cow::Borrowed(&name[1..])
    } else {
        Cow::Borrowed(name)
    }
}

fn encode_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::String(s) => Value::String(s.clone()),
        FieldValue::Long(v) => Value::Number(Number::from(*v)),
        FieldValue::Boolean(v) => Value::Bool(*v),
        FieldValue::Double(v) => encode_double(*v),
        FieldValue::DateTime(v) => encode_datetime(v),
        FieldValue::Opaque(bytes) => tagged(OPAQUE_TAG, Value::String(STANDARD.encode(bytes))),
        FieldValue::Message(m) => encode(m),
        FieldValue::StringArray(items) => {
            Value::Array(items.iter().cloned().map(Value::String).collect())
        }
        FieldValue::LongArray(items) => Value::Array(
            items
                .iter()
                .map(|v| Value::Number(Number::from(*v)))
                .collect(),
        ),
        FieldValue::DoubleArray(items) => {
            Value::Array(items.iter().map(|v| encode_double(*v)).collect())
        }
        FieldValue::BooleanArray(items) => {
            Value::Array(items.iter().map(|v| Value::Bool(*v)).collect())
        }
        FieldValue::DateTimeArray(items) => {
            Value::Array(items.iter().map(encode_datetime).collect())
        }
        FieldValue::OpaqueArray(items) => Value::Array(
            items
                .iter()
                .map(|bytes| tagged(OPAQUE_TAG, Value::String(STANDARD.encode(bytes))))
                .collect(),
        ),
        FieldValue::MessageArray(items) => Value::Array(items.iter().map(encode).collect()),
    }
}

fn tagged(tag: &str, inner: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(tag.to_string(), inner);
    Value::Object(map)
}

fn encode_double(v: f64) -> Value {
    let inner = match Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None if v.is_nan() => Value::String("NaN".into()),
        None if v > 0.0 => Value::String("Infinity".into()),
        None => Value::String("-Infinity".into()),
    };
    tagged(DOUBLE_TAG, inner)
}

fn encode_datetime(v: &DateTime<Utc>) -> Value {
    tagged(MILLIS_TAG, Value::Number(Number::from(v.timestamp_millis())))
}

fn decode_value(raw: &Value) -> Result<FieldValue> {
    match raw {
        Value::String(s) => Ok(FieldValue::String(s.clone())),
        Value::Bool(b) => Ok(FieldValue::Boolean(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(v) => Ok(FieldValue::Long(v)),
            None => n
                .as_f64()
                .map(FieldValue::Double)
                .ok_or_else(|| Error::invalid_argument("number out of range")),
        },
        Value::Object(map) => decode_object(map),
        Value::Array(items) => decode_array(items),
        Value::Null => Err(Error::invalid_argument("null values are not supported")),
    }
}

fn decode_object(map: &Map<String, Value>) -> Result<FieldValue> {
    if map.len() == 1 {
        if let Some(inner) = map.get(DOUBLE_TAG) {
            return decode_double(inner).map(FieldValue::Double);
        }
        if let Some(inner) = map.get(MILLIS_TAG) {
            return decode_datetime(inner).map(FieldValue::DateTime);
        }
        if let Some(inner) = map.get(OPAQUE_TAG) {
            let text = inner
                .as_str()
                .ok_or_else(|| Error::invalid_argument("opaque value must be a string"))?;
            return STANDARD
                .decode(text)
                .map(FieldValue::Opaque)
                .map_err(|e| Error::invalid_argument(format!("bad base64: {e}")));
        }
    }
    decode(&Value::Object(map.clone())).map(FieldValue::Message)
}

fn decode_double(inner: &Value) -> Result<f64> {
    match inner {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::invalid_argument("double out of range")),
        Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => Err(Error::invalid_argument(format!("bad double '{other}'"))),
        },
        _ => Err(Error::invalid_argument("double value must be a number")),
    }
}

fn decode_datetime(inner: &Value) -> Result<DateTime<Utc>> {
    let millis = inner
        .as_i64()
        .ok_or_else(|| Error::invalid_argument("timestamp must be integer millis"))?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::invalid_argument("timestamp out of range"))
}

fn decode_array(items: &[Value]) -> Result<FieldValue> {
    let decoded = items
        .iter()
        .map(decode_value)
        .collect::<Result<Vec<_>>>()?;

    let kind = match decoded.first() {
        Some(first) => first.type_name(),
        None => return Ok(FieldValue::StringArray(Vec::new())),
    };

    macro_rules! collect_as {
        ($variant:ident, $array:ident) => {
            decoded
                .into_iter()
                .map(|v| match v {
                    FieldValue::$variant(inner) => Ok(inner),
                    other => Err(Error::invalid_argument(format!(
                        "heterogeneous array: found {}",
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<_>>>()
                .map(FieldValue::$array)
        };
    }

    match kind {
        "string" => collect_as!(String, StringArray),
        "long" => collect_as!(Long, LongArray),
        "double" => collect_as!(Double, DoubleArray),
        "boolean" => collect_as!(Boolean, BooleanArray),
        "datetime" => collect_as!(DateTime, DateTimeArray),
        "opaque" => collect_as!(Opaque, OpaqueArray),
        "message" => collect_as!(Message, MessageArray),
        other => Err(Error::invalid_argument(format!(
            "arrays of {other} are not supported"
        ))),
    }
}
