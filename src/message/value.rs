use chrono::{DateTime, Utc};

use super::Message;

/// A typed field value.
///
/// Arrays are homogeneous by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Opaque(Vec<u8>),
    Message(Message),
    StringArray(Vec<String>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    BooleanArray(Vec<bool>),
    DateTimeArray(Vec<DateTime<Utc>>),
    OpaqueArray(Vec<Vec<u8>>),
    MessageArray(Vec<Message>),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::String(_) => "string",
            FieldValue::Long(_) => "long",
            FieldValue::Double(_) => "double",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::DateTime(_) => "datetime",
            FieldValue::Opaque(_) => "opaque",
            FieldValue::Message(_) => "message",
            FieldValue::StringArray(_) => "string array",
            FieldValue::LongArray(_) => "long array",
            FieldValue::DoubleArray(_) => "double array",
            FieldValue::BooleanArray(_) => "boolean array",
            FieldValue::DateTimeArray(_) => "datetime array",
            FieldValue::OpaqueArray(_) => "opaque array",
            FieldValue::MessageArray(_) => "message array",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::DateTime(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Opaque(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            FieldValue::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Scalar rendering used as a last-value key. Composite values have none.
    pub fn key_string(&self) -> Option<String> {
        match self {
            FieldValue::String(s) => Some(s.clone()),
            FieldValue::Long(v) => Some(v.to_string()),
            FieldValue::Boolean(v) => Some(v.to_string()),
            _ => None,
        }
    }
}

macro_rules! field_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value)
                }
            }
        )*
    };
}

field_from! {
    String => String,
    i64 => Long,
    f64 => Double,
    bool => Boolean,
    DateTime<Utc> => DateTime,
    Vec<u8> => Opaque,
    Message => Message,
    Vec<String> => StringArray,
    Vec<i64> => LongArray,
    Vec<f64> => DoubleArray,
    Vec<bool> => BooleanArray,
    Vec<DateTime<Utc>> => DateTimeArray,
    Vec<Vec<u8>> => OpaqueArray,
    Vec<Message> => MessageArray,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Long(i64::from(value))
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        FieldValue::Opaque(value.to_vec())
    }
}
