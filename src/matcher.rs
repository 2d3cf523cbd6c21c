//! Content matchers.
//!
//! A matcher is a JSON object mapping field names to a test:
//!
//! - a string or integer literal: the field must hold an equal string/long;
//! - `true`: the field must be present;
//! - `false`: the field must be absent.
//!
//! An empty object (or no matcher at all) accepts every message.

use std::fmt;

use serde_json::Value;

use crate::message::{FieldValue, Message};
use crate::utils::error::{Error, ErrorCode, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    EqualsString(String),
    EqualsLong(i64),
    Present,
    Absent,
}

impl Predicate {
    fn accepts(&self, field: Option<&FieldValue>) -> bool {
        match (self, field) {
            (Predicate::Present, f) => f.is_some(),
            (Predicate::Absent, f) => f.is_none(),
            (Predicate::EqualsString(s), Some(FieldValue::String(v))) => s == v,
            (Predicate::EqualsLong(n), Some(FieldValue::Long(v))) => n == v,
            _ => false,
        }
    }
}

/// A parsed, validated matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    source: String,
    predicates: Vec<(String, Predicate)>,
}

impl Matcher {
    /// Matcher that accepts everything.
    pub fn any() -> Self {
        Self {
            source: "{}".to_string(),
            predicates: Vec::new(),
        }
    }

    /// Parses a matcher expression, failing with `SubscriptionInvalid` when it
    /// is not a JSON object of string/integer/boolean tests.
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Ok(Self::any());
        }

        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| invalid(format!("matcher is not valid JSON: {e}")))?;
        let Value::Object(map) = value else {
            return Err(invalid("matcher must be a JSON object"));
        };

        let mut predicates = Vec::with_capacity(map.len());
        for (field, test) in map {
            if field.is_empty() {
                return Err(invalid("matcher field names must not be empty"));
            }
            let predicate = match test {
                Value::String(s) => Predicate::EqualsString(s),
                Value::Bool(true) => Predicate::Present,
                Value::Bool(false) => Predicate::Absent,
                Value::Number(n) => match n.as_i64() {
                    Some(v) => Predicate::EqualsLong(v),
                    None => {
                        return Err(invalid(format!(
                            "matcher field '{field}' must be an integer"
                        )));
                    }
                },
                other => {
                    return Err(invalid(format!(
                        "matcher field '{field}' has unsupported test {other}"
                    )));
                }
            };
            predicates.push((field, predicate));
        }

        Ok(Self {
            source: trimmed.to_string(),
            predicates,
        })
    }

    /// Parses an optional matcher; `None` accepts everything.
    pub fn parse_opt(source: Option<&str>) -> Result<Self> {
        source.map_or_else(|| Ok(Self::any()), Self::parse)
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.predicates
            .iter()
            .all(|(field, predicate)| predicate.accepts(message.get(field)))
    }

    /// Whether the matcher tests `field` by value or presence.
    pub fn references(&self, field: &str) -> bool {
        self.predicates
            .iter()
            .any(|(name, p)| name == field && *p != Predicate::Absent)
    }

    /// Same tests, regardless of how the source text was written.
    pub fn equivalent(&self, other: &Matcher) -> bool {
        self.predicates.len() == other.predicates.len()
            && self.predicates.iter().all(|p| other.predicates.contains(p))
    }

    pub fn is_any(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::operation(ErrorCode::SubscriptionInvalid, reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(text: &str) -> Message {
        Message::new().with("type", "hello").with("text", text)
    }

    #[test]
    fn equality_on_strings() {
        let m = Matcher::parse(r#"{"type":"hello"}"#).unwrap();
        assert!(m.matches(&hello("hi")));
        assert!(!m.matches(&Message::new().with("type", "bye")));
        assert!(!m.matches(&Message::new()));
    }

    #[test]
    fn equality_on_longs_is_type_strict() {
        let m = Matcher::parse(r#"{"n": 5}"#).unwrap();
        assert!(m.matches(&Message::new().with("n", 5i64)));
        assert!(!m.matches(&Message::new().with("n", "5")));
    }

    #[test]
    fn presence_and_absence() {
        let m = Matcher::parse(r#"{"text": true, "secret": false}"#).unwrap();
        assert!(m.matches(&hello("hi")));
        assert!(!m.matches(&hello("hi").with("secret", 1i64)));
        assert!(!m.matches(&Message::new().with("type", "hello")));
    }

    #[test]
    fn empty_matcher_accepts_everything() {
        assert!(Matcher::parse("{}").unwrap().matches(&hello("x")));
        assert!(Matcher::parse("  ").unwrap().is_any());
        assert!(Matcher::parse_opt(None).unwrap().matches(&Message::new()));
    }

    #[test]
    fn malformed_matchers_are_subscription_invalid() {
        for bad in [
            "not json",
            "[1,2]",
            r#"{"a": 1.5}"#,
            r#"{"a": null}"#,
            r#"{"a": {"b": 1}}"#,
            r#"{"": "x"}"#,
        ] {
            let err = Matcher::parse(bad).unwrap_err();
            assert_eq!(err.code(), ErrorCode::SubscriptionInvalid.as_u16(), "{bad}");
        }
    }

    #[test]
    fn equivalence_ignores_formatting() {
        let a = Matcher::parse(r#"{"a": 1, "b": "x"}"#).unwrap();
        let b = Matcher::parse(r#"{ "b":"x","a":1 }"#).unwrap();
        assert!(a.equivalent(&b));
        assert!(!a.equivalent(&Matcher::any()));
    }

    #[test]
    fn references_ignores_absence_tests() {
        let m = Matcher::parse(r#"{"symbol": true, "gone": false}"#).unwrap();
        assert!(m.references("symbol"));
        assert!(!m.references("gone"));
        assert!(!m.references("other"));
    }
}
