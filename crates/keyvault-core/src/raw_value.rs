//! Closed variant type for schema-less storage contents.

use std::collections::BTreeMap;

use serde_json::Value;

/// A decoded storage value. Decoded once from text, then matched per variant.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
}

impl RawValue {
    /// Parse JSON text. Returns `None` for anything that is not JSON.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str::<Value>(text).ok().map(Self::from)
    }

    /// Parse only when the text is a JSON array or object.
    pub fn parse_container(text: &str) -> Option<Self> {
        let trimmed = text.trim_start();
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return None;
        }
        Self::parse(trimmed).filter(RawValue::is_container)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, RawValue::Array(_) | RawValue::Map(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Number(n) => RawValue::Number(n.as_f64().unwrap_or_default()),
            Value::String(s) => RawValue::String(s),
            Value::Array(items) => RawValue::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                RawValue::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}
