use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Structured value passed across the host/script boundary. Arguments and
/// results are always passed by value; no reference identity survives the
/// crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<HostValue>),
    Map(BTreeMap<String, HostValue>),
}

impl HostValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, HostValue>> {
        match self {
            Self::Map(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
        }
    }
}

impl Default for HostValue {
    fn default() -> Self {
        Self::Null
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_serde_round_trips_json_shapes() {
        let value: HostValue =
            serde_json::from_str(r#"{"n": 1.5, "s": "x", "a": [true, null]}"#)
                .expect("json should deserialize");
        let map = value.as_map().expect("top level should be a map");
        assert_eq!(map.get("n").and_then(HostValue::as_number), Some(1.5));
        assert_eq!(map.get("s").and_then(HostValue::as_string), Some("x"));

        let text = serde_json::to_string(&value).expect("json should serialize");
        let back: HostValue = serde_json::from_str(&text).expect("round trip");
        assert_eq!(back, value);
    }

    #[test]
    fn type_names_cover_all_variants() {
        assert_eq!(HostValue::Null.type_name(), "null");
        assert_eq!(HostValue::Bool(true).type_name(), "boolean");
        assert_eq!(HostValue::Number(1.0).type_name(), "number");
        assert_eq!(HostValue::from("x").type_name(), "string");
        assert_eq!(HostValue::Array(Vec::new()).type_name(), "array");
        assert_eq!(HostValue::Map(BTreeMap::new()).type_name(), "map");
    }
}
