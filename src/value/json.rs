//! JSON bridge for [`Value`], used by the CLI and configuration.
//!
//! Parsing and rendering go through `Value`'s own serde impls so object
//! key order is preserved both ways. Integers that fit `i64` stay `Int`;
//! every other number is a `Float`. Non-finite floats render as JSON `null`.
//! `serde_json` is built with `preserve_order`, so converting a
//! `serde_json::Value` object keeps its keys in document order too.

use super::{Map, Value};

/// Parse a JSON document into a value.
pub fn from_json_str(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(text)
}

/// Render a value as compact JSON.
pub fn to_json_string(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("null"))
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(obj) => {
                Self::Map(obj.into_iter().map(|(k, v)| (k, Self::from(v))).collect::<Map>())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::from(*i),
            Value::Float(x) => serde_json::Number::from_f64(*x).map_or(Self::Null, Self::Number),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from).collect()),
            Value::Map(map) => Self::Object(
                map.iter().map(|(k, v)| (k.clone(), Self::from(v))).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preserves_key_order_and_number_kinds() {
        let v = from_json_str(r#"{"z": 1, "a": 1.5, "m": [true, null, "s"]}"#).unwrap();
        let keys: Vec<&str> = v.as_map().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(v.get("z"), Some(&Value::Int(1)));
        assert_eq!(v.get("a"), Some(&Value::Float(1.5)));
    }

    #[test]
    fn test_duplicate_json_keys_rejected() {
        assert!(from_json_str(r#"{"a": 1, "a": 2}"#).is_err());
    }

    #[test]
    fn test_render_compact() {
        let v: Value = [("text", Value::from("hi")), ("n", Value::from(2))].into_iter().collect();
        let rendered = to_json_string(&v);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, serde_json::json!({"text": "hi", "n": 2}));
    }

    #[test]
    fn test_render_keeps_insertion_order() {
        let v: Value = [("z", 1), ("a", 2)].into_iter().collect();
        assert_eq!(to_json_string(&v), r#"{"z":1,"a":2}"#);
    }

    #[test]
    fn test_non_finite_float_renders_null() {
        assert_eq!(to_json_string(&Value::Float(f64::NAN)), "null");
    }

    #[test]
    fn test_from_serde_json_value() {
        let v = Value::from(serde_json::json!({"tokens": [1, 2, 3]}));
        assert_eq!(v.get("tokens"), Some(&Value::from(vec![1, 2, 3])));
    }

    #[test]
    fn test_from_serde_json_object_keeps_key_order() {
        let json: serde_json::Value = serde_json::from_str(r#"{"z": 1, "a": 2, "m": 3}"#).unwrap();
        let v = Value::from(json);
        let keys: Vec<&str> = v.as_map().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }
}
