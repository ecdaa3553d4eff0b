//! Typed access to operator arguments.
//!
//! A missing required field is a `RangeError`; a present field of the
//! wrong type is a `TypeError`. `Null` arguments behave like an empty map.

use crate::error::ValidationError;

use super::{Map, Value};

static EMPTY: std::sync::LazyLock<Map> = std::sync::LazyLock::new(Map::new);

/// Argument map of one operation, tagged with the operation name for errors.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    op: &'a str,
    map: &'a Map,
}

impl<'a> Args<'a> {
    /// Wrap `value` as the arguments of `op`.
    ///
    /// # Errors
    ///
    /// `TypeError` on field `args` if `value` is neither a map nor null.
    pub fn new(op: &'a str, value: &'a Value) -> Result<Self, ValidationError> {
        match value {
            Value::Map(map) => Ok(Self { op, map }),
            Value::Null => Ok(Self { op, map: &*EMPTY }),
            other => Err(ValidationError::Type {
                op: op.to_string(),
                field: "args".to_string(),
                expected: "map",
                actual: other.type_name(),
            }),
        }
    }

    /// The underlying map.
    pub fn map(&self) -> &'a Map {
        self.map
    }

    /// Raw field, or `RangeError` when absent.
    pub fn required(&self, field: &str) -> Result<&'a Value, ValidationError> {
        self.map.get(field).ok_or_else(|| ValidationError::Range {
            op: self.op.to_string(),
            field: field.to_string(),
        })
    }

    /// Required string field.
    pub fn str(&self, field: &str) -> Result<&'a str, ValidationError> {
        let value = self.required(field)?;
        value.as_str().ok_or_else(|| self.type_error(field, "string", value))
    }

    /// Optional string field.
    pub fn opt_str(&self, field: &str) -> Result<Option<&'a str>, ValidationError> {
        match self.map.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| self.type_error(field, "string", value)),
        }
    }

    /// Required integer field.
    pub fn int(&self, field: &str) -> Result<i64, ValidationError> {
        let value = self.required(field)?;
        value.as_i64().ok_or_else(|| self.type_error(field, "int", value))
    }

    /// Optional integer field.
    pub fn opt_int(&self, field: &str) -> Result<Option<i64>, ValidationError> {
        match self.map.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.type_error(field, "int", value)),
        }
    }

    /// Required integer field constrained to `range`.
    pub fn int_in(
        &self,
        field: &str,
        range: std::ops::RangeInclusive<i64>,
    ) -> Result<i64, ValidationError> {
        let n = self.int(field)?;
        if range.contains(&n) {
            Ok(n)
        } else {
            Err(ValidationError::Range { op: self.op.to_string(), field: field.to_string() })
        }
    }

    /// Required array field.
    pub fn array(&self, field: &str) -> Result<&'a [Value], ValidationError> {
        let value = self.required(field)?;
        value.as_array().ok_or_else(|| self.type_error(field, "array", value))
    }

    /// Required map field.
    pub fn map_field(&self, field: &str) -> Result<&'a Map, ValidationError> {
        let value = self.required(field)?;
        value.as_map().ok_or_else(|| self.type_error(field, "map", value))
    }

    /// Build a `TypeError` for `field`.
    pub fn type_error(&self, field: &str, expected: &'static str, actual: &Value) -> ValidationError {
        ValidationError::Type {
            op: self.op.to_string(),
            field: field.to_string(),
            expected,
            actual: actual.type_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Value {
        [
            ("text", Value::from("hi")),
            ("count", Value::from(3)),
            ("tokens", Value::from(vec![1, 2])),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_missing_field_is_range_error() {
        let v = args();
        let a = Args::new("echo", &v).unwrap();
        assert_eq!(
            a.str("missing"),
            Err(ValidationError::Range { op: "echo".into(), field: "missing".into() })
        );
    }

    #[test]
    fn test_wrong_type_is_type_error() {
        let v = args();
        let a = Args::new("echo", &v).unwrap();
        assert_eq!(
            a.str("count"),
            Err(ValidationError::Type {
                op: "echo".into(),
                field: "count".into(),
                expected: "string",
                actual: "int",
            })
        );
    }

    #[test]
    fn test_null_args_behave_as_empty_map() {
        let a = Args::new("get", &Value::Null).unwrap();
        assert_eq!(a.opt_str("text"), Ok(None));
        assert!(a.int("count").is_err());
    }

    #[test]
    fn test_non_map_args_rejected() {
        let v = Value::from(vec![1]);
        let err = Args::new("echo", &v).unwrap_err();
        assert!(matches!(err, ValidationError::Type { expected: "map", actual: "array", .. }));
    }

    #[test]
    fn test_int_in_range() {
        let v = args();
        let a = Args::new("ticker", &v).unwrap();
        assert_eq!(a.int_in("count", 0..=10), Ok(3));
        assert!(matches!(a.int_in("count", 5..=10), Err(ValidationError::Range { .. })));
    }

    #[test]
    fn test_array_field() {
        let v = args();
        let a = Args::new("decode", &v).unwrap();
        assert_eq!(a.array("tokens").unwrap().len(), 2);
    }
}
