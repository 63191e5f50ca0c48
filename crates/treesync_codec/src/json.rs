//! JSON text conversion.
//!
//! The wire protocol and the application both speak JSON. Parsing goes
//! through `serde_json` and is then lowered into [`Value`]. Object keys keep
//! their source order in both directions.

use crate::error::CodecResult;
use crate::value::Value;

/// Largest integer magnitude a double represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Parses JSON text into a value.
///
/// # Errors
///
/// Returns an error if the text is not valid JSON.
pub fn from_json_str(text: &str) -> CodecResult<Value> {
    let parsed: serde_json::Value = serde_json::from_str(text)?;
    Ok(Value::from(parsed))
}

/// Renders a value as compact JSON text.
///
/// Integral numbers inside the safe-integer range render without a
/// fractional part. Non-finite numbers render as `null`.
pub fn to_json_string(value: &Value) -> String {
    serde_json::Value::from(value).to_string()
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(pairs) => serde_json::Value::Object(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nested_document() {
        let value = from_json_str(r#"{"a":{"b":42,"c":"x"},"d":[true,null]}"#).unwrap();
        assert_eq!(value.get("a").and_then(|a| a.get("b")), Some(&Value::Number(42.0)));
        assert_eq!(
            value.get("d"),
            Some(&Value::Array(vec![Value::Bool(true), Value::Null]))
        );
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(to_json_string(&Value::Number(42.0)), "42");
        assert_eq!(to_json_string(&Value::Number(-3.0)), "-3");
        assert_eq!(to_json_string(&Value::Number(1.5)), "1.5");
    }

    #[test]
    fn non_finite_numbers_render_as_null() {
        assert_eq!(to_json_string(&Value::Number(f64::NAN)), "null");
        assert_eq!(to_json_string(&Value::Number(f64::INFINITY)), "null");
    }

    #[test]
    fn object_key_order_is_preserved() {
        let text = r#"{"r":1,"a":"l","b":{}}"#;
        assert_eq!(to_json_string(&from_json_str(text).unwrap()), text);
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(from_json_str("{not json").is_err());
    }
}
