//! Storage-safe integer encoding.
//!
//! Documents only hold signed 64-bit integers natively. Values whose
//! magnitude exceeds `i64::MAX` are stored as their exact decimal string and
//! parsed back with [`restore_int`].

use alloy::primitives::U256;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("expected an integer or decimal string, found {0}")]
    NotAnInteger(String),
}

/// Encodes `value` as a JSON number when it fits a signed 64-bit integer,
/// otherwise as its decimal string.
pub fn sanitize_int(value: U256) -> Value {
    match u64::try_from(value) {
        Ok(small) if small <= i64::MAX as u64 => Value::from(small),
        _ => Value::String(value.to_string()),
    }
}

/// Same as [`sanitize_int`] for native 128-bit quantities.
pub fn sanitize_u128(value: u128) -> Value {
    sanitize_int(U256::from(value))
}

/// Parses a value written by [`sanitize_int`].
///
/// # Errors
/// Returns [`SanitizeError::NotAnInteger`] for negative numbers, floats,
/// non-decimal strings and other JSON types.
pub fn restore_int(value: &Value) -> Result<U256, SanitizeError> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| SanitizeError::NotAnInteger(value.to_string())),
        Value::String(text) if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) => {
            U256::from_str_radix(text, 10).map_err(|_| SanitizeError::NotAnInteger(value.to_string()))
        }
        _ => Err(SanitizeError::NotAnInteger(value.to_string())),
    }
}

/// Recursively rewrites any integer in `value` whose magnitude exceeds
/// `i64::MAX` into its decimal string.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Number(number) => match number.as_u64() {
            Some(unsigned) if unsigned > i64::MAX as u64 => Value::String(unsigned.to_string()),
            _ => Value::Number(number),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, sanitize_value(item)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn large_values_round_trip_through_strings() {
        let large = (U256::from(1u8) << 70usize) + U256::from(7u8);
        let stored = sanitize_int(large);

        assert_eq!(stored, Value::String("1180591620717411303431".to_string()));
        assert_eq!(restore_int(&stored).expect("stored value should parse"), large);
    }

    #[test]
    fn i64_boundary_stays_numeric() {
        let max = U256::from(i64::MAX as u64);
        assert!(sanitize_int(max).is_number());
        assert!(sanitize_int(max + U256::from(1u8)).is_string());
    }

    #[test]
    fn nested_values_are_rewritten() {
        let raw = json!({"a": [u64::MAX, 5], "b": {"c": -3}});
        let clean = sanitize_value(raw);

        assert_eq!(clean["a"][0], "18446744073709551615");
        assert_eq!(clean["a"][1], 5);
        assert_eq!(clean["b"]["c"], -3);
    }

    #[test]
    fn restore_rejects_non_integers() {
        assert!(restore_int(&json!(-1)).is_err());
        assert!(restore_int(&json!("0x10")).is_err());
        assert!(restore_int(&json!(null)).is_err());
    }
}
