//! Conversions from driver values to JSON cells.

use base64::Engine;
use serde_json::Value as JsonValue;

/// Prefix marking binary cells encoded as base64.
pub(crate) const BINARY_PREFIX: &str = "base64:";

/// Finite floats become numbers; NaN and infinities become strings.
pub(crate) fn float(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value).map_or_else(|| JsonValue::String(value.to_string()), JsonValue::Number)
}

/// Binary cells are returned as `base64:<data>`.
pub(crate) fn binary(bytes: &[u8]) -> JsonValue {
    JsonValue::String(format!(
        "{BINARY_PREFIX}{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

/// Text cells that are not valid UTF-8 fall back to the binary form.
pub(crate) fn text_or_binary(bytes: &[u8]) -> JsonValue {
    std::str::from_utf8(bytes).map_or_else(|_| binary(bytes), |text| JsonValue::String(text.to_string()))
}

/// Wraps a nullable cell.
pub(crate) fn nullable<T>(value: Option<T>, convert: impl FnOnce(T) -> JsonValue) -> JsonValue {
    value.map_or(JsonValue::Null, convert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_handles_non_finite_values() {
        assert_eq!(float(1.5), serde_json::json!(1.5));
        assert_eq!(float(f64::NAN), JsonValue::String("NaN".to_string()));
    }

    #[test]
    fn test_binary_cells_are_prefixed() {
        assert_eq!(binary(b"hi"), JsonValue::String("base64:aGk=".to_string()));
        assert_eq!(text_or_binary(b"plain"), JsonValue::String("plain".to_string()));
        assert_eq!(text_or_binary(&[0xff, 0xfe]), JsonValue::String("base64://4=".to_string()));
    }
}
