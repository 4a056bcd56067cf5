//! JSON envelope codec for device traffic.
//!
//! Device firmware speaks snake_case exclusively, while the rest of this crate
//! works with lower-camel keys. Outbound payloads are rewritten camel -> snake
//! before serialisation, inbound payloads snake -> camel after parsing.
//!
//! Only nested objects are rewritten; arrays are passed through untouched.

use serde_json::{Map, Value};
use thiserror::Error;

/// Option keys older firmware reports at the top level of an options response
/// instead of nesting them under `options`. Matched after decoding, so they are
/// lower-camel.
pub const LEGACY_OPTION_KEYS: &[&str] = &[
    "isoOptions",
    "apertureOptions",
    "shutterSpeedOptions",
    "whiteBalanceOptions",
    "imageSizeOptions",
    "qualityOptions",
    "focusModeOptions",
    "exposureModeOptions",
];

/// Wrapper fields searched (recursively, in this order) for an options object.
const OPTION_WRAPPERS: &[&str] = &["data", "payload", "result"];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// Rewrites a single lower-camel key to snake_case.
///
/// Keys that already contain `_` are considered canonical and returned as-is.
pub fn camel_to_snake(key: &str) -> String {
    if key.contains('_') {
        return key.to_string();
    }

    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Rewrites a single snake_case key to lower-camel.
pub fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Recursively converts object keys to snake_case.
///
/// When an object holds both `site_name` and `siteName`, the snake_case key
/// wins and the camel one is dropped, regardless of insertion order.
pub fn to_snake_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());

            for (key, inner) in map.iter().filter(|(k, _)| k.contains('_')) {
                out.insert(key.clone(), to_snake_keys(inner));
            }
            for (key, inner) in map.iter().filter(|(k, _)| !k.contains('_')) {
                let snake = camel_to_snake(key);
                if !out.contains_key(&snake) {
                    out.insert(snake, to_snake_keys(inner));
                }
            }

            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Recursively converts object keys to lower-camel.
pub fn to_camel_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| (snake_to_camel(key), to_camel_keys(inner)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Encodes an outbound command payload into its wire form.
pub fn encode(payload: &Value) -> String {
    // Serialising a `Value` cannot fail: every map key is already a string.
    to_snake_keys(payload).to_string()
}

/// Decodes an inbound payload into a lower-camel JSON object.
pub fn decode(wire: &str) -> Result<Map<String, Value>, CodecError> {
    let parsed: Value = serde_json::from_str(wire)?;
    match to_camel_keys(&parsed) {
        Value::Object(map) => Ok(map),
        _ => Err(CodecError::NotAnObject),
    }
}

/// Decodes raw transport bytes; see [`decode`].
pub fn decode_bytes(raw: &[u8]) -> Result<Map<String, Value>, CodecError> {
    let wire = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
    decode(wire)
}

/// Finds the capability-options object inside a decoded response body.
///
/// Looks at `options` first, then descends into `data`/`payload`/`result`,
/// and finally accepts the body itself when it carries any legacy option key.
/// `None` means "no options present", not an error.
pub fn extract_options_payload(raw: &Map<String, Value>) -> Option<Map<String, Value>> {
    if let Some(Value::Object(options)) = raw.get("options") {
        return Some(options.clone());
    }

    for wrapper in OPTION_WRAPPERS {
        if let Some(Value::Object(inner)) = raw.get(*wrapper) {
            if let Some(found) = extract_options_payload(inner) {
                return Some(found);
            }
        }
    }

    if LEGACY_OPTION_KEYS.iter().any(|key| raw.contains_key(*key)) {
        return Some(raw.clone());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn camel_keys_become_snake_on_the_wire() {
        let wire = encode(&json!({ "siteName": "north", "cameraConfig": { "isoValue": 200 } }));
        let parsed: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(
            parsed,
            json!({ "site_name": "north", "camera_config": { "iso_value": 200 } })
        );
    }

    #[test]
    fn encode_then_decode_restores_camel_keys() {
        let wire = encode(&json!({ "fooBar": 1 }));
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded.get("fooBar"), Some(&json!(1)));
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn snake_key_wins_over_colliding_camel_key() {
        let wire = encode(&json!({ "siteName": "b", "site_name": "a" }));
        let parsed: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed, json!({ "site_name": "a" }));
    }

    #[test]
    fn keys_with_underscores_are_not_rewritten() {
        assert_eq!(camel_to_snake("already_Snake"), "already_Snake");
        assert_eq!(camel_to_snake("batteryLevel"), "battery_level");
        assert_eq!(camel_to_snake("plain"), "plain");
    }

    #[test]
    fn arrays_are_left_untouched() {
        let wire = encode(&json!({ "isoList": [{ "isoValue": 100 }] }));
        let parsed: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed, json!({ "iso_list": [{ "isoValue": 100 }] }));
    }

    #[test]
    fn decode_rejects_non_json_and_non_objects() {
        assert!(matches!(decode("reboot now"), Err(CodecError::InvalidJson(_))));
        assert!(matches!(decode("[1, 2]"), Err(CodecError::NotAnObject)));
        assert!(matches!(decode_bytes(&[0xff, 0xfe]), Err(CodecError::NotUtf8)));
    }

    #[test]
    fn snake_to_camel_handles_nested_objects() {
        let decoded = decode(r#"{"today_total_captures": 4, "last_boot": {"boot_time": "x"}}"#).unwrap();
        assert_eq!(decoded.get("todayTotalCaptures"), Some(&json!(4)));
        assert_eq!(decoded.get("lastBoot"), Some(&json!({ "bootTime": "x" })));
    }

    #[test]
    fn options_found_under_options_field_first() {
        let body = decode(r#"{"options": {"iso": [100]}, "data": {"options": {"iso": [200]}}}"#).unwrap();
        let options = extract_options_payload(&body).unwrap();
        assert_eq!(options.get("iso"), Some(&json!([100])));
    }

    #[test]
    fn options_found_in_nested_wrappers() {
        let body = decode(r#"{"success": true, "result": {"payload": {"options": {"quality": ["fine"]}}}}"#).unwrap();
        let options = extract_options_payload(&body).unwrap();
        assert_eq!(options.get("quality"), Some(&json!(["fine"])));
    }

    #[test]
    fn legacy_option_keys_accept_the_body_itself() {
        let body = decode(r#"{"iso_options": [100, 200], "success": true}"#).unwrap();
        let options = extract_options_payload(&body).unwrap();
        assert!(options.contains_key("isoOptions"));
    }

    #[test]
    fn missing_options_is_none() {
        let body = decode(r#"{"success": true, "message": "ok"}"#).unwrap();
        assert!(extract_options_payload(&body).is_none());
    }
}
