//! Binary-safe conversion between [`Value`] and its stored JSON form.
//!
//! Buffers are written as `{ "__binary__": true, "data": "<base64>" }`. On the
//! read side the payload may also be an array of byte integers, and the legacy
//! `{ "type": "Buffer", "data": ... }` form is accepted so documents written by
//! earlier deployments still load.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value as Json};

use crate::{errors::Error, value::Value, Result};

pub const BINARY_MARKER: &str = "__binary__";
const DATA_FIELD: &str = "data";

pub fn encode(value: &Value) -> Result<Json> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => Json::Number(n.clone()),
        Value::String(s) => Json::String(s.clone()),
        Value::Bytes(bytes) => {
            let mut marker = Map::new();
            marker.insert(BINARY_MARKER.to_string(), Json::Bool(true));
            marker.insert(DATA_FIELD.to_string(), Json::String(STANDARD.encode(bytes)));
            Json::Object(marker)
        }
        Value::Array(items) => Json::Array(items.iter().map(encode).collect::<Result<_>>()?),
        Value::Object(map) => {
            if map.contains_key(BINARY_MARKER) {
                return Err(Error::Encode(format!(
                    "object uses the reserved key {BINARY_MARKER:?}"
                )));
            }
            if looks_like_legacy_buffer(map.len(), map.get("type").and_then(Value::as_str))
                && map.contains_key(DATA_FIELD)
            {
                return Err(Error::Encode(
                    "object is indistinguishable from a legacy buffer".to_string(),
                ));
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), encode(v)?);
            }
            Json::Object(out)
        }
    })
}

pub fn decode(stored: &Json) -> Result<Value> {
    Ok(match stored {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => Value::Number(n.clone()),
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Array(items.iter().map(decode).collect::<Result<_>>()?),
        Json::Object(map) => {
            if let Some(marker) = map.get(BINARY_MARKER) {
                if marker != &Json::Bool(true) {
                    return Err(Error::Decode(format!(
                        "{BINARY_MARKER} must be true, got {marker}"
                    )));
                }
                let data = map.get(DATA_FIELD).ok_or_else(|| {
                    Error::Decode("binary marker without data payload".to_string())
                })?;
                if map.len() != 2 {
                    return Err(Error::Decode(
                        "binary marker must only carry its data payload".to_string(),
                    ));
                }
                return Ok(Value::Bytes(decode_payload(data)?));
            }
            if looks_like_legacy_buffer(map.len(), map.get("type").and_then(Json::as_str)) {
                if let Some(data) = map.get(DATA_FIELD) {
                    return Ok(Value::Bytes(decode_payload(data)?));
                }
            }
            let mut out = std::collections::BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), decode(v)?);
            }
            Value::Object(out)
        }
    })
}

fn looks_like_legacy_buffer(len: usize, type_tag: Option<&str>) -> bool {
    len == 2 && type_tag == Some("Buffer")
}

fn decode_payload(data: &Json) -> Result<Vec<u8>> {
    match data {
        Json::String(s) => STANDARD
            .decode(s)
            .map_err(|e| Error::Decode(format!("invalid base64 payload: {e}"))),
        Json::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| Error::Decode(format!("invalid byte in payload: {item}")))
            })
            .collect(),
        other => Err(Error::Decode(format!(
            "binary payload must be base64 or a byte array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// Arbitrary value graphs. Object keys never collide with the marker or
    /// legacy buffer fields, so every generated value is encodable.
    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            (-1.0e9f64..1.0e9).prop_map(|f| {
                serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
            }),
            any::<String>().prop_map(Value::String),
            prop::collection::vec(any::<u8>(), 0..48).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(8, 256, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map((0u8..16).prop_map(|n| format!("k{n}")), inner, 0..6)
                    .prop_map(Value::Object),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(v in arb_value()) {
            let stored = encode(&v).unwrap();
            prop_assert_eq!(decode(&stored).unwrap(), v);
        }
    }

    fn round_trip(v: &Value) -> Value {
        decode(&encode(v).unwrap()).unwrap()
    }

    fn sample_creds() -> Value {
        Value::object([
            (
                "noiseKey",
                Value::object([
                    ("private", Value::Bytes((0..32).collect())),
                    ("public", Value::Bytes(vec![0xff; 32])),
                ]),
            ),
            ("registrationId", Value::from(4242i64)),
            ("advSecretKey", Value::from("c2VjcmV0")),
            ("processedHistoryMessages", Value::Array(vec![])),
            ("empty", Value::Bytes(vec![])),
            ("me", Value::Null),
            ("registered", Value::from(false)),
            (
                "buffers",
                Value::Array(vec![Value::Bytes(vec![1, 2, 3]), Value::Bytes(vec![0])]),
            ),
        ])
    }

    #[test]
    fn round_trip_preserves_nested_and_empty_buffers() {
        let v = sample_creds();
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn round_trip_deeply_nested_structure() {
        let mut v = Value::Bytes(vec![9, 8, 7]);
        for depth in 0..200 {
            v = if depth % 2 == 0 {
                Value::object([("inner", v)])
            } else {
                Value::Array(vec![v, Value::from("x")])
            };
        }
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn buffers_are_written_with_the_binary_marker() {
        let stored = encode(&Value::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(stored, json!({ "__binary__": true, "data": "AQID" }));
    }

    #[test]
    fn reserved_marker_key_in_plain_object_fails_to_encode() {
        let v = Value::object([(BINARY_MARKER, Value::from(true))]);
        assert!(matches!(encode(&v), Err(Error::Encode(_))));

        let legacy_lookalike = Value::object([
            ("type", Value::from("Buffer")),
            ("data", Value::from("AQID")),
        ]);
        assert!(matches!(encode(&legacy_lookalike), Err(Error::Encode(_))));
    }

    #[test]
    fn decodes_byte_array_and_legacy_buffer_forms() {
        let arr = decode(&json!({ "__binary__": true, "data": [0, 127, 255] })).unwrap();
        assert_eq!(arr, Value::Bytes(vec![0, 127, 255]));

        let legacy = decode(&json!({ "type": "Buffer", "data": "AQID" })).unwrap();
        assert_eq!(legacy, Value::Bytes(vec![1, 2, 3]));

        // A three-field object tagged "Buffer" is plain data.
        let plain = decode(&json!({ "type": "Buffer", "data": "x", "extra": 1 })).unwrap();
        assert!(plain.as_object().is_some());
    }

    #[test]
    fn malformed_binary_payloads_fail_to_decode() {
        for bad in [
            json!({ "__binary__": true }),
            json!({ "__binary__": false, "data": "AQID" }),
            json!({ "__binary__": true, "data": "AQI" }),
            json!({ "__binary__": true, "data": [1, 256] }),
            json!({ "__binary__": true, "data": 12 }),
            json!({ "__binary__": true, "data": "AQID", "x": 1 }),
            json!({ "nested": [{ "__binary__": true, "data": "!!" }] }),
        ] {
            assert!(
                matches!(decode(&bad), Err(Error::Decode(_))),
                "expected decode error for {bad}"
            );
        }
    }
}
