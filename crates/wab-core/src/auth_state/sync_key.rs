use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{errors::Error, value::Value, Result};

/// Key category whose stored values are reinterpreted as [`AppStateSyncKeyData`].
pub const APP_STATE_SYNC_KEY: &str = "app-state-sync-key";

/// App-state sync key record (protocol-buffer object form, camelCase fields).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppStateSyncKeyData {
    pub key_data: Option<Vec<u8>>,
    pub fingerprint: Option<AppStateSyncKeyFingerprint>,
    pub timestamp: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppStateSyncKeyFingerprint {
    pub raw_id: Option<u32>,
    pub current_index: Option<u32>,
    pub device_indexes: Vec<u32>,
}

impl AppStateSyncKeyData {
    /// Unknown fields are ignored; present fields with the wrong type fail.
    pub fn from_value(v: &Value) -> Result<Self> {
        let Some(map) = v.as_object() else {
            return Err(decode_err("record must be an object"));
        };

        let key_data = match map.get("keyData") {
            None | Some(Value::Null) => None,
            Some(Value::Bytes(b)) => Some(b.clone()),
            Some(Value::String(s)) => Some(
                STANDARD
                    .decode(s)
                    .map_err(|e| decode_err(&format!("keyData is not base64: {e}")))?,
            ),
            Some(_) => return Err(decode_err("keyData must be bytes")),
        };

        let fingerprint = match map.get("fingerprint") {
            None | Some(Value::Null) => None,
            Some(fp @ Value::Object(_)) => Some(AppStateSyncKeyFingerprint::from_value(fp)?),
            Some(_) => return Err(decode_err("fingerprint must be an object")),
        };

        let timestamp = match map.get("timestamp") {
            None | Some(Value::Null) => None,
            Some(ts) => Some(parse_int64(ts)?),
        };

        Ok(Self {
            key_data,
            fingerprint,
            timestamp,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut fields = Vec::new();
        if let Some(k) = &self.key_data {
            fields.push(("keyData", Value::Bytes(k.clone())));
        }
        if let Some(fp) = &self.fingerprint {
            fields.push(("fingerprint", fp.to_value()));
        }
        if let Some(ts) = self.timestamp {
            fields.push(("timestamp", Value::from(ts)));
        }
        Value::object(fields)
    }
}

impl AppStateSyncKeyFingerprint {
    fn from_value(v: &Value) -> Result<Self> {
        let raw_id = optional_u32(v.get("rawId"), "rawId")?;
        let current_index = optional_u32(v.get("currentIndex"), "currentIndex")?;
        let device_indexes = match v.get("deviceIndexes") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|i| {
                    as_u32(i).ok_or_else(|| decode_err("deviceIndexes must hold integers"))
                })
                .collect::<Result<_>>()?,
            Some(_) => return Err(decode_err("deviceIndexes must be an array")),
        };
        Ok(Self {
            raw_id,
            current_index,
            device_indexes,
        })
    }

    fn to_value(&self) -> Value {
        let mut fields = Vec::new();
        if let Some(id) = self.raw_id {
            fields.push(("rawId", Value::from(id)));
        }
        if let Some(idx) = self.current_index {
            fields.push(("currentIndex", Value::from(idx)));
        }
        fields.push((
            "deviceIndexes",
            Value::Array(self.device_indexes.iter().map(|i| Value::from(*i)).collect()),
        ));
        Value::object(fields)
    }
}

fn optional_u32(v: Option<&Value>, field: &str) -> Result<Option<u32>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v) => as_u32(v)
            .map(Some)
            .ok_or_else(|| decode_err(&format!("{field} must be a 32-bit unsigned integer"))),
    }
}

fn as_u32(v: &Value) -> Option<u32> {
    v.as_u64().and_then(|n| u32::try_from(n).ok())
}

/// Accepts a number, a numeric string, or a `{ low, high }` long object.
fn parse_int64(v: &Value) -> Result<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| decode_err("timestamp out of range")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| decode_err("timestamp is not numeric")),
        Value::Object(_) => {
            let low = v.get("low").and_then(Value::as_i64);
            let high = v.get("high").and_then(Value::as_i64);
            match (low, high) {
                (Some(low), Some(high)) => Ok((high << 32) | (low as u32 as i64)),
                _ => Err(decode_err("timestamp long needs low and high")),
            }
        }
        _ => Err(decode_err("timestamp must be numeric")),
    }
}

fn decode_err(msg: &str) -> Error {
    Error::Decode(format!("{APP_STATE_SYNC_KEY}: {msg}"))
}
