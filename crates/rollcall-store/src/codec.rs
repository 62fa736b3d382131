//! JSON encoding of the roster blob: `{name: {name, id, department, section, embedding}}`.

use crate::StoreError;
use rollcall_core::Identity;
use serde_json::{Map, Value};

/// Result of decoding a persisted roster.
#[derive(Debug, Default)]
pub struct LoadedRoster {
    /// Decoded identities, in the order they were encoded.
    pub identities: Vec<Identity>,
    pub skipped: Vec<SkippedEntry>,
}

/// A persisted entry that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub key: String,
    pub reason: String,
}

pub fn encode_roster(identities: &[Identity]) -> Result<String, StoreError> {
    let mut map = Map::with_capacity(identities.len());
    for identity in identities {
        map.insert(identity.name.clone(), serde_json::to_value(identity)?);
    }
    Ok(serde_json::to_string(&Value::Object(map))?)
}

/// Decode a roster blob, isolating failures to the entry that caused them.
/// Entries come back in blob order, which is the order they were encoded.
///
/// Only a blob that is not a JSON object at all is an error.
pub fn decode_roster(blob: &str) -> Result<LoadedRoster, StoreError> {
    let map: Map<String, Value> = match serde_json::from_str(blob) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(StoreError::Corrupt(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            )))
        }
        Err(e) => return Err(StoreError::Corrupt(e.to_string())),
    };

    let mut loaded = LoadedRoster::default();
    for (key, value) in map {
        match serde_json::from_value::<Identity>(value) {
            Ok(identity) if identity.name == key => loaded.identities.push(identity),
            Ok(identity) => loaded.skipped.push(SkippedEntry {
                reason: format!("key does not match name {:?}", identity.name),
                key,
            }),
            Err(e) => loaded.skipped.push(SkippedEntry {
                key,
                reason: e.to_string(),
            }),
        }
    }
    Ok(loaded)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
