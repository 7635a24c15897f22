//! The canonical record shape that flows from a connector, through storage,
//! to the uplink. See spec §3 and SPEC_FULL §3.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_device_type() -> String {
    "default".to_string()
}

/// A telemetry bundle: a set of key/value readings taken at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEntry {
    pub ts: i64,
    pub values: HashMap<String, Value>,
}

/// Telemetry as it arrives from a connector: either a single bundle, a bare
/// map of key/value with no timestamp, or a mix of both forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTelemetry {
    WithTimestamp(TelemetryEntry),
    Bare(HashMap<String, Value>),
    List(Vec<RawTelemetryItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTelemetryItem {
    WithTimestamp(TelemetryEntry),
    Bare(HashMap<String, Value>),
}

/// Attributes as they arrive from a connector: a single map or a list of maps
/// to be merged, last-write-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAttributes {
    Single(HashMap<String, Value>),
    List(Vec<HashMap<String, Value>>),
}

impl RawAttributes {
    pub fn merged(self) -> HashMap<String, Value> {
        match self {
            RawAttributes::Single(map) => map,
            RawAttributes::List(maps) => {
                let mut merged = HashMap::new();
                for map in maps {
                    merged.extend(map);
                }
                merged
            }
        }
    }
}

/// A record as submitted by a connector via `sendToStorage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertedData {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "deviceType", default = "default_device_type")]
    pub device_type: String,
    #[serde(default)]
    pub telemetry: Option<RawTelemetry>,
    #[serde(default)]
    pub attributes: Option<RawAttributes>,
}

impl ConvertedData {
    /// Requires `deviceName` and at least one of `telemetry`/`attributes`.
    pub fn is_valid(&self) -> bool {
        !self.device_name.is_empty() && (self.telemetry.is_some() || self.attributes.is_some())
    }
}

/// The event as it is written to and read from storage: `deviceName` plus
/// normalized telemetry (a list of timestamped bundles) and merged
/// attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub telemetry: Vec<TelemetryEntry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Value>,
}

impl StoredEvent {
    /// Normalizes a validated `ConvertedData` record into canonical form
    /// (spec §3, §4.3 step 5). `now_ms` is passed in rather than sampled here
    /// so normalization stays a pure function.
    pub fn normalize(data: ConvertedData, now_ms: i64) -> Self {
        let telemetry = match data.telemetry {
            None => Vec::new(),
            Some(RawTelemetry::WithTimestamp(entry)) => vec![entry],
            Some(RawTelemetry::Bare(values)) => {
                if values.is_empty() {
                    Vec::new()
                } else {
                    vec![TelemetryEntry { ts: now_ms, values }]
                }
            }
            Some(RawTelemetry::List(items)) => {
                let mut with_ts = Vec::new();
                let mut bare = HashMap::new();
                for item in items {
                    match item {
                        RawTelemetryItem::WithTimestamp(entry) => with_ts.push(entry),
                        RawTelemetryItem::Bare(values) => bare.extend(values),
                    }
                }
                if !bare.is_empty() {
                    with_ts.push(TelemetryEntry {
                        ts: now_ms,
                        values: bare,
                    });
                }
                with_ts
            }
        };

        let attributes = data.attributes.map(RawAttributes::merged).unwrap_or_default();

        StoredEvent {
            device_name: data.device_name,
            telemetry,
            attributes,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_requires_device_name_and_payload() {
        crate::test_log::init();
        let missing_payload = ConvertedData {
            device_name: "d1".into(),
            device_type: "default".into(),
            telemetry: None,
            attributes: None,
        };
        assert!(!missing_payload.is_valid());

        let missing_name = ConvertedData {
            device_name: "".into(),
            device_type: "default".into(),
            telemetry: Some(RawTelemetry::Bare(HashMap::new())),
            attributes: None,
        };
        assert!(!missing_name.is_valid());
    }

    #[test]
    fn bare_telemetry_is_wrapped_with_now_timestamp() {
        let data: ConvertedData =
            serde_json::from_value(json!({"deviceName": "d1", "telemetry": {"t": 1}})).unwrap();
        let event = StoredEvent::normalize(data, 1000);
        assert_eq!(event.telemetry.len(), 1);
        assert_eq!(event.telemetry[0].ts, 1000);
        assert_eq!(event.telemetry[0].values["t"], json!(1));
    }

    #[test]
    fn mixed_list_keeps_explicit_ts_and_appends_bare_remainder() {
        let data: ConvertedData = serde_json::from_value(json!({
            "deviceName": "d1",
            "telemetry": [
                {"ts": 5, "values": {"a": 1}},
                {"b": 2},
            ]
        }))
        .unwrap();
        let event = StoredEvent::normalize(data, 1000);
        assert_eq!(event.telemetry.len(), 2);
        assert_eq!(event.telemetry[0].ts, 5);
        assert_eq!(event.telemetry[1].ts, 1000);
        assert_eq!(event.telemetry[1].values["b"], json!(2));
    }

    #[test]
    fn attribute_list_merges_last_write_wins() {
        let data: ConvertedData = serde_json::from_value(json!({
            "deviceName": "d1",
            "attributes": [{"a": 1}, {"a": 2, "b": 3}]
        }))
        .unwrap();
        let event = StoredEvent::normalize(data, 0);
        assert_eq!(event.attributes["a"], json!(2));
        assert_eq!(event.attributes["b"], json!(3));
    }

    #[test]
    fn roundtrips_through_bytes() {
        let event = StoredEvent {
            device_name: "d1".into(),
            telemetry: vec![TelemetryEntry {
                ts: 1,
                values: HashMap::from([("t".to_string(), json!(1))]),
            }],
            attributes: HashMap::new(),
        };
        let bytes = event.to_bytes().unwrap();
        let back = StoredEvent::from_bytes(&bytes).unwrap();
        assert_eq!(back.device_name, "d1");
    }
}
