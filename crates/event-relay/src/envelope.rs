// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelope model and wire codec.
//!
//! An [`Envelope`] is one event unit: a name, a timestamp, dimensional tags and an arbitrary JSON
//! payload. Two wire shapes exist and the one in use is always chosen explicitly through
//! [`ProtocolVersion`]:
//!
//! - `V2` (default): `{"name": .., "timestamp": <millis>, "tags": {..}, "payload": ..}`
//! - `V1`: `[name, <seconds>, {tags}, payload]`
//!
//! In memory the timestamp is always milliseconds since the Unix epoch.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::MAX_ENVELOPE_BYTES;
use crate::errors::EnvelopeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Creates an envelope stamped with the current time and an empty payload.
    pub fn new(name: impl Into<String>) -> Self {
        Envelope {
            name: name.into(),
            timestamp: now_millis(),
            tags: BTreeMap::new(),
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds every tag that is not already set on the envelope.
    #[must_use]
    pub fn with_tags<'a>(mut self, tags: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (key, value) in tags {
            self.tags
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_timestamp_millis(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// JSON value of this envelope in the given wire shape.
    pub fn to_wire(&self, version: ProtocolVersion) -> Value {
        match version {
            ProtocolVersion::V1 => json!([
                self.name,
                self.timestamp.div_euclid(1000),
                self.tags,
                self.payload
            ]),
            ProtocolVersion::V2 => json!({
                "name": self.name,
                "timestamp": self.timestamp,
                "tags": self.tags,
                "payload": self.payload,
            }),
        }
    }
}

/// Wire shape of envelopes and batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// Positional tuples with second-resolution timestamps.
    V1,
    /// Objects with millisecond-resolution timestamps.
    #[default]
    V2,
}

impl ProtocolVersion {
    pub fn as_header(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1",
            ProtocolVersion::V2 => "2",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_header())
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches(['v', 'V']) {
            "1" => Ok(ProtocolVersion::V1),
            "2" => Ok(ProtocolVersion::V2),
            other => Err(format!("unknown protocol version '{other}'")),
        }
    }
}

/// Serializes an envelope, rejecting it if the result exceeds [`MAX_ENVELOPE_BYTES`].
pub fn encode(envelope: &Envelope, version: ProtocolVersion) -> Result<Vec<u8>, EnvelopeError> {
    let bytes = serde_json::to_vec(&envelope.to_wire(version))?;
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(EnvelopeError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_ENVELOPE_BYTES,
        });
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8], version: ProtocolVersion) -> Result<Envelope, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Protocol(e.to_string()))?;
    decode_value(value, version)
}

/// Decodes an envelope from JSON that was already parsed, e.g. an element of a response body.
pub fn decode_value(value: Value, version: ProtocolVersion) -> Result<Envelope, EnvelopeError> {
    match version {
        ProtocolVersion::V2 => {
            serde_json::from_value(value).map_err(|e| EnvelopeError::Protocol(e.to_string()))
        }
        ProtocolVersion::V1 => decode_tuple(value),
    }
}

fn decode_tuple(value: Value) -> Result<Envelope, EnvelopeError> {
    let Value::Array(mut parts) = value else {
        return Err(EnvelopeError::Protocol("expected a positional array".to_string()));
    };
    if parts.is_empty() || parts.len() > 4 {
        return Err(EnvelopeError::Protocol(format!(
            "expected 1 to 4 elements, got {}",
            parts.len()
        )));
    }
    parts.resize(4, Value::Null);
    let payload = parts.pop().unwrap_or_default();
    let tags = match parts.pop().unwrap_or_default() {
        Value::Null => BTreeMap::new(),
        tags => serde_json::from_value(tags)
            .map_err(|e| EnvelopeError::Protocol(format!("invalid tags: {e}")))?,
    };
    let timestamp = match parts.pop().unwrap_or_default() {
        Value::Null => 0,
        seconds => seconds
            .as_i64()
            .ok_or_else(|| EnvelopeError::Protocol("timestamp is not an integer".to_string()))?
            .saturating_mul(1000),
    };
    let name = match parts.pop().unwrap_or_default() {
        Value::String(name) => name,
        _ => return Err(EnvelopeError::Protocol("name is not a string".to_string())),
    };
    Ok(Envelope {
        name,
        timestamp,
        tags,
        payload,
    })
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new("playerJoin")
            .with_timestamp_millis(1_700_000_000_123)
            .with_tag("region", "eu")
            .with_payload(json!({"playerId": 42}))
    }

    #[test]
    fn test_v2_encoding_is_an_object_with_millis() {
        let bytes = encode(&sample(), ProtocolVersion::V2).expect("encode failed");
        let value: Value = serde_json::from_slice(&bytes).expect("not json");
        assert_eq!(value["name"], "playerJoin");
        assert_eq!(value["timestamp"], 1_700_000_000_123i64);
        assert_eq!(value["tags"]["region"], "eu");
        assert_eq!(value["payload"]["playerId"], 42);
    }

    #[test]
    fn test_v1_encoding_is_a_tuple_with_seconds() {
        let bytes = encode(&sample(), ProtocolVersion::V1).expect("encode failed");
        assert_eq!(
            String::from_utf8(bytes).expect("not utf8"),
            r#"["playerJoin",1700000000,{"region":"eu"},{"playerId":42}]"#
        );
    }

    #[test]
    fn test_v1_decode_loses_sub_second_precision() {
        let bytes = encode(&sample(), ProtocolVersion::V1).expect("encode failed");
        let decoded = decode(&bytes, ProtocolVersion::V1).expect("decode failed");
        assert_eq!(decoded.timestamp, 1_700_000_000_000);
        assert_eq!(decoded.name, "playerJoin");
        assert_eq!(decoded.payload, json!({"playerId": 42}));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = Envelope::new("x")
            .with_timestamp_millis(1)
            .with_tag("b", "2")
            .with_tag("a", "1");
        let b = Envelope::new("x")
            .with_timestamp_millis(1)
            .with_tag("a", "1")
            .with_tag("b", "2");
        assert_eq!(
            encode(&a, ProtocolVersion::V2).expect("encode failed"),
            encode(&b, ProtocolVersion::V2).expect("encode failed")
        );
    }

    #[test]
    fn test_oversized_envelope_is_rejected() {
        let envelope = Envelope::new("big").with_payload(json!("x".repeat(MAX_ENVELOPE_BYTES)));
        match encode(&envelope, ProtocolVersion::V2) {
            Err(EnvelopeError::PayloadTooLarge { size, max }) => {
                assert!(size > MAX_ENVELOPE_BYTES);
                assert_eq!(max, MAX_ENVELOPE_BYTES);
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_input_is_a_protocol_error() {
        assert!(matches!(
            decode(b"{not json", ProtocolVersion::V2),
            Err(EnvelopeError::Protocol(_))
        ));
        assert!(matches!(
            decode(br#"{"timestamp": 1}"#, ProtocolVersion::V2),
            Err(EnvelopeError::Protocol(_))
        ));
        assert!(matches!(
            decode(br#"[1, 2, 3]"#, ProtocolVersion::V1),
            Err(EnvelopeError::Protocol(_))
        ));
        assert!(matches!(
            decode(br#"{"name": "x"}"#, ProtocolVersion::V1),
            Err(EnvelopeError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_fills_defaults() {
        let decoded = decode(br#"{"name": "remoteConfig"}"#, ProtocolVersion::V2)
            .expect("decode failed");
        assert_eq!(decoded.timestamp, 0);
        assert!(decoded.tags.is_empty());
        assert_eq!(decoded.payload, Value::Null);

        let decoded = decode(br#"["shutdown"]"#, ProtocolVersion::V1).expect("decode failed");
        assert_eq!(decoded.name, "shutdown");
    }

    #[test]
    fn test_with_tags_keeps_existing_values() {
        let globals = BTreeMap::from([
            ("env".to_string(), "prod".to_string()),
            ("region".to_string(), "us".to_string()),
        ]);
        let envelope = sample().with_tags(&globals);
        assert_eq!(envelope.tags["region"], "eu");
        assert_eq!(envelope.tags["env"], "prod");
    }

    #[test]
    fn test_protocol_version_parsing() {
        assert_eq!("1".parse::<ProtocolVersion>(), Ok(ProtocolVersion::V1));
        assert_eq!("v2".parse::<ProtocolVersion>(), Ok(ProtocolVersion::V2));
        assert!("3".parse::<ProtocolVersion>().is_err());
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::V2);
    }
}
