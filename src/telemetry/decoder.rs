//! # Telemetry Decoder
//!
//! Turns inbound transport payloads into telemetry messages.
//!
//! ## Payload format
//!
//! Every payload is a JSON object. `"id"` names the device; all other keys are
//! telemetry field names with numeric values:
//!
//! ```json
//! {"id": "B1", "latitude": 37.7, "longitude": -122.5, "altitude": 1520.0}
//! ```
//!
//! Broker messages may omit `"id"`, in which case the last topic segment is
//! used (`icarus/B1` → `B1`). The serial stream carries one object per line.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tracing::warn;

use super::record::DeviceId;
use crate::error::{IcarusError, Result};

/// Longest accepted serial line, excluding the terminator
pub const MAX_FRAME_LEN: usize = 4096;

/// Decoded but not yet schema-checked telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub device_id: DeviceId,
    pub fields: Vec<(String, f64)>,
}

/// Splits the serial byte stream into newline-terminated frames
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
    /// Set while skipping the remainder of an oversized line
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and collect every completed frame
    ///
    /// Blank lines are skipped and a trailing `\r` is stripped. A line that
    /// grows past [`MAX_FRAME_LEN`] is dropped in its entirety.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > MAX_FRAME_LEN {
                warn!("Dropping oversized serial frame ({} bytes)", line.len());
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            frames.push(line.freeze());
        }

        if self.buffer.len() > MAX_FRAME_LEN {
            warn!("Dropping unterminated serial data ({} bytes)", self.buffer.len());
            self.buffer.clear();
            self.discarding = true;
        }

        frames
    }

    /// Forget any partial line, e.g. after the link drops
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

/// Decode one serial frame; the payload must carry `"id"`
pub fn decode_serial_frame(frame: &[u8]) -> Result<TelemetryMessage> {
    decode_payload(frame, None)
}

/// Decode a broker message, falling back to the topic for the device id
pub fn decode_broker_payload(topic: &str, payload: &[u8]) -> Result<TelemetryMessage> {
    decode_payload(payload, Some(topic))
}

fn decode_payload(payload: &[u8], topic: Option<&str>) -> Result<TelemetryMessage> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| IcarusError::Decode(format!("Invalid JSON: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| IcarusError::Decode("Payload is not a JSON object".to_string()))?;

    let mut device_id = None;
    let mut fields = Vec::with_capacity(object.len());

    for (key, value) in object {
        if key == "id" {
            device_id = Some(parse_device_id(value)?);
            continue;
        }

        let number = value
            .as_f64()
            .ok_or_else(|| IcarusError::Decode(format!("Field {} is not numeric", key)))?;
        fields.push((key.clone(), number));
    }

    let device_id = device_id
        .or_else(|| topic.and_then(device_id_from_topic))
        .ok_or_else(|| IcarusError::Decode("Payload has no device id".to_string()))?;

    Ok(TelemetryMessage { device_id, fields })
}

fn parse_device_id(value: &Value) -> Result<DeviceId> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(DeviceId::new(s.as_str())),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(DeviceId::new(n.to_string())),
        _ => Err(IcarusError::Decode(
            "Device id must be a non-empty string or an integer".to_string(),
        )),
    }
}

/// Last non-wildcard topic segment
pub fn device_id_from_topic(topic: &str) -> Option<DeviceId> {
    topic
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && *segment != "#" && *segment != "+")
        .map(DeviceId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_splits_lines() {
        let mut framer = LineFramer::new();
        let frames = framer.push(b"{\"id\":\"B1\"}\n{\"id\":\"B2\"}\r\n{\"id\"");
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"{\"id\":\"B1\"}"),
                Bytes::from_static(b"{\"id\":\"B2\"}"),
            ]
        );

        let frames = framer.push(b":\"B3\"}\n");
        assert_eq!(frames, vec![Bytes::from_static(b"{\"id\":\"B3\"}")]);
    }

    #[test]
    fn test_framer_skips_blank_lines() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"\n\r\n   \n").is_empty());
    }

    #[test]
    fn test_framer_drops_oversized_line() {
        let mut framer = LineFramer::new();
        let junk = vec![b'x'; MAX_FRAME_LEN + 10];
        assert!(framer.push(&junk).is_empty());

        // Tail of the oversized line, then a good one
        let frames = framer.push(b"xxxx\n{\"id\":1}\n");
        assert_eq!(frames, vec![Bytes::from_static(b"{\"id\":1}")]);
    }

    #[test]
    fn test_framer_reset_discards_partial() {
        let mut framer = LineFramer::new();
        framer.push(b"{\"id\":");
        framer.reset();
        assert_eq!(framer.push(b"{}\n"), vec![Bytes::from_static(b"{}")]);
    }

    #[test]
    fn test_decode_serial_frame() {
        let msg = decode_serial_frame(br#"{"id":"B1","latitude":37.7,"fix":3}"#).unwrap();
        assert_eq!(msg.device_id, DeviceId::new("B1"));
        assert!(msg.fields.contains(&("latitude".to_string(), 37.7)));
        assert!(msg.fields.contains(&("fix".to_string(), 3.0)));
    }

    #[test]
    fn test_decode_numeric_id() {
        let msg = decode_serial_frame(br#"{"id":42}"#).unwrap();
        assert_eq!(msg.device_id.as_str(), "42");
        assert!(msg.fields.is_empty());
    }

    #[test]
    fn test_serial_frame_requires_id() {
        let result = decode_serial_frame(br#"{"latitude":1.0}"#);
        assert!(matches!(result, Err(IcarusError::Decode(_))));
    }

    #[test]
    fn test_broker_payload_uses_topic_for_id() {
        let msg = decode_broker_payload("icarus/B1", br#"{"altitude":900}"#).unwrap();
        assert_eq!(msg.device_id.as_str(), "B1");
        assert_eq!(msg.fields, vec![("altitude".to_string(), 900.0)]);
    }

    #[test]
    fn test_payload_id_wins_over_topic() {
        let msg = decode_broker_payload("icarus/B1", br#"{"id":"B9"}"#).unwrap();
        assert_eq!(msg.device_id.as_str(), "B9");
    }

    #[test]
    fn test_rejects_non_numeric_and_non_object() {
        assert!(decode_serial_frame(br#"{"id":"B1","latitude":"north"}"#).is_err());
        assert!(decode_serial_frame(br#"[1,2,3]"#).is_err());
        assert!(decode_serial_frame(b"not json").is_err());
        assert!(decode_serial_frame(br#"{"id":""}"#).is_err());
    }

    #[test]
    fn test_device_id_from_topic() {
        assert_eq!(device_id_from_topic("icarus/B1"), Some(DeviceId::new("B1")));
        assert_eq!(device_id_from_topic("B1"), Some(DeviceId::new("B1")));
        assert_eq!(device_id_from_topic("icarus/#"), None);
        assert_eq!(device_id_from_topic("icarus/"), None);
    }
}
