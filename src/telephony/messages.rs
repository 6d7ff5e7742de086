//! Telephony media-stream wire protocol.
//!
//! The telephony peer speaks JSON over WebSocket with camelCase field names.
//! Inbound events:
//!
//! - `connected` - Initial protocol handshake
//! - `start` - Stream started; carries `streamSid`, `callSid` and the media
//!   format declaration
//! - `media` - Audio payload as base64-encoded narrowband audio
//! - `mark` - Playback position marker acknowledgment
//! - `stop` - Stream stopped
//!
//! Outbound messages:
//!
//! - `media` - Base64-encoded AI audio
//! - `mark` - Playback tracking marker
//! - `clear` - Flush the peer's playback queue (interruptions)
//!
//! Unknown events deserialize into a catch-all variant and are ignored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Inbound (telephony peer -> bridge)
// =============================================================================

/// Inbound telephony events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyMessage {
    /// Protocol handshake after the WebSocket opens
    Connected {
        /// Protocol name
        #[serde(default)]
        protocol: Option<String>,
        /// Protocol version
        #[serde(default)]
        version: Option<String>,
    },

    /// Stream start; the session-creation trigger
    Start {
        /// Stream identifier (registry key)
        #[serde(rename = "streamSid")]
        stream_sid: String,
        /// Start metadata
        start: StartMeta,
    },

    /// Audio frame
    Media {
        /// Stream identifier
        #[serde(rename = "streamSid")]
        stream_sid: String,
        /// Frame sequence number (stringly-typed on the wire)
        #[serde(rename = "sequenceNumber")]
        sequence_number: String,
        /// Audio payload
        media: MediaPayload,
    },

    /// Playback marker acknowledgment
    Mark {
        /// Stream identifier
        #[serde(rename = "streamSid")]
        stream_sid: String,
        /// Marker payload
        mark: MarkPayload,
    },

    /// Stream stop; the teardown trigger
    Stop {
        /// Stream identifier
        #[serde(rename = "streamSid")]
        stream_sid: String,
        /// Stop metadata
        #[serde(default)]
        stop: Option<StopMeta>,
    },

    /// Any event the bridge does not interpret
    #[serde(other)]
    Other,
}

/// Payload of the `start` event.
#[derive(Debug, Clone, Deserialize)]
pub struct StartMeta {
    /// Call identifier
    #[serde(rename = "callSid")]
    pub call_sid: String,
    /// Account identifier
    #[serde(rename = "accountSid", default)]
    pub account_sid: Option<String>,
    /// Which tracks the stream carries (usually `["inbound"]`)
    #[serde(default)]
    pub tracks: Option<Vec<String>>,
    /// Declared media format
    #[serde(rename = "mediaFormat", default)]
    pub media_format: Option<MediaFormat>,
    /// Caller-supplied parameters from the stream configuration
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: Option<HashMap<String, String>>,
}

/// Media format declared at stream start.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaFormat {
    /// Encoding wire name (e.g. `audio/x-mulaw`)
    pub encoding: String,
    /// Sample rate in Hz
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    /// Channel count
    pub channels: u32,
}

/// Payload of the `media` event.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    /// Track name (`inbound` / `outbound`)
    #[serde(default)]
    pub track: Option<String>,
    /// Chunk counter (stringly-typed on the wire)
    #[serde(default)]
    pub chunk: Option<String>,
    /// Frame timestamp in ms relative to stream start (stringly-typed)
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Base64-encoded audio
    pub payload: String,
}

impl MediaPayload {
    /// Parse the wire timestamp, defaulting to zero when absent or garbled.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0)
    }
}

/// Payload of `mark` events, inbound and outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    /// Marker name
    pub name: String,
}

/// Payload of the `stop` event.
#[derive(Debug, Clone, Deserialize)]
pub struct StopMeta {
    /// Call identifier
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
}

// =============================================================================
// Outbound (bridge -> telephony peer)
// =============================================================================

/// Outbound telephony messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// AI audio frame
    Media {
        /// Stream identifier
        #[serde(rename = "streamSid")]
        stream_sid: String,
        /// Audio payload
        media: OutboundMediaPayload,
    },

    /// Playback tracking marker
    Mark {
        /// Stream identifier
        #[serde(rename = "streamSid")]
        stream_sid: String,
        /// Marker payload
        mark: MarkPayload,
    },

    /// Flush the peer's playback queue
    Clear {
        /// Stream identifier
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

/// Outbound audio payload.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMediaPayload {
    /// Base64-encoded audio
    pub payload: String,
}

impl OutboundMessage {
    /// Build a media message for a stream.
    pub fn media(stream_sid: &str, payload: String) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMediaPayload { payload },
        }
    }

    /// Build a playback marker.
    pub fn mark(stream_sid: &str, name: &str) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload {
                name: name.to_string(),
            },
        }
    }

    /// Build a playback-queue clear.
    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_event() {
        let json = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ0123",
            "start": {
                "accountSid": "AC42",
                "streamSid": "MZ0123",
                "callSid": "CA77",
                "tracks": ["inbound"],
                "mediaFormat": {
                    "encoding": "audio/x-mulaw",
                    "sampleRate": 8000,
                    "channels": 1
                },
                "customParameters": {"track": "both_tracks"}
            }
        }"#;
        let msg: TelephonyMessage = serde_json::from_str(json).unwrap();
        match msg {
            TelephonyMessage::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ0123");
                assert_eq!(start.call_sid, "CA77");
                let format = start.media_format.unwrap();
                assert_eq!(format.encoding, "audio/x-mulaw");
                assert_eq!(format.sample_rate, 8000);
                assert_eq!(format.channels, 1);
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_media_event() {
        let json = r#"{
            "event": "media",
            "sequenceNumber": "4",
            "streamSid": "MZ0123",
            "media": {
                "track": "inbound",
                "chunk": "3",
                "timestamp": "60",
                "payload": "AAEC"
            }
        }"#;
        let msg: TelephonyMessage = serde_json::from_str(json).unwrap();
        match msg {
            TelephonyMessage::Media {
                sequence_number,
                media,
                ..
            } => {
                assert_eq!(sequence_number, "4");
                assert_eq!(media.timestamp_ms(), 60);
                assert_eq!(media.payload, "AAEC");
            }
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_stop_and_mark() {
        let stop: TelephonyMessage = serde_json::from_str(
            r#"{"event": "stop", "streamSid": "MZ1", "stop": {"callSid": "CA1"}}"#,
        )
        .unwrap();
        assert!(matches!(stop, TelephonyMessage::Stop { .. }));

        let mark: TelephonyMessage = serde_json::from_str(
            r#"{"event": "mark", "streamSid": "MZ1", "mark": {"name": "greeting-done"}}"#,
        )
        .unwrap();
        match mark {
            TelephonyMessage::Mark { mark, .. } => assert_eq!(mark.name, "greeting-done"),
            other => panic!("expected mark, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let msg: TelephonyMessage =
            serde_json::from_str(r#"{"event": "dtmf", "streamSid": "MZ1", "dtmf": {"digit": "5"}}"#)
                .unwrap();
        assert!(matches!(msg, TelephonyMessage::Other));
    }

    #[test]
    fn test_outbound_media_shape() {
        let msg = OutboundMessage::media("MZ0123", "AAEC".to_string());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""event":"media""#));
        assert!(json.contains(r#""streamSid":"MZ0123""#));
        assert!(json.contains(r#""payload":"AAEC""#));
    }

    #[test]
    fn test_outbound_clear_shape() {
        let json = serde_json::to_string(&OutboundMessage::clear("MZ0123")).unwrap();
        assert_eq!(json, r#"{"event":"clear","streamSid":"MZ0123"}"#);
    }

    #[test]
    fn test_outbound_mark_shape() {
        let json = serde_json::to_string(&OutboundMessage::mark("MZ0123", "chunk-1")).unwrap();
        assert!(json.contains(r#""event":"mark""#));
        assert!(json.contains(r#""name":"chunk-1""#));
    }

    #[test]
    fn test_garbled_timestamp_defaults_to_zero() {
        let media = MediaPayload {
            track: None,
            chunk: None,
            timestamp: Some("not-a-number".to_string()),
            payload: "AAEC".to_string(),
        };
        assert_eq!(media.timestamp_ms(), 0);
    }
}
