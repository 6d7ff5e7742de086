//! Speech-peer WebSocket message types.
//!
//! The speech peer speaks a JSON event protocol over a persistent WebSocket.
//! Event names are a collaborator-defined, versioned wire contract; the
//! bridge treats the vocabulary as opaque and only interprets the events it
//! needs for relaying audio and managing turns.
//!
//! Client events (sent to the peer):
//! - session.update - Configure voice, formats, turn detection, instructions
//! - input_audio_buffer.append - Append caller audio to the input buffer
//! - input_audio_buffer.commit - Commit the buffer (manual turn detection)
//! - input_audio_buffer.clear - Discard buffered input audio
//! - conversation.item.create - Inject a conversation item (context)
//! - response.create - Request a response turn
//! - response.cancel - Cancel the in-flight response turn
//!
//! Server events (received from the peer):
//! - session.created / session.updated - Session lifecycle
//! - input_audio_buffer.speech_started / speech_stopped - Peer-side VAD
//! - response.audio.delta - AI audio chunk (base64)
//! - response.audio_transcript.done - Final AI transcript
//! - conversation.item.input_audio_transcription.completed - Caller transcript
//! - response.done - Turn completed (or cancelled)
//! - error - Peer-reported error

use base64::prelude::*;
use serde::{Deserialize, Serialize};

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration sent to the speech peer on connect and reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Response modalities (text, audio)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System instructions for the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice for audio output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format wire name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Output audio format wire name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Turn detection configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    /// Temperature for response generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum response output tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

/// Turn detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Peer-side VAD: the peer decides when a caller turn ends
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        /// Audio prefix padding in ms
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        /// Silence duration in ms
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
    /// No peer-side detection; the bridge commits turns manually
    #[serde(rename = "none")]
    None {},
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item for context injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item type
    #[serde(rename = "type")]
    pub item_type: String,
    /// Item role (user, assistant, system)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
}

impl ConversationItem {
    /// Build a system message item carrying supplemental context.
    pub fn system_text(text: &str) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("system".to_string()),
            content: Some(vec![ContentPart {
                content_type: "input_text".to_string(),
                text: Some(text.to_string()),
            }]),
        }
    }
}

/// Content part within a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type (input_text, text)
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

// =============================================================================
// Client Events (sent to the peer)
// =============================================================================

/// Client events sent to the speech peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration
        session: SessionConfig,
    },

    /// Append audio to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio data
        audio: String,
    },

    /// Commit the input audio buffer (manual turn detection)
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Clear the input audio buffer
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Create a conversation item
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// Item to create
        item: ConversationItem,
    },

    /// Request a response turn
    #[serde(rename = "response.create")]
    ResponseCreate,

    /// Cancel the in-flight response turn
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Create an audio append event from raw bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }

    /// Whether this event is an audio frame (drop candidate under
    /// send-queue pressure; control events are never dropped).
    pub fn is_audio(&self) -> bool {
        matches!(self, ClientEvent::InputAudioBufferAppend { .. })
    }
}

// =============================================================================
// Server Events (received from the peer)
// =============================================================================

/// Server events received from the speech peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Peer-reported error
    #[serde(rename = "error")]
    Error {
        /// Error details
        error: ApiError,
    },

    /// Session created
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Session information
        session: SessionInfo,
    },

    /// Session configuration acknowledged
    #[serde(rename = "session.updated")]
    SessionUpdated {
        /// Session information
        session: SessionInfo,
    },

    /// Caller speech detected
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        /// Audio start timestamp in ms
        audio_start_ms: u64,
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Caller speech ended
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        /// Audio end timestamp in ms
        audio_end_ms: u64,
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
    },

    /// AI audio chunk
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Response ID - identifies the AI turn the chunk belongs to
        response_id: String,
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
        /// Base64-encoded audio delta
        delta: String,
    },

    /// Final AI transcript for a turn
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
        /// Full transcript
        transcript: String,
    },

    /// Caller speech transcript
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        /// Item ID
        #[serde(default)]
        item_id: Option<String>,
        /// Transcript text
        transcript: String,
    },

    /// Response turn finished
    #[serde(rename = "response.done")]
    ResponseDone {
        /// Response information
        response: ResponseInfo,
    },

    /// Any event the bridge does not interpret
    #[serde(other)]
    Unhandled,
}

impl ServerEvent {
    /// Decode base64 audio from an AudioDelta event.
    pub fn decode_audio_delta(delta: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(delta)
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// Peer error information.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Error code
    #[serde(default)]
    pub code: Option<String>,
    /// Error message
    pub message: String,
}

/// Session information.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Session ID assigned by the peer
    pub id: String,
}

/// Response (AI turn) information.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInfo {
    /// Response ID
    pub id: String,
    /// Terminal status: completed, cancelled, failed, incomplete
    #[serde(default)]
    pub status: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_serialization() {
        let event = ClientEvent::InputAudioBufferCommit;
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("input_audio_buffer.commit"));

        let event = ClientEvent::ResponseCancel;
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("response.cancel"));
    }

    #[test]
    fn test_audio_append_round_trip() {
        let data = vec![0u8, 1, 2, 3];
        let event = ClientEvent::audio_append(&data);
        assert!(event.is_audio());
        match event {
            ClientEvent::InputAudioBufferAppend { audio } => {
                assert_eq!(BASE64_STANDARD.decode(&audio).unwrap(), data);
            }
            _ => panic!("wrong event type"),
        }
    }

    #[test]
    fn test_control_events_are_not_audio() {
        assert!(!ClientEvent::ResponseCancel.is_audio());
        assert!(!ClientEvent::InputAudioBufferCommit.is_audio());
    }

    #[test]
    fn test_session_update_serialization() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                modalities: Some(vec!["text".to_string(), "audio".to_string()]),
                instructions: Some("Answer calls politely.".to_string()),
                voice: Some("alloy".to_string()),
                input_audio_format: Some("g711_ulaw".to_string()),
                output_audio_format: Some("g711_ulaw".to_string()),
                turn_detection: Some(TurnDetection::ServerVad {
                    threshold: Some(0.5),
                    prefix_padding_ms: Some(300),
                    silence_duration_ms: Some(500),
                }),
                temperature: Some(0.8),
                max_response_output_tokens: None,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("session.update"));
        assert!(json.contains("server_vad"));
        assert!(json.contains("g711_ulaw"));
        assert!(!json.contains("max_response_output_tokens"));
    }

    #[test]
    fn test_server_event_deserialization() {
        let json = r#"{
            "type": "response.audio.delta",
            "response_id": "resp_1",
            "item_id": "item_1",
            "output_index": 0,
            "content_index": 0,
            "delta": "AAEC"
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::AudioDelta {
                response_id, delta, ..
            } => {
                assert_eq!(response_id, "resp_1");
                assert_eq!(ServerEvent::decode_audio_delta(&delta).unwrap(), vec![0, 1, 2]);
            }
            _ => panic!("wrong event type"),
        }
    }

    #[test]
    fn test_unknown_server_event_is_tolerated() {
        let json = r#"{"type": "rate_limits.updated", "rate_limits": []}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ServerEvent::Unhandled));
    }

    #[test]
    fn test_response_done_status() {
        let json = r#"{
            "type": "response.done",
            "response": {"id": "resp_9", "status": "cancelled", "output": []}
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::ResponseDone { response } => {
                assert_eq!(response.id, "resp_9");
                assert_eq!(response.status.as_deref(), Some("cancelled"));
            }
            _ => panic!("wrong event type"),
        }
    }

    #[test]
    fn test_system_context_item() {
        let item = ConversationItem::system_text("Today's specials: soup.");
        let json = serde_json::to_string(&ClientEvent::ConversationItemCreate { item }).unwrap();
        assert!(json.contains("conversation.item.create"));
        assert!(json.contains("system"));
        assert!(json.contains("soup"));
    }
}
