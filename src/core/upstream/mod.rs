//! Upstream streaming client for the speech-to-speech peer.
//!
//! This module owns the bridge's single logical connection to the cloud
//! speech peer: handshake and authentication, the JSON event protocol,
//! bounded send queueing, and reconnection. It knows nothing about
//! telephony - callers hand it raw audio bytes and consume a stream of
//! [`UpstreamEvent`]s.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::core::audio::AudioEncoding;

mod client;
pub mod messages;
mod retry;

pub use client::UpstreamClient;
pub use retry::RetryPolicy;

/// Default speech-peer WebSocket endpoint.
pub const DEFAULT_UPSTREAM_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";

/// Default speech-peer model.
pub const DEFAULT_UPSTREAM_MODEL: &str = "gpt-4o-realtime-preview";

// =============================================================================
// Errors
// =============================================================================

/// Errors establishing the upstream connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The peer rejected the credentials
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The handshake did not complete within the configured timeout
    #[error("connect handshake timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered with something other than the expected protocol
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Transport-level failure (DNS, TCP, TLS)
    #[error("transport error: {0}")]
    Transport(String),

    /// All attempts were exhausted; the last failure is attached
    #[error("connection attempts exhausted after {attempts} tries")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// The error from the final attempt
        #[source]
        last: Box<ConnectError>,
    },

    /// The connection attempt was cancelled by session shutdown
    #[error("connect cancelled")]
    Cancelled,
}

/// Errors from send-side client operations.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The client has no live connection and no pending reconnect
    #[error("not connected to the speech peer")]
    NotConnected,
}

// =============================================================================
// Events
// =============================================================================

/// Role attached to a transcript event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    /// Caller speech transcript
    Caller,
    /// AI speech transcript
    Assistant,
}

/// Terminal status of an AI turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The turn ran to completion
    Completed,
    /// The turn was cancelled (interruption)
    Cancelled,
    /// The peer reported the turn as failed
    Failed,
}

impl TurnStatus {
    fn from_wire(status: Option<&str>) -> Self {
        match status {
            Some("cancelled") => Self::Cancelled,
            Some("failed") => Self::Failed,
            _ => Self::Completed,
        }
    }
}

/// Events surfaced by the upstream client.
///
/// The session consumes these as a lazy sequence; it ends with [`Closed`]
/// when the connection is gone for good.
///
/// [`Closed`]: UpstreamEvent::Closed
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// The peer acknowledged the session
    Ready {
        /// Peer-assigned session id
        session_id: String,
    },
    /// AI audio chunk, tagged with the turn it belongs to
    AudioDelta {
        /// AI turn identifier
        turn_id: String,
        /// Raw audio bytes
        payload: Bytes,
    },
    /// Caller speech detected by the peer's VAD
    SpeechStarted {
        /// Audio timestamp in ms
        audio_start_ms: u64,
    },
    /// Caller speech ended
    SpeechStopped {
        /// Audio timestamp in ms
        audio_end_ms: u64,
    },
    /// An AI turn finished (completed or cancelled)
    TurnComplete {
        /// AI turn identifier
        turn_id: String,
        /// How the turn ended
        status: TurnStatus,
    },
    /// Transcript of caller or AI speech
    Transcript {
        /// Who spoke
        role: TranscriptRole,
        /// The transcript text
        text: String,
    },
    /// Peer-reported or connection-level error
    Error {
        /// Human-readable description
        message: String,
        /// Fatal errors end the session; non-fatal ones are logged
        fatal: bool,
    },
    /// The connection closed and will not be retried
    Closed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Turn-detection mode for the upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnDetectionMode {
    /// The peer detects end-of-turn itself (default)
    #[default]
    ServerVad,
    /// The bridge signals end-of-utterance explicitly
    Manual,
}

/// Configuration for the upstream streaming client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Bearer credential for the peer
    pub api_key: String,
    /// WebSocket endpoint (ws:// or wss://)
    pub endpoint: String,
    /// Model identifier appended as a query parameter
    pub model: String,
    /// Voice identity for AI audio
    pub voice: String,
    /// System instructions for the assistant
    pub instructions: Option<String>,
    /// Supplemental grounding context appended to the instructions
    pub context: Option<String>,
    /// Audio encoding for caller audio
    pub input_encoding: AudioEncoding,
    /// Audio encoding for AI audio
    pub output_encoding: AudioEncoding,
    /// Turn-detection mode
    pub turn_detection: TurnDetectionMode,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Response token budget
    pub max_response_tokens: Option<u32>,
    /// Handshake timeout
    pub connect_timeout: Duration,
    /// Connect/reconnect retry policy
    pub retry: RetryPolicy,
    /// Bounded send queue capacity; overflow drops the oldest audio frame
    pub send_queue_capacity: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_UPSTREAM_ENDPOINT.to_string(),
            model: DEFAULT_UPSTREAM_MODEL.to_string(),
            voice: "alloy".to_string(),
            instructions: None,
            context: None,
            input_encoding: AudioEncoding::G711Ulaw,
            output_encoding: AudioEncoding::G711Ulaw,
            turn_detection: TurnDetectionMode::ServerVad,
            temperature: None,
            max_response_tokens: None,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            send_queue_capacity: 256,
        }
    }
}

impl UpstreamConfig {
    /// Build the WebSocket URL with the model query parameter.
    pub fn ws_url(&self) -> String {
        format!("{}?model={}", self.endpoint, self.model)
    }

    /// Host portion of the endpoint, for the handshake Host header.
    pub fn host(&self) -> String {
        let stripped = self
            .endpoint
            .strip_prefix("wss://")
            .or_else(|| self.endpoint.strip_prefix("ws://"))
            .unwrap_or(&self.endpoint);
        stripped
            .split('/')
            .next()
            .unwrap_or(stripped)
            .to_string()
    }

    /// Instructions merged with any supplemental grounding context.
    pub fn merged_instructions(&self) -> Option<String> {
        match (&self.instructions, &self.context) {
            (Some(instructions), Some(context)) => {
                Some(format!("{instructions}\n\n{context}"))
            }
            (Some(instructions), None) => Some(instructions.clone()),
            (None, Some(context)) => Some(context.clone()),
            (None, None) => None,
        }
    }
}

/// Map a peer turn status string.
pub(crate) fn turn_status_from_wire(status: Option<&str>) -> TurnStatus {
    TurnStatus::from_wire(status)
}
