//! Audio frame types and the telephony frame codec.
//!
//! Telephony media streams carry narrowband audio as base64-wrapped G.711
//! payloads inside JSON envelopes; the speech peer consumes the same bytes
//! raw. The codec here converts between the two representations and validates
//! the declared media format against the configured one. No transcoding is
//! performed - frames are format-tagged and passed through.

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors produced while decoding a telephony media frame.
///
/// Decode failures are per-frame: the caller logs and drops the frame, the
/// session continues.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The declared media format does not match the configured one
    #[error("media format mismatch: {0}")]
    FormatMismatch(String),

    /// The payload could not be decoded from its wire representation
    #[error("invalid frame payload: {0}")]
    InvalidPayload(String),

    /// The frame carried no audio data
    #[error("empty frame payload")]
    EmptyPayload,
}

// =============================================================================
// Audio Encodings
// =============================================================================

/// Supported audio encodings for the bridge.
///
/// Telephony peers deliver 8 kHz G.711; the speech peer accepts the same
/// format, so the default keeps both legs symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// G.711 u-law, 8 kHz, mono (default telephony format)
    #[default]
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    /// G.711 a-law, 8 kHz, mono
    #[serde(rename = "g711_alaw")]
    G711Alaw,
    /// PCM 16-bit signed little-endian, 24 kHz, mono
    Pcm16,
}

impl AudioEncoding {
    /// Convert to the wire parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::G711Ulaw => "g711_ulaw",
            Self::G711Alaw => "g711_alaw",
            Self::Pcm16 => "pcm16",
        }
    }

    /// Get the sample rate for this encoding.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::G711Ulaw | Self::G711Alaw => 8000,
            Self::Pcm16 => 24000,
        }
    }

    /// Parse a wire name, accepting the common aliases telephony peers use.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "g711_ulaw" | "ulaw" | "mulaw" | "audio/x-mulaw" => Some(Self::G711Ulaw),
            "g711_alaw" | "alaw" | "audio/x-alaw" => Some(Self::G711Alaw),
            "pcm16" | "pcm" | "linear16" => Some(Self::Pcm16),
            _ => None,
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_wire_or_default(s: &str) -> Self {
        Self::from_wire(s).unwrap_or_default()
    }
}

impl std::fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Audio Frames
// =============================================================================

/// Direction of an audio frame relative to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// Caller audio, telephony peer -> speech peer
    Inbound,
    /// AI audio, speech peer -> telephony peer
    Outbound,
}

/// A single audio frame. Immutable once constructed.
///
/// Ordering by `sequence_number` within a direction is required by consumers
/// but not guaranteed by the transport; see the session's reorder window.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic per-direction sequence number
    pub sequence_number: u64,
    /// Frame timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Raw audio bytes in the session's configured encoding
    pub payload: Bytes,
    /// Frame direction
    pub direction: FrameDirection,
}

impl AudioFrame {
    /// Construct an inbound (caller) frame.
    pub fn inbound(sequence_number: u64, timestamp_ms: u64, payload: Bytes) -> Self {
        Self {
            sequence_number,
            timestamp_ms,
            payload,
            direction: FrameDirection::Inbound,
        }
    }

    /// Construct an outbound (AI) frame.
    pub fn outbound(sequence_number: u64, timestamp_ms: u64, payload: Bytes) -> Self {
        Self {
            sequence_number,
            timestamp_ms,
            payload,
            direction: FrameDirection::Outbound,
        }
    }
}

// =============================================================================
// Frame Codec
// =============================================================================

/// Stateless codec for the telephony audio envelope.
///
/// Safe to share across sessions; every method is side-effect free.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    encoding: AudioEncoding,
}

impl FrameCodec {
    /// Create a codec for the given encoding.
    pub fn new(encoding: AudioEncoding) -> Self {
        Self { encoding }
    }

    /// The encoding this codec expects on the wire.
    pub fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    /// Validate a media format declared by the telephony peer at stream start.
    pub fn validate_format(
        &self,
        encoding: &str,
        sample_rate: u32,
        channels: u32,
    ) -> Result<(), DecodeError> {
        let declared = AudioEncoding::from_wire(encoding).ok_or_else(|| {
            DecodeError::FormatMismatch(format!("unsupported encoding '{encoding}'"))
        })?;
        if declared != self.encoding {
            return Err(DecodeError::FormatMismatch(format!(
                "expected {}, peer declared {}",
                self.encoding, declared
            )));
        }
        if sample_rate != self.encoding.sample_rate() {
            return Err(DecodeError::FormatMismatch(format!(
                "expected {} Hz, peer declared {} Hz",
                self.encoding.sample_rate(),
                sample_rate
            )));
        }
        if channels != 1 {
            return Err(DecodeError::FormatMismatch(format!(
                "expected mono audio, peer declared {channels} channels"
            )));
        }
        Ok(())
    }

    /// Decode a base64 telephony payload into an inbound audio frame.
    pub fn decode_inbound(
        &self,
        sequence_number: u64,
        timestamp_ms: u64,
        payload: &str,
    ) -> Result<AudioFrame, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        let bytes = BASE64_STANDARD
            .decode(payload)
            .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;
        if bytes.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        Ok(AudioFrame::inbound(
            sequence_number,
            timestamp_ms,
            Bytes::from(bytes),
        ))
    }

    /// Encode an outbound frame's payload for the telephony envelope.
    pub fn encode_outbound(&self, frame: &AudioFrame) -> String {
        BASE64_STANDARD.encode(&frame.payload)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_as_str() {
        assert_eq!(AudioEncoding::G711Ulaw.as_str(), "g711_ulaw");
        assert_eq!(AudioEncoding::Pcm16.as_str(), "pcm16");
    }

    #[test]
    fn test_encoding_sample_rate() {
        assert_eq!(AudioEncoding::G711Ulaw.sample_rate(), 8000);
        assert_eq!(AudioEncoding::G711Alaw.sample_rate(), 8000);
        assert_eq!(AudioEncoding::Pcm16.sample_rate(), 24000);
    }

    #[test]
    fn test_encoding_from_wire() {
        assert_eq!(AudioEncoding::from_wire("mulaw"), Some(AudioEncoding::G711Ulaw));
        assert_eq!(
            AudioEncoding::from_wire("audio/x-mulaw"),
            Some(AudioEncoding::G711Ulaw)
        );
        assert_eq!(AudioEncoding::from_wire("linear16"), Some(AudioEncoding::Pcm16));
        assert_eq!(AudioEncoding::from_wire("opus"), None);
    }

    #[test]
    fn test_decode_encode_round_trip() {
        let codec = FrameCodec::new(AudioEncoding::G711Ulaw);
        let original: Vec<u8> = (0u8..=255).collect();
        let wire = BASE64_STANDARD.encode(&original);

        let frame = codec.decode_inbound(7, 140, &wire).unwrap();
        assert_eq!(frame.sequence_number, 7);
        assert_eq!(frame.timestamp_ms, 140);
        assert_eq!(frame.direction, FrameDirection::Inbound);
        assert_eq!(&frame.payload[..], &original[..]);

        let re_encoded = codec.encode_outbound(&frame);
        let decoded_again = codec.decode_inbound(8, 160, &re_encoded).unwrap();
        assert_eq!(decoded_again.payload, frame.payload);
    }

    #[test]
    fn test_decode_empty_payload() {
        let codec = FrameCodec::new(AudioEncoding::G711Ulaw);
        assert!(matches!(
            codec.decode_inbound(1, 0, ""),
            Err(DecodeError::EmptyPayload)
        ));
        // Base64 of zero bytes is also empty audio
        assert!(matches!(
            codec.decode_inbound(1, 0, &BASE64_STANDARD.encode([])),
            Err(DecodeError::EmptyPayload)
        ));
    }

    #[test]
    fn test_decode_invalid_base64() {
        let codec = FrameCodec::new(AudioEncoding::G711Ulaw);
        assert!(matches!(
            codec.decode_inbound(1, 0, "not base64!!"),
            Err(DecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_validate_format_accepts_matching() {
        let codec = FrameCodec::new(AudioEncoding::G711Ulaw);
        assert!(codec.validate_format("audio/x-mulaw", 8000, 1).is_ok());
        assert!(codec.validate_format("g711_ulaw", 8000, 1).is_ok());
    }

    #[test]
    fn test_validate_format_rejects_mismatch() {
        let codec = FrameCodec::new(AudioEncoding::G711Ulaw);
        assert!(matches!(
            codec.validate_format("pcm16", 24000, 1),
            Err(DecodeError::FormatMismatch(_))
        ));
        assert!(matches!(
            codec.validate_format("g711_ulaw", 16000, 1),
            Err(DecodeError::FormatMismatch(_))
        ));
        assert!(matches!(
            codec.validate_format("g711_ulaw", 8000, 2),
            Err(DecodeError::FormatMismatch(_))
        ));
        assert!(matches!(
            codec.validate_format("opus", 48000, 1),
            Err(DecodeError::FormatMismatch(_))
        ));
    }
}
