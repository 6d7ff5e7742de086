//! Configuration module for the VoiceBridge server
//!
//! Handles server configuration from .env files, YAML files and environment
//! variables. Priority: YAML > ENV vars > defaults.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::audio::AudioEncoding;
use crate::core::session::SessionOptions;
use crate::core::upstream::{
    DEFAULT_UPSTREAM_ENDPOINT, DEFAULT_UPSTREAM_MODEL, RetryPolicy, TurnDetectionMode,
    UpstreamConfig,
};

mod yaml;

pub use yaml::YamlConfig;

/// System instructions used when none are configured. Responses are spoken
/// aloud over a phone line, which shapes the register.
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are a helpful, professional assistant answering a live phone call. \
Keep responses short and conversational - two or three spoken sentences. \
Avoid lists, special characters, or anything that only works in writing. \
If you do not know something, say so and offer to connect the caller with \
a person. Handle interruptions gracefully and stay on topic.";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed to parse
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Environment variable or YAML key
        key: String,
        /// The offending value
        value: String,
    },

    /// A required setting is missing
    #[error("missing required configuration: {0}")]
    Missing(String),

    /// The configuration file could not be loaded
    #[error("configuration file error: {0}")]
    File(String),
}

/// Server configuration.
///
/// Everything needed to run the bridge: listener settings, the speech-peer
/// connection, per-session behavior, and the fallback path.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // Speech peer
    /// API key for the speech peer and the fallback pipeline
    pub openai_api_key: Option<String>,
    /// Speech-peer WebSocket endpoint
    pub upstream_endpoint: String,
    /// Realtime model identifier
    pub realtime_model: String,
    /// Voice identity for AI audio
    pub voice: String,
    /// System instructions; defaults to [`DEFAULT_INSTRUCTIONS`]
    pub instructions: Option<String>,
    /// Supplemental grounding context (menu, hours, ...) appended to the
    /// instructions
    pub grounding_context: Option<String>,
    /// Audio encoding on both legs of the bridge
    pub audio_encoding: AudioEncoding,
    /// Turn-detection mode
    pub turn_detection: TurnDetectionMode,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Response token budget
    pub max_response_tokens: Option<u32>,
    /// Connect handshake timeout
    pub connect_timeout_ms: u64,
    /// Connect/reconnect retry policy
    pub retry: RetryPolicy,
    /// Bounded upstream send queue capacity
    pub send_queue_capacity: usize,

    // Session behavior
    /// Maximum concurrent call sessions
    pub max_sessions: usize,
    /// Idle seconds before a session self-terminates
    pub idle_timeout_secs: u64,
    /// Idle check cadence
    pub idle_check_secs: u64,
    /// Bounded outbound audio buffer per session
    pub outbound_buffer_frames: usize,
    /// Reorder window for out-of-order inbound frames
    pub stale_frame_window: u64,
    /// Wait for turn-cancellation confirmation before resuming
    pub interrupt_grace_ms: u64,

    // Fallback
    /// Whether the streaming bridge is attempted at all
    pub bridge_enabled: bool,
    /// Whether the turn-based pipeline is available
    pub fallback_enabled: bool,
    /// Model for the turn-based pipeline
    pub fallback_model: String,
    /// Chat-completions base URL for the turn-based pipeline
    pub fallback_endpoint: String,
    /// Grace window after connect in which a failed bridge degrades to the
    /// turn-based path
    pub fallback_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            openai_api_key: None,
            upstream_endpoint: DEFAULT_UPSTREAM_ENDPOINT.to_string(),
            realtime_model: DEFAULT_UPSTREAM_MODEL.to_string(),
            voice: "alloy".to_string(),
            instructions: None,
            grounding_context: None,
            audio_encoding: AudioEncoding::G711Ulaw,
            turn_detection: TurnDetectionMode::ServerVad,
            temperature: Some(0.8),
            max_response_tokens: None,
            connect_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            send_queue_capacity: 256,
            max_sessions: 100,
            idle_timeout_secs: 60,
            idle_check_secs: 10,
            outbound_buffer_frames: 200,
            stale_frame_window: 8,
            interrupt_grace_ms: 1000,
            bridge_enabled: true,
            fallback_enabled: true,
            fallback_model: "gpt-4o-mini".to_string(),
            fallback_endpoint: "https://api.openai.com/v1".to_string(),
            fallback_grace_ms: 2000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::load_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse environment variables without validating; `from_file` fills
    /// gaps from YAML before validation runs.
    fn load_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_parse("MAX_CONNECT_ATTEMPTS", defaults.retry.max_attempts)?,
            initial_delay_ms: env_parse(
                "RECONNECT_INITIAL_DELAY_MS",
                defaults.retry.initial_delay_ms,
            )?,
            max_delay_ms: env_parse("RECONNECT_MAX_DELAY_MS", defaults.retry.max_delay_ms)?,
            ..defaults.retry.clone()
        };

        let config = Self {
            host: env_string("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port)?,
            openai_api_key: env_string("OPENAI_API_KEY"),
            upstream_endpoint: env_string("UPSTREAM_ENDPOINT").unwrap_or(defaults.upstream_endpoint),
            realtime_model: env_string("REALTIME_MODEL").unwrap_or(defaults.realtime_model),
            voice: env_string("REALTIME_VOICE").unwrap_or(defaults.voice),
            instructions: env_string("REALTIME_INSTRUCTIONS"),
            grounding_context: env_string("GROUNDING_CONTEXT"),
            audio_encoding: env_string("AUDIO_ENCODING")
                .map(|s| AudioEncoding::from_wire_or_default(&s))
                .unwrap_or(defaults.audio_encoding),
            turn_detection: match env_string("REALTIME_TURN_DETECTION").as_deref() {
                Some("manual") | Some("none") => TurnDetectionMode::Manual,
                _ => TurnDetectionMode::ServerVad,
            },
            temperature: env_opt_parse("REALTIME_TEMPERATURE")?.or(defaults.temperature),
            max_response_tokens: env_opt_parse("REALTIME_MAX_TOKENS")?,
            connect_timeout_ms: env_parse("CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            retry,
            send_queue_capacity: env_parse("SEND_QUEUE_CAPACITY", defaults.send_queue_capacity)?,
            max_sessions: env_parse("MAX_SESSIONS", defaults.max_sessions)?,
            idle_timeout_secs: env_parse("IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
            idle_check_secs: env_parse("IDLE_CHECK_SECS", defaults.idle_check_secs)?,
            outbound_buffer_frames: env_parse(
                "OUTBOUND_BUFFER_FRAMES",
                defaults.outbound_buffer_frames,
            )?,
            stale_frame_window: env_parse("STALE_FRAME_WINDOW", defaults.stale_frame_window)?,
            interrupt_grace_ms: env_parse("INTERRUPT_GRACE_MS", defaults.interrupt_grace_ms)?,
            bridge_enabled: env_parse("USE_STREAMING_BRIDGE", defaults.bridge_enabled)?,
            fallback_enabled: env_parse("ENABLE_FALLBACK", defaults.fallback_enabled)?,
            fallback_model: env_string("FALLBACK_MODEL").unwrap_or(defaults.fallback_model),
            fallback_endpoint: env_string("FALLBACK_ENDPOINT").unwrap_or(defaults.fallback_endpoint),
            fallback_grace_ms: env_parse("FALLBACK_GRACE_MS", defaults.fallback_grace_ms)?,
        };

        Ok(config)
    }

    /// Load configuration from a YAML file, with environment variables
    /// filling anything the file omits.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path).map_err(|e| ConfigError::File(e.to_string()))?;
        // Start from env-derived config, then let the file win
        let mut config = Self::load_env()?;
        config.apply_yaml(&yaml);
        config.validate()?;
        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: &YamlConfig) {
        if let Some(server) = &yaml.server {
            if let Some(host) = &server.host {
                self.host = host.clone();
            }
            if let Some(port) = server.port {
                self.port = port;
            }
        }
        if let Some(upstream) = &yaml.upstream {
            if let Some(v) = &upstream.api_key {
                self.openai_api_key = Some(v.clone());
            }
            if let Some(v) = &upstream.endpoint {
                self.upstream_endpoint = v.clone();
            }
            if let Some(v) = &upstream.model {
                self.realtime_model = v.clone();
            }
            if let Some(v) = &upstream.voice {
                self.voice = v.clone();
            }
            if let Some(v) = &upstream.instructions {
                self.instructions = Some(v.clone());
            }
            if let Some(v) = &upstream.grounding_context {
                self.grounding_context = Some(v.clone());
            }
            if let Some(v) = &upstream.audio_encoding {
                self.audio_encoding = AudioEncoding::from_wire_or_default(v);
            }
            if let Some(v) = &upstream.turn_detection {
                self.turn_detection = match v.as_str() {
                    "manual" | "none" => TurnDetectionMode::Manual,
                    _ => TurnDetectionMode::ServerVad,
                };
            }
            if let Some(v) = upstream.temperature {
                self.temperature = Some(v);
            }
            if let Some(v) = upstream.max_response_tokens {
                self.max_response_tokens = Some(v);
            }
            if let Some(v) = upstream.connect_timeout_ms {
                self.connect_timeout_ms = v;
            }
            if let Some(v) = upstream.max_connect_attempts {
                self.retry.max_attempts = v;
            }
            if let Some(v) = upstream.reconnect_initial_delay_ms {
                self.retry.initial_delay_ms = v;
            }
            if let Some(v) = upstream.reconnect_max_delay_ms {
                self.retry.max_delay_ms = v;
            }
            if let Some(v) = upstream.send_queue_capacity {
                self.send_queue_capacity = v;
            }
        }
        if let Some(session) = &yaml.session {
            if let Some(v) = session.max_sessions {
                self.max_sessions = v;
            }
            if let Some(v) = session.idle_timeout_secs {
                self.idle_timeout_secs = v;
            }
            if let Some(v) = session.idle_check_secs {
                self.idle_check_secs = v;
            }
            if let Some(v) = session.outbound_buffer_frames {
                self.outbound_buffer_frames = v;
            }
            if let Some(v) = session.stale_frame_window {
                self.stale_frame_window = v;
            }
            if let Some(v) = session.interrupt_grace_ms {
                self.interrupt_grace_ms = v;
            }
        }
        if let Some(fallback) = &yaml.fallback {
            if let Some(v) = fallback.bridge_enabled {
                self.bridge_enabled = v;
            }
            if let Some(v) = fallback.enabled {
                self.fallback_enabled = v;
            }
            if let Some(v) = &fallback.model {
                self.fallback_model = v.clone();
            }
            if let Some(v) = &fallback.endpoint {
                self.fallback_endpoint = v.clone();
            }
            if let Some(v) = fallback.grace_ms {
                self.fallback_grace_ms = v;
            }
        }
    }

    /// Validate the configuration before use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PORT".to_string(),
                value: "0".to_string(),
            });
        }
        if (self.bridge_enabled || self.fallback_enabled)
            && self.openai_api_key.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::Missing("OPENAI_API_KEY".to_string()));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_SESSIONS".to_string(),
                value: "0".to_string(),
            });
        }
        if self.stale_frame_window == 0 {
            return Err(ConfigError::InvalidValue {
                key: "STALE_FRAME_WINDOW".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Listener address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// System instructions, falling back to the default prompt.
    pub fn instructions_or_default(&self) -> String {
        self.instructions
            .clone()
            .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string())
    }

    /// Build the upstream client configuration for a new session.
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            api_key: self.openai_api_key.clone().unwrap_or_default(),
            endpoint: self.upstream_endpoint.clone(),
            model: self.realtime_model.clone(),
            voice: self.voice.clone(),
            instructions: Some(self.instructions_or_default()),
            context: self.grounding_context.clone(),
            input_encoding: self.audio_encoding,
            output_encoding: self.audio_encoding,
            turn_detection: self.turn_detection,
            temperature: self.temperature,
            max_response_tokens: self.max_response_tokens,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry: self.retry.clone(),
            send_queue_capacity: self.send_queue_capacity,
        }
    }

    /// Build the session behavior options for a new session.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            outbound_buffer_frames: self.outbound_buffer_frames,
            stale_frame_window: self.stale_frame_window,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            idle_check_interval: Duration::from_secs(self.idle_check_secs),
            interrupt_grace: Duration::from_millis(self.interrupt_grace_ms),
        }
    }

    /// Grace window for the bridge-to-fallback decision.
    pub fn fallback_grace(&self) -> Duration {
        Duration::from_millis(self.fallback_grace_ms)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env_string(key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn env_opt_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig {
            openai_api_key: Some("test-key".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.audio_encoding, AudioEncoding::G711Ulaw);
        assert_eq!(config.turn_detection, TurnDetectionMode::ServerVad);
        assert_eq!(config.max_sessions, 100);
        assert!(config.bridge_enabled);
        assert!(config.fallback_enabled);
    }

    #[test]
    fn test_validate_requires_api_key_when_enabled() {
        let config = ServerConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));

        assert!(valid_config().validate().is_ok());

        // With both paths disabled no key is needed
        let offline = ServerConfig {
            bridge_enabled: false,
            fallback_enabled: false,
            ..Default::default()
        };
        assert!(offline.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let config = ServerConfig {
            max_sessions: 0,
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let config = ServerConfig {
            port: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_upstream_config_carries_context() {
        let config = ServerConfig {
            grounding_context: Some("Hours: 9-5".to_string()),
            ..valid_config()
        };
        let upstream = config.upstream_config();
        assert_eq!(upstream.api_key, "test-key");
        assert_eq!(upstream.context.as_deref(), Some("Hours: 9-5"));
        // Default prompt fills in when no instructions are configured
        assert!(upstream.instructions.unwrap().contains("phone call"));
    }

    #[test]
    fn test_yaml_overrides_env_defaults() {
        let yaml: YamlConfig = serde_yaml::from_str(
            r#"
server:
  port: 4242
upstream:
  voice: "sage"
  max_connect_attempts: 7
session:
  max_sessions: 5
fallback:
  bridge_enabled: false
"#,
        )
        .unwrap();
        let mut config = valid_config();
        config.apply_yaml(&yaml);
        assert_eq!(config.port, 4242);
        assert_eq!(config.voice, "sage");
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.max_sessions, 5);
        assert!(!config.bridge_enabled);
        // Untouched values survive
        assert_eq!(config.fallback_model, "gpt-4o-mini");
    }

    #[test]
    fn test_session_options_mapping() {
        let config = valid_config();
        let options = config.session_options();
        assert_eq!(options.idle_timeout, Duration::from_secs(60));
        assert_eq!(options.interrupt_grace, Duration::from_millis(1000));
        assert_eq!(options.stale_frame_window, 8);
    }
}
