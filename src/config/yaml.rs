//! YAML configuration file loading.
//!
//! All fields are optional to allow partial configuration; values present in
//! the file override environment-derived values.
//!
//! # Example YAML structure
//! ```yaml
//! server:
//!   host: "0.0.0.0"
//!   port: 3001
//!
//! upstream:
//!   api_key: "sk-..."
//!   model: "gpt-4o-realtime-preview"
//!   voice: "alloy"
//!   audio_encoding: "g711_ulaw"
//!   turn_detection: "server_vad"
//!   connect_timeout_ms: 10000
//!   max_connect_attempts: 3
//!
//! session:
//!   max_sessions: 100
//!   idle_timeout_secs: 60
//!   stale_frame_window: 8
//!
//! fallback:
//!   bridge_enabled: true
//!   enabled: true
//!   model: "gpt-4o-mini"
//!   grace_ms: 2000
//! ```

use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub upstream: Option<UpstreamYaml>,
    pub session: Option<SessionYaml>,
    pub fallback: Option<FallbackYaml>,
}

/// Server settings from YAML.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Speech-peer settings from YAML.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct UpstreamYaml {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub grounding_context: Option<String>,
    pub audio_encoding: Option<String>,
    pub turn_detection: Option<String>,
    pub temperature: Option<f32>,
    pub max_response_tokens: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub max_connect_attempts: Option<u32>,
    pub reconnect_initial_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub send_queue_capacity: Option<usize>,
}

/// Session behavior from YAML.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub max_sessions: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub idle_check_secs: Option<u64>,
    pub outbound_buffer_frames: Option<usize>,
    pub stale_frame_window: Option<u64>,
    pub interrupt_grace_ms: Option<u64>,
}

/// Fallback behavior from YAML.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FallbackYaml {
    pub bridge_enabled: Option<bool>,
    pub enabled: Option<bool>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub grace_ms: Option<u64>,
}

impl YamlConfig {
    /// Load and parse a YAML configuration file.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_parses() {
        let yaml = r#"
server:
  port: 4000
upstream:
  voice: "sage"
"#;
        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.unwrap().port, Some(4000));
        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.voice.as_deref(), Some("sage"));
        assert!(upstream.model.is_none());
        assert!(config.session.is_none());
    }

    #[test]
    fn test_empty_yaml_parses() {
        let config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.server.is_none());
        assert!(config.fallback.is_none());
    }
}
