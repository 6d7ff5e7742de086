//! Shared application state.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::session::SessionRegistry;
use crate::fallback::{ChatTurnPipeline, FallbackController};

/// State shared by every handler: configuration, the session registry, and
/// the fallback controller. The registry is the only cross-session shared
/// resource.
pub struct AppState {
    /// Loaded server configuration
    pub config: ServerConfig,
    /// Active call sessions keyed by telephony stream id
    pub registry: SessionRegistry,
    /// Per-call path decision and turn-based pipeline
    pub fallback: FallbackController,
}

impl AppState {
    /// Build application state from validated configuration.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let registry = SessionRegistry::new(config.max_sessions);
        let pipeline = Arc::new(ChatTurnPipeline::new(
            config.fallback_endpoint.clone(),
            config.openai_api_key.clone().unwrap_or_default(),
            config.fallback_model.clone(),
            config.instructions_or_default(),
        ));
        let fallback = FallbackController::new(
            config.bridge_enabled,
            config.fallback_enabled,
            config.fallback_grace(),
            pipeline,
        );
        Arc::new(Self {
            config,
            registry,
            fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_construction() {
        let config = ServerConfig {
            openai_api_key: Some("test-key".to_string()),
            max_sessions: 3,
            ..Default::default()
        };
        let state = AppState::new(config);
        assert!(state.registry.is_empty());
        assert!(state.fallback.fallback_enabled());
    }
}
