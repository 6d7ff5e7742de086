//! Liveness and management-surface handlers.

use std::sync::Arc;

use axum::{Json, extract::State};

use crate::core::session::SessionStatus;
use crate::state::AppState;

/// Liveness check.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "voicebridge-gateway",
        "status": "healthy",
        "active_sessions": state.registry.len(),
        "bridge_enabled": state.config.bridge_enabled,
        "fallback_enabled": state.config.fallback_enabled,
    }))
}

/// Per-session status snapshot for operators.
pub async fn sessions_status(State(state): State<Arc<AppState>>) -> Json<Vec<SessionStatus>> {
    Json(state.registry.statuses())
}
