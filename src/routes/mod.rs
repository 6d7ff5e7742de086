//! Route configuration.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, media_stream_handler, sessions_status};
use crate::state::AppState;

/// Create the telephony media-stream router.
///
/// # Endpoint
///
/// `GET /media` - WebSocket upgrade for a telephony media stream. The peer
/// then sends `start`, `media`, `mark` and `stop` events; the bridge sends
/// back `media`, `mark` and `clear`.
pub fn create_media_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/media", get(media_stream_handler))
        .layer(TraceLayer::new_for_http())
}

/// Create the management router: liveness plus the per-session status
/// snapshot.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/sessions", get(sessions_status))
}
