pub mod config;
pub mod core;
pub mod fallback;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod telephony;

// Re-export commonly used items for convenience
pub use crate::config::ServerConfig;
pub use crate::core::audio::{AudioEncoding, AudioFrame, DecodeError, FrameCodec};
pub use crate::core::session::{CallSession, ConnectionState, SessionRegistry, SessionStatus};
pub use crate::core::upstream::{
    ConnectError, RetryPolicy, UpstreamClient, UpstreamConfig, UpstreamEvent,
};
pub use crate::fallback::{FallbackController, PathUsed, TurnPipeline};
pub use crate::state::AppState;
