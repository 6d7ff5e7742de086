//! HTTP and WebSocket request handlers.

pub mod media_stream;
pub mod status;

pub use media_stream::media_stream_handler;
pub use status::{health_check, sessions_status};
