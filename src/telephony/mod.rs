//! Telephony media-stream protocol types.

pub mod messages;

pub use messages::{OutboundMessage, TelephonyMessage};
