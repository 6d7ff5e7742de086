//! Telephony media-stream WebSocket handler.
//!
//! One WebSocket connection per phone call. The `start` event creates and
//! registers a call session and triggers the per-call path decision; `media`
//! frames feed the inbound flow; `stop`, disconnects, idle timeouts and
//! protocol violations all tear the session down through the same cleanup
//! path.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::{select, time::Duration};
use tracing::{debug, info, warn};

use crate::core::audio::FrameCodec;
use crate::core::session::{CallSession, RegistryError, SessionError};
use crate::core::upstream::UpstreamClient;
use crate::fallback::PathUsed;
use crate::state::AppState;
use crate::telephony::messages::{OutboundMessage, StartMeta, TelephonyMessage};

/// Route channel capacity between producers and the socket writer.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Messages routed to the socket writer task.
enum MediaRoute {
    /// A telephony protocol message
    Outgoing(OutboundMessage),
    /// Close the WebSocket and stop the writer
    Close,
}

/// Telephony media-stream WebSocket handler.
///
/// Upgrades the HTTP connection to WebSocket; the telephony peer then
/// drives the session with its media-stream event protocol.
pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("telephony media stream upgrade requested");
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

/// Drive one telephony connection from upgrade to teardown.
async fn handle_media_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("telephony media stream connected");

    let (mut sender, mut receiver) = socket.split();
    let (route_tx, mut route_rx) = mpsc::channel::<MediaRoute>(CHANNEL_BUFFER_SIZE);

    // Writer task: everything going to the telephony peer funnels through
    // one place so close ordering is deterministic
    let sender_task = tokio::spawn(async move {
        while let Some(route) = route_rx.recv().await {
            let result = match route {
                MediaRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        tracing::error!("failed to serialize outbound message: {e}");
                        continue;
                    }
                },
                MediaRoute::Close => {
                    info!("closing telephony media stream");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                warn!("failed to send to telephony peer: {e}");
                break;
            }
        }
    });

    // The session emits plain protocol messages; forward them into the
    // route channel
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(CHANNEL_BUFFER_SIZE);
    let forward_tx = route_tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if forward_tx.send(MediaRoute::Outgoing(message)).await.is_err() {
                break;
            }
        }
    });

    let mut call: Option<Arc<CallSession>> = None;

    // Guard against a peer that connects and never starts a stream; once a
    // session exists its own watchdog owns idle detection
    let check_interval = Duration::from_secs(state.config.idle_check_secs.max(1));
    let idle_timeout = Duration::from_secs(state.config.idle_timeout_secs.max(1));
    let mut last_activity = std::time::Instant::now();

    loop {
        select! {
            msg = receiver.next() => {
                last_activity = std::time::Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let keep_going = process_telephony_message(
                            &text,
                            &mut call,
                            &outbound_tx,
                            &route_tx,
                            &state,
                        )
                        .await;
                        if !keep_going {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("telephony peer closed the stream");
                        break;
                    }
                    // Binary, ping and pong are not part of the protocol
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("telephony socket error: {e}");
                        break;
                    }
                    None => {
                        info!("telephony media stream disconnected");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(check_interval) => {
                if call.is_none() && last_activity.elapsed() > idle_timeout {
                    warn!("telephony connection idle before stream start, closing");
                    let _ = route_tx.send(MediaRoute::Close).await;
                    break;
                }
            }
        }
    }

    // Cleanup on every exit path
    if let Some(session) = call.take() {
        session.shutdown().await;
        state.registry.unregister(session.telephony_stream_id());
    }
    forward_task.abort();
    sender_task.abort();
    info!("telephony media stream terminated");
}

/// Dispatch one telephony event. Returns false when the connection should
/// end.
async fn process_telephony_message(
    text: &str,
    call: &mut Option<Arc<CallSession>>,
    outbound_tx: &mpsc::Sender<OutboundMessage>,
    route_tx: &mpsc::Sender<MediaRoute>,
    state: &Arc<AppState>,
) -> bool {
    let message: TelephonyMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            let violation =
                SessionError::ProtocolViolation(format!("unparseable telephony event: {e}"));
            warn!(error = %violation, "telephony peer broke the wire contract");
            if let Some(session) = call {
                session.fail(&violation.to_string()).await;
            }
            let _ = route_tx.send(MediaRoute::Close).await;
            return false;
        }
    };

    match message {
        TelephonyMessage::Connected { protocol, .. } => {
            debug!(?protocol, "telephony protocol handshake");
            true
        }
        TelephonyMessage::Start { stream_sid, start } => {
            handle_stream_start(stream_sid, start, call, outbound_tx, route_tx, state).await
        }
        TelephonyMessage::Media {
            sequence_number,
            media,
            ..
        } => {
            let Some(session) = call else {
                warn!("media frame before stream start, dropping");
                return true;
            };
            if session.path() != PathUsed::Streaming {
                debug!("turn-based path active, not forwarding media");
                return true;
            }
            let Ok(seq) = sequence_number.parse::<u64>() else {
                warn!(%sequence_number, "media frame with garbled sequence number");
                return true;
            };
            session
                .handle_media(seq, media.timestamp_ms(), &media.payload)
                .await;
            true
        }
        TelephonyMessage::Mark { mark, .. } => {
            if let Some(session) = call {
                session.handle_mark(&mark.name);
            }
            true
        }
        TelephonyMessage::Stop { stream_sid, .. } => {
            info!(%stream_sid, "telephony stream stop");
            false
        }
        TelephonyMessage::Other => {
            tracing::trace!("unhandled telephony event");
            true
        }
    }
}

/// Handle the `start` event: validate the declared format, register the
/// session, and decide the conversational path.
async fn handle_stream_start(
    stream_sid: String,
    start: StartMeta,
    call: &mut Option<Arc<CallSession>>,
    outbound_tx: &mpsc::Sender<OutboundMessage>,
    route_tx: &mpsc::Sender<MediaRoute>,
    state: &Arc<AppState>,
) -> bool {
    if call.is_some() {
        warn!(%stream_sid, "duplicate stream start on one connection");
        return true;
    }
    info!(%stream_sid, call_sid = %start.call_sid, "telephony stream starting");

    let codec = FrameCodec::new(state.config.audio_encoding);
    if let Some(format) = &start.media_format
        && let Err(e) = codec.validate_format(&format.encoding, format.sample_rate, format.channels)
    {
        warn!(error = %e, "rejecting stream with mismatched media format");
        let _ = route_tx.send(MediaRoute::Close).await;
        return false;
    }

    let client = UpstreamClient::new(state.config.upstream_config());
    let session = CallSession::new(
        stream_sid.clone(),
        start.call_sid.clone(),
        client,
        codec,
        state.config.session_options(),
        outbound_tx.clone(),
    );

    // Capacity is checked before any upstream resource is allocated; an
    // over-capacity caller gets a clean rejection, never a silent drop
    if let Err(e) = state.registry.register(&stream_sid, session.clone()) {
        match e {
            RegistryError::CapacityExceeded(active) => {
                warn!(active, "at session capacity, rejecting call");
            }
            RegistryError::DuplicateId(_) => {
                warn!(%stream_sid, "stream id already active, rejecting call");
            }
        }
        let _ = route_tx.send(MediaRoute::Close).await;
        return false;
    }

    let handle = state.fallback.start_call(session.clone()).await;
    match handle.path() {
        PathUsed::Streaming => {
            info!(session_id = %session.session_id(), "call served by streaming bridge");
        }
        PathUsed::TurnBased => {
            info!(session_id = %session.session_id(), "call served by turn-based pipeline");
        }
    }

    *call = Some(session);
    true
}
