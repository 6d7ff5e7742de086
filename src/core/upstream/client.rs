//! Speech-peer streaming client implementation.
//!
//! One [`UpstreamClient`] owns one logical connection: the WebSocket
//! handshake (bearer auth, bounded by a handshake timeout and the retry
//! policy), a bounded send queue drained by a spawned I/O task, and the
//! event stream the session consumes. Mid-stream connection loss triggers
//! bounded reconnection with exponential backoff; the session configuration
//! is re-sent after a successful reconnect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::messages::{ClientEvent, ConversationItem, ServerEvent, SessionConfig, TurnDetection};
use super::{
    ConnectError, TranscriptRole, TurnDetectionMode, UpstreamConfig, UpstreamError, UpstreamEvent,
    turn_status_from_wire,
};

/// Capacity of the upstream event channel consumed by the session.
const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Send Queue
// =============================================================================

/// Bounded queue between the real-time audio path and the socket writer.
///
/// `push` never blocks; on overflow the oldest queued *audio* frame is
/// dropped with a warning (control events are never dropped). A dropped
/// frame is an audible glitch, which is preferable to unbounded growth or
/// stalling the caller's audio path on network backpressure.
struct SendQueue {
    capacity: usize,
    inner: parking_lot::Mutex<VecDeque<ClientEvent>>,
    notify: Notify,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: parking_lot::Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: ClientEvent) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|e| e.is_audio()) {
                    queue.remove(pos);
                    tracing::warn!("upstream send queue full, dropping oldest audio frame");
                } else {
                    queue.pop_front();
                    tracing::warn!("upstream send queue full, dropping oldest event");
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Push ahead of queued events (session configuration on reconnect).
    fn push_priority(&self, event: ClientEvent) {
        self.inner.lock().push_front(event);
        self.notify.notify_one();
    }

    async fn pop(&self) -> ClientEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.inner.lock().pop_front() {
                return event;
            }
            notified.await;
        }
    }

    fn clear(&self) {
        self.inner.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

// =============================================================================
// Upstream Client
// =============================================================================

/// Streaming client for the speech-to-speech peer.
///
/// At most one live socket exists per client at any time: the I/O task owns
/// the socket exclusively and replaces it in place on reconnect.
pub struct UpstreamClient {
    config: UpstreamConfig,
    connected: Arc<AtomicBool>,
    started: AtomicBool,
    reconnect_attempts: Arc<AtomicU32>,
    queue: Arc<SendQueue>,
    events_tx: mpsc::Sender<UpstreamEvent>,
    events_rx: Option<mpsc::Receiver<UpstreamEvent>>,
    io_handle: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl UpstreamClient {
    /// Create a client; no connection is made until [`connect`].
    ///
    /// [`connect`]: UpstreamClient::connect
    pub fn new(config: UpstreamConfig) -> Self {
        let queue = Arc::new(SendQueue::new(config.send_queue_capacity.max(1)));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            queue,
            events_tx,
            events_rx: Some(events_rx),
            io_handle: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Establish the connection, retrying per the configured policy, and
    /// transmit the initial session configuration.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let mut attempt: u32 = 0;
        let ws = loop {
            attempt += 1;
            match handshake(&self.config, &self.shutdown).await {
                Ok(ws) => break ws,
                Err(ConnectError::Cancelled) => return Err(ConnectError::Cancelled),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "speech peer connect attempt failed");
                    if !self.config.retry.should_retry(attempt) {
                        return Err(ConnectError::Exhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    let delay = Duration::from_millis(self.config.retry.delay_for(attempt));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(ConnectError::Cancelled),
                    }
                }
            }
        };

        tracing::info!(endpoint = %self.config.endpoint, "connected to speech peer");
        self.connected.store(true, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        // Session configuration goes out before anything else
        self.queue.push_priority(ClientEvent::SessionUpdate {
            session: build_session_config(&self.config),
        });

        self.spawn_io_task(ws);
        Ok(())
    }

    /// Non-blocking enqueue of caller audio for transmission.
    pub fn send_audio(&self, payload: &[u8]) -> Result<(), UpstreamError> {
        self.ensure_started()?;
        self.queue.push(ClientEvent::audio_append(payload));
        Ok(())
    }

    /// Signal end-of-utterance. No-op when the peer detects turns itself.
    pub fn commit_turn(&self) -> Result<(), UpstreamError> {
        if self.config.turn_detection == TurnDetectionMode::ServerVad {
            return Ok(());
        }
        self.ensure_started()?;
        self.queue.push(ClientEvent::InputAudioBufferCommit);
        self.queue.push(ClientEvent::ResponseCreate);
        Ok(())
    }

    /// Ask the peer to stop emitting output for the current AI turn.
    pub fn cancel_response(&self) -> Result<(), UpstreamError> {
        self.ensure_started()?;
        self.queue.push(ClientEvent::ResponseCancel);
        Ok(())
    }

    /// Inject supplemental grounding context into the conversation.
    pub fn inject_context(&self, text: &str) -> Result<(), UpstreamError> {
        self.ensure_started()?;
        self.queue.push(ClientEvent::ConversationItemCreate {
            item: ConversationItem::system_text(text),
        });
        Ok(())
    }

    /// Take the upstream event stream. Yields `None` after the stream has
    /// already been handed out once.
    pub fn events(&mut self) -> Option<mpsc::Receiver<UpstreamEvent>> {
        self.events_rx.take()
    }

    /// Whether the connection is currently live.
    pub fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Reconnection attempts made since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Shared handle to the reconnect counter, for status snapshots that
    /// cannot await the client lock.
    pub(crate) fn attempts_handle(&self) -> Arc<AtomicU32> {
        self.reconnect_attempts.clone()
    }

    /// Graceful shutdown: cancels any in-flight connect attempt and pending
    /// backoff timer, closes the socket, and releases the I/O task.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.io_handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                tracing::warn!("upstream I/O task did not exit in time, aborting");
                abort.abort();
            }
        }
        self.queue.clear();
        tracing::info!("upstream client closed");
    }

    fn ensure_started(&self) -> Result<(), UpstreamError> {
        if !self.started.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return Err(UpstreamError::NotConnected);
        }
        Ok(())
    }

    fn spawn_io_task(&mut self, ws: WsStream) {
        let queue = self.queue.clone();
        let events_tx = self.events_tx.clone();
        let connected = self.connected.clone();
        let reconnect_attempts = self.reconnect_attempts.clone();
        let shutdown = self.shutdown.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let (mut sink, mut stream) = ws.split();

            'outer: loop {
                // Message processing loop for the current socket
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            break 'outer;
                        }

                        event = queue.pop() => {
                            let json = match serde_json::to_string(&event) {
                                Ok(json) => json,
                                Err(e) => {
                                    tracing::error!("failed to serialize client event: {e}");
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(json.into())).await {
                                tracing::warn!("failed to send to speech peer: {e}");
                                break;
                            }
                        }

                        msg = stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<ServerEvent>(&text) {
                                        Ok(event) => {
                                            if let Some(mapped) = map_server_event(event)
                                                && events_tx.send(mapped).await.is_err()
                                            {
                                                // Consumer gone - session is tearing down
                                                break 'outer;
                                            }
                                        }
                                        Err(e) => {
                                            tracing::warn!("unparseable speech peer event: {e}");
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    if sink.send(Message::Pong(data)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    tracing::info!("speech peer closed the connection");
                                    break;
                                }
                                Some(Err(e)) => {
                                    tracing::warn!("speech peer socket error: {e}");
                                    break;
                                }
                                None => break,
                                _ => {}
                            }
                        }
                    }
                }

                // Connection dropped - bounded reconnection
                connected.store(false, Ordering::SeqCst);
                if shutdown.is_cancelled() {
                    break 'outer;
                }

                let mut attempt: u32 = 0;
                loop {
                    if !config.retry.should_retry(attempt) {
                        tracing::warn!(
                            attempts = attempt,
                            "speech peer reconnection attempts exhausted"
                        );
                        let _ = events_tx
                            .send(UpstreamEvent::Error {
                                message: format!(
                                    "connection lost after {attempt} reconnection attempts"
                                ),
                                fatal: true,
                            })
                            .await;
                        break 'outer;
                    }
                    attempt += 1;
                    reconnect_attempts.store(attempt, Ordering::SeqCst);

                    let delay = Duration::from_millis(config.retry.delay_for(attempt));
                    tracing::info!(
                        attempt,
                        max_attempts = config.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling speech peer reconnection"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => break 'outer,
                    }

                    match handshake(&config, &shutdown).await {
                        Ok(ws) => {
                            tracing::info!(attempt, "reconnected to speech peer");
                            let (new_sink, new_stream) = ws.split();
                            sink = new_sink;
                            stream = new_stream;
                            connected.store(true, Ordering::SeqCst);
                            reconnect_attempts.store(0, Ordering::SeqCst);
                            // The peer allocates a fresh session; restore our
                            // configuration before any queued audio goes out
                            queue.push_priority(ClientEvent::SessionUpdate {
                                session: build_session_config(&config),
                            });
                            continue 'outer;
                        }
                        Err(ConnectError::Cancelled) => break 'outer,
                        Err(e) => {
                            tracing::warn!(attempt, error = %e, "speech peer reconnection failed");
                        }
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            let _ = events_tx.send(UpstreamEvent::Closed).await;
            tracing::debug!("speech peer connection task ended");
        });

        self.io_handle = Some(handle);
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// Perform one WebSocket handshake attempt, bounded by the connect timeout
/// and cancellable by session shutdown.
async fn handshake(
    config: &UpstreamConfig,
    shutdown: &CancellationToken,
) -> Result<WsStream, ConnectError> {
    let request = http::Request::builder()
        .uri(config.ws_url())
        .header("Authorization", format!("Bearer {}", config.api_key))
        .header("OpenAI-Beta", "realtime=v1")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Host", config.host())
        .body(())
        .map_err(|e| ConnectError::ProtocolMismatch(e.to_string()))?;

    let attempt = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(request),
    );

    let result = tokio::select! {
        _ = shutdown.cancelled() => return Err(ConnectError::Cancelled),
        result = attempt => result,
    };

    match result {
        Err(_elapsed) => Err(ConnectError::Timeout(config.connect_timeout)),
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(classify_handshake_error(e)),
    }
}

fn classify_handshake_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
                ConnectError::AuthRejected(status.to_string())
            } else {
                ConnectError::ProtocolMismatch(format!("unexpected handshake status {status}"))
            }
        }
        tungstenite::Error::Io(e) => ConnectError::Transport(e.to_string()),
        tungstenite::Error::Tls(e) => ConnectError::Transport(e.to_string()),
        other => ConnectError::ProtocolMismatch(other.to_string()),
    }
}

// =============================================================================
// Event Mapping
// =============================================================================

/// Build the session configuration event from client config.
fn build_session_config(config: &UpstreamConfig) -> SessionConfig {
    SessionConfig {
        modalities: Some(vec!["text".to_string(), "audio".to_string()]),
        instructions: config.merged_instructions(),
        voice: Some(config.voice.clone()),
        input_audio_format: Some(config.input_encoding.as_str().to_string()),
        output_audio_format: Some(config.output_encoding.as_str().to_string()),
        turn_detection: Some(match config.turn_detection {
            TurnDetectionMode::ServerVad => TurnDetection::ServerVad {
                threshold: Some(0.5),
                prefix_padding_ms: Some(300),
                silence_duration_ms: Some(500),
            },
            TurnDetectionMode::Manual => TurnDetection::None {},
        }),
        temperature: config.temperature,
        max_response_output_tokens: config.max_response_tokens,
    }
}

/// Translate a wire event into the vocabulary the session consumes.
fn map_server_event(event: ServerEvent) -> Option<UpstreamEvent> {
    match event {
        ServerEvent::SessionCreated { session } => {
            tracing::info!(session_id = %session.id, "speech peer session created");
            Some(UpstreamEvent::Ready {
                session_id: session.id,
            })
        }
        ServerEvent::SessionUpdated { session } => {
            tracing::debug!(session_id = %session.id, "speech peer session updated");
            None
        }
        ServerEvent::SpeechStarted { audio_start_ms, .. } => {
            Some(UpstreamEvent::SpeechStarted { audio_start_ms })
        }
        ServerEvent::SpeechStopped { audio_end_ms, .. } => {
            Some(UpstreamEvent::SpeechStopped { audio_end_ms })
        }
        ServerEvent::AudioDelta {
            response_id, delta, ..
        } => match ServerEvent::decode_audio_delta(&delta) {
            Ok(bytes) => Some(UpstreamEvent::AudioDelta {
                turn_id: response_id,
                payload: Bytes::from(bytes),
            }),
            Err(e) => {
                tracing::warn!("failed to decode audio delta: {e}");
                None
            }
        },
        ServerEvent::AudioTranscriptDone { transcript, .. } => Some(UpstreamEvent::Transcript {
            role: TranscriptRole::Assistant,
            text: transcript,
        }),
        ServerEvent::TranscriptionCompleted { transcript, .. } => {
            Some(UpstreamEvent::Transcript {
                role: TranscriptRole::Caller,
                text: transcript,
            })
        }
        ServerEvent::ResponseDone { response } => Some(UpstreamEvent::TurnComplete {
            turn_id: response.id,
            status: turn_status_from_wire(response.status.as_deref()),
        }),
        ServerEvent::Error { error } => {
            // The peer reports recoverable request-level errors (e.g. a
            // cancel with no active response) with non-server types
            let fatal = error.error_type == "server_error";
            Some(UpstreamEvent::Error {
                message: format!("{}: {}", error.error_type, error.message),
                fatal,
            })
        }
        ServerEvent::Unhandled => {
            tracing::trace!("unhandled speech peer event");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::AudioEncoding;
    use crate::core::upstream::{RetryPolicy, TurnStatus};

    fn test_config() -> UpstreamConfig {
        UpstreamConfig {
            api_key: "test-key".to_string(),
            endpoint: "ws://127.0.0.1:1".to_string(),
            retry: RetryPolicy::single_attempt(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_audio_requires_connection() {
        let client = UpstreamClient::new(test_config());
        assert!(matches!(
            client.send_audio(&[0u8; 160]),
            Err(UpstreamError::NotConnected)
        ));
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_commit_turn_is_noop_under_server_vad() {
        let client = UpstreamClient::new(test_config());
        // Server VAD: no error even without a connection, nothing queued
        assert!(client.commit_turn().is_ok());
        assert_eq!(client.queue.len(), 0);
    }

    #[tokio::test]
    async fn test_commit_turn_requires_connection_in_manual_mode() {
        let config = UpstreamConfig {
            turn_detection: TurnDetectionMode::Manual,
            ..test_config()
        };
        let client = UpstreamClient::new(config);
        assert!(matches!(
            client.commit_turn(),
            Err(UpstreamError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_events_can_only_be_taken_once() {
        let mut client = UpstreamClient::new(test_config());
        assert!(client.events().is_some());
        assert!(client.events().is_none());
    }

    #[test]
    fn test_send_queue_drops_oldest_audio_on_overflow() {
        let queue = SendQueue::new(3);
        queue.push(ClientEvent::audio_append(&[1]));
        queue.push(ClientEvent::audio_append(&[2]));
        queue.push(ClientEvent::audio_append(&[3]));
        assert_eq!(queue.len(), 3);

        queue.push(ClientEvent::audio_append(&[4]));
        assert_eq!(queue.len(), 3);

        // Oldest frame ([1]) was dropped; [2] is now at the front
        let front = queue.inner.lock().pop_front().unwrap();
        match front {
            ClientEvent::InputAudioBufferAppend { audio } => {
                assert_eq!(ServerEvent::decode_audio_delta(&audio).unwrap(), vec![2]);
            }
            _ => panic!("expected audio event"),
        }
    }

    #[test]
    fn test_send_queue_overflow_spares_control_events() {
        let queue = SendQueue::new(2);
        queue.push(ClientEvent::ResponseCancel);
        queue.push(ClientEvent::audio_append(&[1]));
        queue.push(ClientEvent::audio_append(&[2]));
        assert_eq!(queue.len(), 2);

        // The control event survived; the oldest audio frame did not
        let front = queue.inner.lock().pop_front().unwrap();
        assert!(matches!(front, ClientEvent::ResponseCancel));
    }

    #[test]
    fn test_build_session_config() {
        let config = UpstreamConfig {
            voice: "sage".to_string(),
            instructions: Some("Answer briefly.".to_string()),
            context: Some("Hours: 9-5.".to_string()),
            input_encoding: AudioEncoding::G711Ulaw,
            output_encoding: AudioEncoding::G711Ulaw,
            temperature: Some(0.7),
            ..test_config()
        };
        let session = build_session_config(&config);
        assert_eq!(session.voice.as_deref(), Some("sage"));
        assert_eq!(session.input_audio_format.as_deref(), Some("g711_ulaw"));
        assert!(session.instructions.unwrap().contains("Hours: 9-5."));
        assert!(matches!(
            session.turn_detection,
            Some(TurnDetection::ServerVad { .. })
        ));

        let manual = UpstreamConfig {
            turn_detection: TurnDetectionMode::Manual,
            ..test_config()
        };
        assert!(matches!(
            build_session_config(&manual).turn_detection,
            Some(TurnDetection::None {})
        ));
    }

    #[test]
    fn test_map_audio_delta() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"response.audio.delta","response_id":"turn-1","delta":"AAEC"}"#,
        )
        .unwrap();
        match map_server_event(event) {
            Some(UpstreamEvent::AudioDelta { turn_id, payload }) => {
                assert_eq!(turn_id, "turn-1");
                assert_eq!(&payload[..], &[0, 1, 2]);
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn test_map_cancelled_turn() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"response.done","response":{"id":"turn-5","status":"cancelled"}}"#,
        )
        .unwrap();
        match map_server_event(event) {
            Some(UpstreamEvent::TurnComplete { turn_id, status }) => {
                assert_eq!(turn_id, "turn-5");
                assert_eq!(status, TurnStatus::Cancelled);
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn test_map_error_severity() {
        let recoverable: ServerEvent = serde_json::from_str(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"no response"}}"#,
        )
        .unwrap();
        match map_server_event(recoverable) {
            Some(UpstreamEvent::Error { fatal, .. }) => assert!(!fatal),
            other => panic!("unexpected mapping: {other:?}"),
        }

        let fatal: ServerEvent = serde_json::from_str(
            r#"{"type":"error","error":{"type":"server_error","message":"boom"}}"#,
        )
        .unwrap();
        match map_server_event(fatal) {
            Some(UpstreamEvent::Error { fatal, .. }) => assert!(fatal),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn test_classify_handshake_error() {
        let unauthorized = tungstenite::Error::Http(
            Box::new(http::Response::builder().status(401).body(None).unwrap()),
        );
        assert!(matches!(
            classify_handshake_error(unauthorized),
            ConnectError::AuthRejected(_)
        ));

        let not_found = tungstenite::Error::Http(
            Box::new(http::Response::builder().status(404).body(None).unwrap()),
        );
        assert!(matches!(
            classify_handshake_error(not_found),
            ConnectError::ProtocolMismatch(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_exhausts_attempts() {
        let config = UpstreamConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                initial_delay_ms: 5,
                jitter: false,
                ..Default::default()
            },
            ..test_config()
        };
        let mut client = UpstreamClient::new(config);
        match client.connect().await {
            Err(ConnectError::Exhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_connect() {
        let mut client = UpstreamClient::new(test_config());
        client.close().await;
        assert!(matches!(
            client.connect().await,
            Err(ConnectError::Cancelled)
        ));
    }
}
