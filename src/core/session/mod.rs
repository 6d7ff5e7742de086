//! Call session coordination.
//!
//! One [`CallSession`] exists per active phone call. It exclusively owns the
//! upstream streaming client, tracks the telephony stream identity, and
//! relays audio both ways: telephony media frames are decoded, re-sequenced
//! and forwarded upstream; upstream audio deltas are encoded, tagged with
//! their AI turn and buffered toward the telephony peer. Interruptions
//! (caller speech during AI playback) cancel the in-flight turn and flush
//! its queued audio.
//!
//! Two flows run concurrently per session - the inbound forwarding flow
//! driven by telephony frame arrival, and the outbound flow driven by the
//! upstream event stream. State transitions go through a single mutex and
//! are the only synchronization point between the two.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::audio::{AudioFrame, FrameCodec};
use crate::core::upstream::{ConnectError, TurnStatus, UpstreamClient, UpstreamEvent};
use crate::fallback::PathUsed;
use crate::telephony::messages::OutboundMessage;

mod registry;
mod reorder;

pub use registry::{RegistryError, SessionRegistry};
pub use reorder::FrameReorder;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Session allocated, no upstream activity yet
    #[default]
    Created,
    /// Upstream connect in progress
    Connecting,
    /// Upstream ready, no audio forwarded yet
    Connected,
    /// Audio flowing in at least one direction
    Streaming,
    /// Caller interrupted an AI turn; cancellation pending
    Interrupted,
    /// Teardown in progress
    Closing,
    /// Terminal: clean shutdown complete
    Closed,
    /// Terminal: unrecoverable failure
    Failed,
}

impl ConnectionState {
    /// Terminal states absorb all further transition requests.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Interrupted => "interrupted",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Whether `from -> to` is a legal transition. Same-state requests are
/// handled as no-ops by the caller before this check.
fn transition_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    match to {
        Closing => !from.is_terminal() && from != Closing,
        Failed => !from.is_terminal(),
        Closed => from == Closing,
        Connecting => from == Created,
        Connected => from == Connecting,
        Streaming => matches!(from, Connected | Interrupted),
        Interrupted => from == Streaming,
        Created => false,
    }
}

// =============================================================================
// Errors & Options
// =============================================================================

/// Session-level errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A state transition outside the allowed table was requested
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: ConnectionState,
        /// Requested state
        to: ConnectionState,
    },

    /// A peer sent something outside its wire contract
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Tunable knobs for session behavior.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bounded outbound audio buffer; overflow drops the oldest frame
    pub outbound_buffer_frames: usize,
    /// Reorder window for out-of-order inbound frames
    pub stale_frame_window: u64,
    /// Self-terminate after this much inactivity
    pub idle_timeout: Duration,
    /// How often the watchdog checks for idleness
    pub idle_check_interval: Duration,
    /// How long to wait for turn-cancellation confirmation
    pub interrupt_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            outbound_buffer_frames: 200,
            stale_frame_window: 8,
            idle_timeout: Duration::from_secs(60),
            idle_check_interval: Duration::from_secs(10),
            interrupt_grace: Duration::from_secs(1),
        }
    }
}

/// Management-surface snapshot of one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Bridge-assigned session id
    pub session_id: String,
    /// Telephony stream id (registry key)
    pub telephony_stream_id: String,
    /// Current lifecycle state
    pub connection_state: ConnectionState,
    /// Upstream reconnection attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Which conversational path serves this call
    pub path_used: PathUsed,
}

/// An outbound frame awaiting transmission, tagged with its AI turn so an
/// interruption can discard exactly the superseded turn's audio.
#[derive(Debug)]
struct BufferedFrame {
    turn_id: String,
    payload: String,
}

// =============================================================================
// Call Session
// =============================================================================

/// Stateful coordinator for one phone call.
pub struct CallSession {
    session_id: String,
    telephony_stream_id: String,
    call_id: String,
    state: Mutex<ConnectionState>,
    client: tokio::sync::Mutex<UpstreamClient>,
    reconnect_attempts: Arc<AtomicU32>,
    codec: FrameCodec,
    reorder: Mutex<FrameReorder>,
    audio_buffer: Mutex<VecDeque<BufferedFrame>>,
    active_turn: Mutex<Option<String>>,
    cancelled_turn: Mutex<Option<String>>,
    out_seq: AtomicU64,
    started_at: Instant,
    last_activity: Mutex<Instant>,
    options: SessionOptions,
    path: Mutex<PathUsed>,
    cancellation: CancellationToken,
    telephony_tx: mpsc::Sender<OutboundMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallSession {
    /// Create a session for a newly announced telephony stream.
    pub fn new(
        telephony_stream_id: String,
        call_id: String,
        client: UpstreamClient,
        codec: FrameCodec,
        options: SessionOptions,
        telephony_tx: mpsc::Sender<OutboundMessage>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let reconnect_attempts = client.attempts_handle();
        Arc::new(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            telephony_stream_id,
            call_id,
            state: Mutex::new(ConnectionState::Created),
            client: tokio::sync::Mutex::new(client),
            reconnect_attempts,
            codec,
            reorder: Mutex::new(FrameReorder::new(options.stale_frame_window)),
            audio_buffer: Mutex::new(VecDeque::new()),
            active_turn: Mutex::new(None),
            cancelled_turn: Mutex::new(None),
            out_seq: AtomicU64::new(0),
            started_at: now,
            last_activity: Mutex::new(now),
            options,
            path: Mutex::new(PathUsed::Streaming),
            cancellation: CancellationToken::new(),
            telephony_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bridge-assigned session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Telephony stream id this session serves.
    pub fn telephony_stream_id(&self) -> &str {
        &self.telephony_stream_id
    }

    /// Call id reported by the telephony peer.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Which conversational path serves this call.
    pub fn path(&self) -> PathUsed {
        *self.path.lock()
    }

    /// Switch this call to the turn-based path. One-way: a call never flaps
    /// back to the streaming bridge.
    pub fn mark_turn_based(&self) {
        *self.path.lock() = PathUsed::TurnBased;
    }

    /// Management-surface snapshot.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            telephony_stream_id: self.telephony_stream_id.clone(),
            connection_state: self.state(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            path_used: self.path(),
        }
    }

    /// Establish the upstream connection and start the outbound flow.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        if self.transition(ConnectionState::Connecting).is_err() {
            return Err(ConnectError::Cancelled);
        }

        let events = {
            let mut client = self.client.lock().await;
            match client.connect().await {
                Ok(()) => client.events(),
                Err(e) => {
                    drop(client);
                    self.fail("upstream connect failed").await;
                    return Err(e);
                }
            }
        };
        let Some(events) = events else {
            self.fail("upstream event stream unavailable").await;
            return Err(ConnectError::Cancelled);
        };

        let _ = self.transition(ConnectionState::Connected);
        self.touch();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).pump_events(events)));
        tasks.push(tokio::spawn(Arc::clone(self).watchdog()));
        Ok(())
    }

    /// Inbound flow: decode a telephony media frame, re-sequence it, and
    /// forward it upstream. Per-frame failures are absorbed.
    pub async fn handle_media(&self, sequence_number: u64, timestamp_ms: u64, payload: &str) {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
        ) {
            return;
        }
        self.touch();

        let frame = match self
            .codec
            .decode_inbound(sequence_number, timestamp_ms, payload)
        {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    seq = sequence_number,
                    error = %e,
                    "dropping undecodable media frame"
                );
                return;
            }
        };

        let ready = self.reorder.lock().push(frame);
        if ready.is_empty() {
            return;
        }

        let mut forwarded = false;
        {
            let client = self.client.lock().await;
            for frame in &ready {
                match client.send_audio(&frame.payload) {
                    Ok(()) => forwarded = true,
                    Err(e) => {
                        tracing::debug!(
                            session_id = %self.session_id,
                            error = %e,
                            "dropping inbound frame, upstream unavailable"
                        );
                    }
                }
            }
        }

        if forwarded && self.state() == ConnectionState::Connected {
            let _ = self.transition(ConnectionState::Streaming);
            tracing::info!(session_id = %self.session_id, "audio streaming started");
        }
    }

    /// Telephony mark events have no upstream equivalent; acknowledge and
    /// move on.
    pub fn handle_mark(&self, name: &str) {
        self.touch();
        tracing::debug!(session_id = %self.session_id, mark = name, "telephony mark received");
    }

    /// Inject supplemental grounding context into the live conversation.
    pub async fn inject_context(&self, text: &str) {
        if let Err(e) = self.client.lock().await.inject_context(text) {
            tracing::warn!(session_id = %self.session_id, error = %e, "context injection failed");
        }
    }

    /// Graceful teardown: any non-terminal state moves through `Closing` to
    /// `Closed`. Idempotent; cancels in-flight connects and backoff timers.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = ConnectionState::Closing;
        }
        tracing::info!(session_id = %self.session_id, "session closing");

        // Flush what the route channel will take, discard the rest
        self.drain_outbound();
        self.audio_buffer.lock().clear();

        self.cancellation.cancel();
        self.client.lock().await.close().await;

        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closing {
                *state = ConnectionState::Closed;
            }
        }
        tracing::info!(session_id = %self.session_id, "session closed");
    }

    /// Unrecoverable failure: move to `Failed` and release the upstream
    /// connection. Terminal, never retried.
    pub async fn fail(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = ConnectionState::Failed;
        }
        tracing::error!(session_id = %self.session_id, reason, "session failed");
        self.cancellation.cancel();
        self.client.lock().await.close().await;
    }

    // -------------------------------------------------------------------------
    // Outbound flow
    // -------------------------------------------------------------------------

    /// Consume the upstream event sequence until it ends or the session is
    /// torn down.
    async fn pump_events(self: Arc<Self>, mut events: mpsc::Receiver<UpstreamEvent>) {
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        loop {
            let event = tokio::select! {
                _ = self.cancellation.cancelled() => break,
                _ = tokio::time::sleep_until(
                    grace_deadline.unwrap_or_else(tokio::time::Instant::now)
                ), if grace_deadline.is_some() => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        "no cancellation confirmation within grace period, resuming"
                    );
                    self.finish_interruption();
                    grace_deadline = None;
                    continue;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                self.handle_upstream_closed().await;
                break;
            };

            match event {
                UpstreamEvent::Ready { session_id } => {
                    self.touch();
                    tracing::debug!(
                        session_id = %self.session_id,
                        upstream_session = %session_id,
                        "speech peer session ready"
                    );
                }
                UpstreamEvent::AudioDelta { turn_id, payload } => {
                    self.touch();
                    self.handle_audio_delta(turn_id, payload);
                }
                UpstreamEvent::SpeechStarted { .. } => {
                    self.touch();
                    if self.begin_interruption().await {
                        grace_deadline =
                            Some(tokio::time::Instant::now() + self.options.interrupt_grace);
                    }
                }
                UpstreamEvent::SpeechStopped { .. } => {
                    self.touch();
                    // No-op under peer-side VAD; commits the turn otherwise
                    let _ = self.client.lock().await.commit_turn();
                }
                UpstreamEvent::TurnComplete { turn_id, status } => {
                    self.touch();
                    if self.handle_turn_complete(&turn_id, status) {
                        grace_deadline = None;
                    }
                }
                UpstreamEvent::Transcript { role, text } => {
                    tracing::info!(
                        session_id = %self.session_id,
                        role = ?role,
                        %text,
                        "transcript"
                    );
                }
                UpstreamEvent::Error { message, fatal } => {
                    if fatal {
                        self.fail(&message).await;
                        break;
                    }
                    tracing::warn!(session_id = %self.session_id, %message, "speech peer error");
                }
                UpstreamEvent::Closed => {
                    self.handle_upstream_closed().await;
                    break;
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "outbound event pump ended");
    }

    /// Encode an AI audio chunk, buffer it toward the telephony peer, and
    /// drain the buffer in arrival order.
    fn handle_audio_delta(&self, turn_id: String, payload: Bytes) {
        if self.cancelled_turn.lock().as_deref() == Some(turn_id.as_str()) {
            tracing::debug!(
                session_id = %self.session_id,
                %turn_id,
                "discarding audio from cancelled turn"
            );
            return;
        }

        {
            let mut active = self.active_turn.lock();
            if active.as_deref() != Some(turn_id.as_str()) {
                tracing::debug!(session_id = %self.session_id, %turn_id, "AI turn started");
                *active = Some(turn_id.clone());
            }
        }

        let seq = self.out_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let timestamp_ms = self.started_at.elapsed().as_millis() as u64;
        let frame = AudioFrame::outbound(seq, timestamp_ms, payload);
        let encoded = self.codec.encode_outbound(&frame);

        {
            let mut buffer = self.audio_buffer.lock();
            if buffer.len() >= self.options.outbound_buffer_frames {
                buffer.pop_front();
                tracing::warn!(
                    session_id = %self.session_id,
                    "outbound buffer full, dropping oldest frame"
                );
            }
            buffer.push_back(BufferedFrame {
                turn_id,
                payload: encoded,
            });
        }

        self.drain_outbound();
    }

    /// Forward buffered frames to the telephony route channel without
    /// blocking; what the channel will not take stays buffered.
    fn drain_outbound(&self) {
        let mut buffer = self.audio_buffer.lock();
        loop {
            let Some(front) = buffer.front() else { break };
            let message =
                OutboundMessage::media(&self.telephony_stream_id, front.payload.clone());
            match self.telephony_tx.try_send(message) {
                Ok(()) => {
                    buffer.pop_front();
                }
                Err(mpsc::error::TrySendError::Full(_)) => break,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    buffer.clear();
                    break;
                }
            }
        }
    }

    /// Handle caller speech during AI playback. Returns true when an
    /// interruption actually began (an AI turn was active while streaming).
    async fn begin_interruption(&self) -> bool {
        let Some(turn) = self.active_turn.lock().take() else {
            tracing::debug!(
                session_id = %self.session_id,
                "caller speech with no active AI turn"
            );
            return false;
        };
        if self
            .transition(ConnectionState::Interrupted)
            .is_err()
        {
            // Not streaming (connecting, closing, ...) - nothing to cancel
            *self.active_turn.lock() = Some(turn);
            return false;
        }
        *self.cancelled_turn.lock() = Some(turn.clone());

        tracing::info!(
            session_id = %self.session_id,
            turn_id = %turn,
            "caller interruption, cancelling AI turn"
        );

        // Discard buffered audio belonging to the superseded turn only
        {
            let mut buffer = self.audio_buffer.lock();
            let before = buffer.len();
            buffer.retain(|f| f.turn_id != turn);
            let discarded = before - buffer.len();
            if discarded > 0 {
                tracing::debug!(
                    session_id = %self.session_id,
                    discarded,
                    "discarded buffered frames from cancelled turn"
                );
            }
        }

        // Exactly once per interruption: guarded by active_turn.take() above
        if let Err(e) = self.client.lock().await.cancel_response() {
            tracing::warn!(session_id = %self.session_id, error = %e, "cancel request failed");
        }

        // Tell the telephony peer to flush queued playback
        if self
            .telephony_tx
            .try_send(OutboundMessage::clear(&self.telephony_stream_id))
            .is_err()
        {
            tracing::warn!(session_id = %self.session_id, "could not deliver playback clear");
        }
        true
    }

    /// Resume streaming after a confirmed or timed-out cancellation.
    fn finish_interruption(&self) {
        *self.cancelled_turn.lock() = None;
        if self.transition(ConnectionState::Streaming).is_ok() {
            tracing::debug!(session_id = %self.session_id, "resumed streaming after interruption");
        }
    }

    /// Returns true when this completion confirmed a pending cancellation.
    fn handle_turn_complete(&self, turn_id: &str, status: TurnStatus) -> bool {
        {
            let mut active = self.active_turn.lock();
            if active.as_deref() == Some(turn_id) {
                *active = None;
            }
        }

        let confirmed_cancel = {
            let mut cancelled = self.cancelled_turn.lock();
            if cancelled.as_deref() == Some(turn_id) {
                *cancelled = None;
                true
            } else {
                false
            }
        };

        if confirmed_cancel {
            tracing::debug!(
                session_id = %self.session_id,
                %turn_id,
                "peer confirmed turn cancellation"
            );
            if self.transition(ConnectionState::Streaming).is_ok() {
                tracing::debug!(
                    session_id = %self.session_id,
                    "resumed streaming after interruption"
                );
            }
            return true;
        }

        tracing::debug!(session_id = %self.session_id, %turn_id, ?status, "AI turn complete");
        false
    }

    async fn handle_upstream_closed(&self) {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        self.fail("upstream connection closed").await;
    }

    // -------------------------------------------------------------------------
    // Idle watchdog
    // -------------------------------------------------------------------------

    /// Periodic idle check; a peer that silently stops signaling must not
    /// leak the session forever.
    async fn watchdog(self: Arc<Self>) {
        let period = self.options.idle_check_interval.max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                _ = interval.tick() => {
                    self.drain_outbound();
                    let idle = self.last_activity.lock().elapsed();
                    if idle > self.options.idle_timeout {
                        if !self.state().is_terminal() {
                            tracing::warn!(
                                session_id = %self.session_id,
                                idle_secs = idle.as_secs(),
                                "idle timeout, closing session"
                            );
                            self.shutdown().await;
                        }
                        break;
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn transition(&self, to: ConnectionState) -> Result<ConnectionState, SessionError> {
        let mut state = self.state.lock();
        let from = *state;
        if from == to {
            return Ok(from);
        }
        if !transition_allowed(from, to) {
            return Err(SessionError::InvalidTransition { from, to });
        }
        *state = to;
        tracing::debug!(session_id = %self.session_id, %from, %to, "session state transition");
        Ok(from)
    }
}

// =============================================================================
// Tests
// =============================================================================
