//! Fallback path selection and the turn-based pipeline.
//!
//! Every call gets exactly one path decision, made at call start: the
//! streaming bridge when it can be established, otherwise the turn-based
//! request/response pipeline. A call that has switched to the turn-based
//! path never switches back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::core::session::CallSession;

/// Spoken to the caller when both paths are unavailable; the call-control
/// layer plays this and hangs up cleanly instead of leaving the call hanging.
pub const FAILURE_APOLOGY: &str =
    "I'm sorry, our assistant is temporarily unavailable. Please try calling back in a moment.";

/// Which conversational path serves a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathUsed {
    /// Realtime streaming bridge
    Streaming,
    /// Turn-based request/response pipeline
    #[serde(rename = "turn_based")]
    TurnBased,
}

impl std::fmt::Display for PathUsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::TurnBased => write!(f, "turn_based"),
        }
    }
}

/// Call identity handed to the turn pipeline for context.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Telephony call id
    pub call_id: String,
    /// Caller number, when the telephony peer shares it
    pub caller: Option<String>,
}

/// Errors from the turn-based pipeline.
#[derive(Debug, Error)]
pub enum FallbackError {
    /// HTTP transport failure
    #[error("pipeline request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The pipeline answered with an unusable body
    #[error("pipeline error: {0}")]
    Api(String),

    /// The turn-based pipeline is disabled by configuration
    #[error("turn-based pipeline disabled")]
    Disabled,
}

// =============================================================================
// Turn Pipeline
// =============================================================================

/// The non-streaming conversational path: one utterance in, one response out.
#[async_trait]
pub trait TurnPipeline: Send + Sync {
    /// Answer a single caller utterance.
    async fn answer(&self, utterance: &str, ctx: &CallContext) -> Result<String, FallbackError>;
}

/// Turn pipeline backed by a chat-completions HTTP endpoint.
pub struct ChatTurnPipeline {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    system_prompt: String,
}

impl ChatTurnPipeline {
    /// Create a pipeline against `endpoint` (base URL without the
    /// `/chat/completions` suffix).
    pub fn new(endpoint: String, api_key: String, model: String, system_prompt: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
            system_prompt,
        }
    }
}

#[async_trait]
impl TurnPipeline for ChatTurnPipeline {
    async fn answer(&self, utterance: &str, ctx: &CallContext) -> Result<String, FallbackError> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": self.system_prompt},
                {"role": "user", "content": utterance},
            ],
            "max_tokens": 150,
            "temperature": 0.7,
        });

        tracing::info!(call_id = %ctx.call_id, "answering via turn-based pipeline");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FallbackError::Api(format!(
                "pipeline returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response.json().await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FallbackError::Api("no content in pipeline response".to_string()))
    }
}

// =============================================================================
// Fallback Controller
// =============================================================================

/// Per-call path decision and turn-based handoff.
pub struct FallbackController {
    bridge_enabled: bool,
    fallback_enabled: bool,
    grace: Duration,
    pipeline: Arc<dyn TurnPipeline>,
}

/// Handle returned from [`FallbackController::start_call`].
pub struct CallHandle {
    session: Arc<CallSession>,
}

impl CallHandle {
    /// The session behind this call.
    pub fn session(&self) -> &Arc<CallSession> {
        &self.session
    }

    /// The path currently serving the call. Only ever changes in the
    /// bridge-to-fallback direction, inside the start grace window.
    pub fn path(&self) -> PathUsed {
        self.session.path()
    }
}

impl FallbackController {
    /// Build a controller.
    pub fn new(
        bridge_enabled: bool,
        fallback_enabled: bool,
        grace: Duration,
        pipeline: Arc<dyn TurnPipeline>,
    ) -> Self {
        Self {
            bridge_enabled,
            fallback_enabled,
            grace,
            pipeline,
        }
    }

    /// Decide the path for a new call and, when the bridge is enabled,
    /// attempt to establish it. Connect failure - or the session failing
    /// within the grace window right after - hands the call to the
    /// turn-based path for the remainder of the call.
    pub async fn start_call(&self, session: Arc<CallSession>) -> CallHandle {
        if !self.bridge_enabled {
            tracing::info!(
                session_id = %session.session_id(),
                "streaming bridge disabled, using turn-based path"
            );
            session.mark_turn_based();
            return CallHandle { session };
        }

        match session.connect().await {
            Ok(()) => {
                // Watch for an immediate post-connect failure; a bridge that
                // dies inside the grace window degrades to the turn-based
                // path instead of ending the call.
                let watched = Arc::clone(&session);
                let grace = self.grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if watched.state() == crate::core::session::ConnectionState::Failed
                        && watched.path() == PathUsed::Streaming
                    {
                        tracing::warn!(
                            session_id = %watched.session_id(),
                            "bridge failed within grace window, turn-based path engaged"
                        );
                        watched.mark_turn_based();
                    }
                });
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.session_id(),
                    error = %e,
                    "streaming bridge unavailable, using turn-based path"
                );
                session.mark_turn_based();
            }
        }

        CallHandle { session }
    }

    /// Answer one utterance on the turn-based path.
    pub async fn answer(
        &self,
        utterance: &str,
        ctx: &CallContext,
    ) -> Result<String, FallbackError> {
        if !self.fallback_enabled {
            return Err(FallbackError::Disabled);
        }
        self.pipeline.answer(utterance, ctx).await
    }

    /// Whether the turn-based pipeline is available at all.
    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::{AudioEncoding, FrameCodec};
    use crate::core::session::{ConnectionState, SessionOptions};
    use crate::core::upstream::{RetryPolicy, UpstreamClient, UpstreamConfig};
    use tokio::sync::mpsc;

    struct CannedPipeline;

    #[async_trait]
    impl TurnPipeline for CannedPipeline {
        async fn answer(&self, utterance: &str, _ctx: &CallContext) -> Result<String, FallbackError> {
            Ok(format!("echo: {utterance}"))
        }
    }

    fn unreachable_session() -> Arc<CallSession> {
        let (tx, _rx) = mpsc::channel(16);
        let config = UpstreamConfig {
            // Nothing listens on port 1; connect fails fast
            endpoint: "ws://127.0.0.1:1".to_string(),
            api_key: "test".to_string(),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_delay_ms: 5,
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        CallSession::new(
            "stream-f".to_string(),
            "call-f".to_string(),
            UpstreamClient::new(config),
            FrameCodec::new(AudioEncoding::G711Ulaw),
            SessionOptions::default(),
            tx,
        )
    }

    fn controller(bridge_enabled: bool, fallback_enabled: bool) -> FallbackController {
        FallbackController::new(
            bridge_enabled,
            fallback_enabled,
            Duration::from_millis(50),
            Arc::new(CannedPipeline),
        )
    }

    #[tokio::test]
    async fn test_bridge_disabled_uses_turn_based_path() {
        let handle = controller(false, true).start_call(unreachable_session()).await;
        assert_eq!(handle.path(), PathUsed::TurnBased);
        // No connect was attempted
        assert_eq!(handle.session().state(), ConnectionState::Created);
    }

    #[tokio::test]
    async fn test_connect_failure_switches_to_turn_based() {
        let handle = controller(true, true).start_call(unreachable_session()).await;
        assert_eq!(handle.path(), PathUsed::TurnBased);
        assert_eq!(handle.session().state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_no_flapping_back_after_fallback() {
        let handle = controller(true, true).start_call(unreachable_session()).await;
        assert_eq!(handle.path(), PathUsed::TurnBased);

        // Nothing that happens later moves the call back to streaming
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handle.path(), PathUsed::TurnBased);
    }

    #[tokio::test]
    async fn test_answer_on_turn_based_path() {
        let ctrl = controller(false, true);
        let ctx = CallContext {
            call_id: "call-f".to_string(),
            caller: None,
        };
        let answer = ctrl.answer("what are your hours?", &ctx).await.unwrap();
        assert_eq!(answer, "echo: what are your hours?");
    }

    #[tokio::test]
    async fn test_answer_disabled() {
        let ctrl = controller(false, false);
        let ctx = CallContext::default();
        assert!(matches!(
            ctrl.answer("hello", &ctx).await,
            Err(FallbackError::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_chat_pipeline_parses_completion() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [
                    {"message": {"role": "assistant", "content": "We close at nine."}}
                ]
            })))
            .mount(&server)
            .await;

        let pipeline = ChatTurnPipeline::new(
            server.uri(),
            "test-key".to_string(),
            "test-model".to_string(),
            "You answer phones.".to_string(),
        );
        let ctx = CallContext {
            call_id: "call-1".to_string(),
            caller: None,
        };
        let answer = pipeline.answer("when do you close?", &ctx).await.unwrap();
        assert_eq!(answer, "We close at nine.");
    }

    #[tokio::test]
    async fn test_chat_pipeline_surfaces_api_errors() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let pipeline = ChatTurnPipeline::new(
            server.uri(),
            "test-key".to_string(),
            "test-model".to_string(),
            String::new(),
        );
        let result = pipeline.answer("hello", &CallContext::default()).await;
        assert!(matches!(result, Err(FallbackError::Api(_))));
    }

    #[test]
    fn test_apology_is_speakable() {
        assert!(FAILURE_APOLOGY.ends_with('.'));
        assert!(!FAILURE_APOLOGY.contains('\n'));
    }
}
