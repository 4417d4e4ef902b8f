//! Assistant backend access
//!
//! [`DispatchClient`] turns a transcript into a single-message chat request
//! and returns the reply text. The transport sits behind [`Backend`] so the
//! engine can be driven without a live server.

mod http;
mod identity;

pub use http::HttpBackend;
pub use identity::{IdentityFile, IdentityStore};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::AudioBlob;

/// User id sent when the identity store has none
pub const DEFAULT_USER_ID: &str = "default";

/// Reply spoken when the backend omits one
pub const DEFAULT_REPLY: &str = "Okay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// A conversation consisting of one user message
    pub fn single(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: content.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub response: Option<String>,
    /// Older backends answer with `reply`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

impl ChatResponse {
    /// The reply text, falling back to [`DEFAULT_REPLY`]
    pub fn into_reply(self) -> String {
        self.response
            .or(self.reply)
            .unwrap_or_else(|| DEFAULT_REPLY.to_string())
    }
}

/// Errors talking to the backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed backend response: {0}")]
    Decode(String),
}

/// Chat and transcription endpoints of the assistant backend
#[async_trait]
pub trait Backend: Send + Sync {
    async fn chat(
        &self,
        request: &ChatRequest,
        bearer: Option<&str>,
    ) -> Result<ChatResponse, BackendError>;

    /// Upload recorded audio and return the raw transcript
    async fn transcribe(&self, blob: &AudioBlob) -> Result<String, BackendError>;
}

/// Sends transcripts to the chat endpoint with the caller's identity
#[derive(Clone)]
pub struct DispatchClient {
    backend: Arc<dyn Backend>,
    identity: Arc<dyn IdentityStore>,
}

impl DispatchClient {
    pub fn new(backend: Arc<dyn Backend>, identity: Arc<dyn IdentityStore>) -> Self {
        Self { backend, identity }
    }

    /// Dispatch one transcript and return the reply to speak
    pub async fn send(&self, transcript: &str) -> Result<String, BackendError> {
        let token = self.identity.bearer_token();
        let user_id = self
            .identity
            .user_id()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_ID.to_string());

        let request = ChatRequest::single(user_id, transcript);
        debug!(
            user_id = %request.user_id,
            authenticated = token.is_some(),
            "dispatching transcript"
        );

        let response = self.backend.chat(&request, token.as_deref()).await?;
        let reply = response.into_reply();
        info!(chars = reply.len(), "backend replied");
        Ok(reply)
    }

    /// Transcribe audio through the backend
    pub async fn transcribe(&self, blob: &AudioBlob) -> Result<String, BackendError> {
        self.backend.transcribe(blob).await
    }
}
