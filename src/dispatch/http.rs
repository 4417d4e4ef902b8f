//! HTTP transport for the assistant backend

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use tracing::debug;

use super::{Backend, BackendError, ChatRequest, ChatResponse};
use crate::capture::AudioBlob;

const CHAT_PATH: &str = "/api/ai/chat";
const TRANSCRIBE_PATH: &str = "/api/voice";

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// `reqwest` client bound to one backend base URL
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map a non-success response to [`BackendError::Status`]
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status { status, body })
}

fn transport(e: reqwest::Error) -> BackendError {
    BackendError::Transport(e.to_string())
}

#[async_trait]
impl Backend for HttpBackend {
    async fn chat(
        &self,
        request: &ChatRequest,
        bearer: Option<&str>,
    ) -> Result<ChatResponse, BackendError> {
        let mut req = self.client.post(self.url(CHAT_PATH)).json(request);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        let resp = check_status(req.send().await.map_err(transport)?).await?;
        resp.json::<ChatResponse>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn transcribe(&self, blob: &AudioBlob) -> Result<String, BackendError> {
        debug!(bytes = blob.len(), mime = %blob.mime, "uploading audio for transcription");

        let part = multipart::Part::bytes(blob.bytes.clone())
            .file_name(blob.file_name())
            .mime_str(&blob.mime)
            .map_err(transport)?;
        let form = multipart::Form::new().part("audio", part);

        let resp = self
            .client
            .post(self.url(TRANSCRIBE_PATH))
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;

        let resp = check_status(resp).await?;
        let body: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(body.text)
    }
}
