//! # Speech-to-Text Client
//!
//! HTTP client for the remote transcription backend. Every call carries a
//! bounded timeout, and a failed call is classified as timeout, transport,
//! or provider rejection before the retry discipline decides what to do:
//! transport failures get exactly one retry after a fixed backoff, everything
//! else surfaces immediately.

use crate::audio::AudioWindow;
use crate::config::TranscriptionBackendConfig;
use crate::error::{RemoteCallFailure, TranscriptionError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of transcribing one audio window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    /// The transcribed text
    pub text: String,

    /// Whether this is a final result for the window (always true for the
    /// HTTP backend, which has no incremental mode)
    pub is_final: bool,

    /// Confidence score (0.0 to 1.0) when the provider reports one
    pub confidence: Option<f32>,

    /// Language the provider detected, if reported
    pub language_detected: Option<String>,
}

/// Abstraction over the speech-to-text backend.
///
/// Sessions depend on this trait rather than the HTTP client so tests can
/// script provider behavior (slow calls, transport faults, canned text).
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one window. Implementations must bound their own latency;
    /// callers rely on this returning within the configured timeout plus at
    /// most one retry.
    async fn transcribe(
        &self,
        window: &AudioWindow,
        language_hint: Option<&str>,
    ) -> Result<TranscriptionResult, TranscriptionError>;
}

/// Response body of the transcription endpoint.
#[derive(Debug, Deserialize)]
struct BackendResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    language: Option<String>,
}

/// Speech-to-text over an OpenAI-compatible `/audio/transcriptions` endpoint.
pub struct HttpTranscriptionClient {
    client: reqwest::Client,
    config: TranscriptionBackendConfig,
}

impl HttpTranscriptionClient {
    pub fn new(config: TranscriptionBackendConfig) -> Self {
        Self {
            // Per-request timeout is applied at call time so the window's
            // deadline covers connect plus body.
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn call_once(
        &self,
        window: &AudioWindow,
        language_hint: Option<&str>,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let part = reqwest::multipart::Part::bytes(window.payload.clone())
            .file_name(format!("{}-{}.pcm", window.session_id, window.start_sequence))
            .mime_str("application/octet-stream")
            .map_err(|e| TranscriptionError::new(RemoteCallFailure::Transport, e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());
        if let Some(language) = language_hint {
            form = form.text("language", language.to_string());
        }

        let mut request = self
            .client
            .post(&self.config.endpoint_url)
            .timeout(self.config.timeout())
            .multipart(form);

        if let Some(key) = self.resolve_api_key() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::new(
                RemoteCallFailure::ProviderRejected,
                format!("backend returned {}: {}", status, truncate(&body, 200)),
            ));
        }

        let parsed: BackendResponse = response.json().await.map_err(classify_reqwest_error)?;

        Ok(TranscriptionResult {
            text: parsed.text,
            is_final: true,
            confidence: parsed.confidence,
            language_detected: parsed.language,
        })
    }

    fn resolve_api_key(&self) -> Option<String> {
        self.config
            .api_key
            .clone()
            .or_else(|| std::env::var("STT_API_KEY").ok())
    }
}

#[async_trait]
impl SpeechToText for HttpTranscriptionClient {
    async fn transcribe(
        &self,
        window: &AudioWindow,
        language_hint: Option<&str>,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        with_transport_retry(self.config.retry_backoff(), || {
            self.call_once(window, language_hint)
        })
        .await
    }
}

/// Run `call`, retrying exactly once after `backoff` if (and only if) the
/// first attempt failed at the transport layer. Timeouts and provider
/// rejections never retry: a timed-out window is already stale, and a
/// rejection will reject again.
pub async fn with_transport_retry<T, F, Fut>(
    backoff: Duration,
    mut call: F,
) -> Result<T, TranscriptionError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TranscriptionError>>,
{
    match call().await {
        Ok(result) => Ok(result),
        Err(err) if err.kind == RemoteCallFailure::Transport => {
            warn!(error = %err, "Transcription transport failure, retrying once");
            tokio::time::sleep(backoff).await;
            call().await
        }
        Err(err) => {
            debug!(kind = err.kind.as_str(), "Transcription call failed without retry");
            Err(err)
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TranscriptionError {
    if err.is_timeout() {
        TranscriptionError::new(RemoteCallFailure::Timeout, err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        TranscriptionError::new(RemoteCallFailure::Transport, err.to_string())
    } else if err.is_decode() {
        TranscriptionError::new(
            RemoteCallFailure::ProviderRejected,
            format!("unparseable backend response: {}", err),
        )
    } else {
        TranscriptionError::new(RemoteCallFailure::Transport, err.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
