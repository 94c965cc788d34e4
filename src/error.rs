//! # Error Handling
//!
//! Defines the gateway error taxonomy and how each error crosses the two
//! boundaries of the system: the REST boundary (HTTP status codes) and the
//! WebSocket boundary (typed `error` frames with a stable `kind` and a
//! `retryable` flag).
//!
//! ## Error Categories:
//! - **Session-local**: `ConfigMismatch`, `BufferOverflow` — reported on that
//!   session's channel only, other sessions are unaffected
//! - **Remote-call**: `Transcription`, `CircuitOpen`, `AllProvidersExhausted`,
//!   `PartialStreamAborted` — per-request failures that also feed the shared
//!   circuit breaker state
//! - **Boundary**: `CapacityExceeded`, `SessionNotFound`, `InvalidFrame` —
//!   rejected before any session state is touched
//!
//! No error in this module is process-fatal; a provider outage degrades
//! transcription/synthesis without terminating the gateway or other sessions.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Classification of a failed remote provider call.
///
/// Shared by the transcription client and the synthesis providers so the
/// retry and circuit-breaker logic can be written once against one taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCallFailure {
    /// The call exceeded its bounded timeout.
    Timeout,
    /// The call could not reach the provider (connect/reset/DNS failures).
    Transport,
    /// The provider answered but rejected the request.
    ProviderRejected,
}

impl RemoteCallFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteCallFailure::Timeout => "timeout",
            RemoteCallFailure::Transport => "transport",
            RemoteCallFailure::ProviderRejected => "provider_rejected",
        }
    }
}

/// A failed speech-to-text call.
#[derive(Debug, Clone)]
pub struct TranscriptionError {
    pub kind: RemoteCallFailure,
    pub message: String,
}

impl TranscriptionError {
    pub fn new(kind: RemoteCallFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the client may usefully re-send the same window.
    ///
    /// Timeout and transport failures are transient; a provider rejection is
    /// assumed to fail again for the same payload.
    pub fn retryable(&self) -> bool {
        !matches!(self.kind, RemoteCallFailure::ProviderRejected)
    }
}

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transcription {}: {}", self.kind.as_str(), self.message)
    }
}

/// A failed call to one speech-synthesis provider.
///
/// `client_error` marks rejections caused by the request itself (HTTP 4xx);
/// the default breaker classifier does not count those as provider failures.
#[derive(Debug, Clone)]
pub struct SynthesisCallError {
    pub kind: RemoteCallFailure,
    pub provider: String,
    pub message: String,
    pub client_error: bool,
}

impl SynthesisCallError {
    pub fn new(
        kind: RemoteCallFailure,
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
            client_error: false,
        }
    }

    pub fn rejected_by_client_fault(
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: RemoteCallFailure::ProviderRejected,
            provider: provider.into(),
            message: message.into(),
            client_error: true,
        }
    }
}

impl fmt::Display for SynthesisCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "synthesis provider '{}' {}: {}",
            self.provider,
            self.kind.as_str(),
            self.message
        )
    }
}

/// Top-level gateway error taxonomy.
///
/// Every variant maps to a stable wire `kind` (see [`GatewayError::kind`])
/// and a `retryable` flag so clients can decide between re-sending and
/// surfacing a permanent failure.
#[derive(Debug)]
pub enum GatewayError {
    /// Declared sample format does not match the actual payload (or the
    /// session's configured format). Never silently coerced.
    ConfigMismatch(String),

    /// The buffer exceeded the hard window ceiling without becoming ready.
    /// The oversized audio is force-flushed, never silently dropped.
    BufferOverflow { buffered_ms: u32 },

    /// A speech-to-text call failed after the retry discipline ran its course.
    Transcription(TranscriptionError),

    /// A provider's circuit breaker rejected the call without any remote
    /// attempt.
    CircuitOpen { provider: String },

    /// Every provider in the synthesis chain was skipped or failed.
    AllProvidersExhausted { attempted: usize },

    /// A synthesis provider failed after emitting some audio; the client may
    /// have received partial output before the fallback provider starts.
    PartialStreamAborted { provider: String },

    /// Session creation rejected: the concurrent-session limit is reached.
    CapacityExceeded { limit: usize },

    /// No active session with the given id.
    SessionNotFound(String),

    /// A protocol frame that cannot be processed (bad JSON, audio before
    /// configuration, invalid control arguments).
    InvalidFrame(String),

    /// Unexpected internal failure.
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable error kind carried on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ConfigMismatch(_) => "config_mismatch",
            GatewayError::BufferOverflow { .. } => "buffer_overflow",
            GatewayError::Transcription(err) => match err.kind {
                RemoteCallFailure::Timeout => "transcription_timeout",
                RemoteCallFailure::Transport => "transcription_transport",
                RemoteCallFailure::ProviderRejected => "transcription_provider_rejected",
            },
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::AllProvidersExhausted { .. } => "all_providers_exhausted",
            GatewayError::PartialStreamAborted { .. } => "partial_stream_aborted",
            GatewayError::CapacityExceeded { .. } => "capacity_exceeded",
            GatewayError::SessionNotFound(_) => "session_not_found",
            GatewayError::InvalidFrame(_) => "invalid_frame",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Whether the client can expect the same request to succeed later.
    pub fn retryable(&self) -> bool {
        match self {
            GatewayError::ConfigMismatch(_) => false,
            GatewayError::BufferOverflow { .. } => false,
            GatewayError::Transcription(err) => err.retryable(),
            GatewayError::CircuitOpen { .. } => true,
            GatewayError::AllProvidersExhausted { .. } => true,
            GatewayError::PartialStreamAborted { .. } => true,
            GatewayError::CapacityExceeded { .. } => true,
            GatewayError::SessionNotFound(_) => false,
            GatewayError::InvalidFrame(_) => false,
            GatewayError::Internal(_) => false,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::ConfigMismatch(msg) => write!(f, "Audio format mismatch: {}", msg),
            GatewayError::BufferOverflow { buffered_ms } => write!(
                f,
                "Audio buffer exceeded hard window ceiling with {}ms buffered",
                buffered_ms
            ),
            GatewayError::Transcription(err) => write!(f, "{}", err),
            GatewayError::CircuitOpen { provider } => {
                write!(f, "Circuit breaker open for provider '{}'", provider)
            }
            GatewayError::AllProvidersExhausted { attempted } => {
                write!(f, "All {} synthesis providers skipped or failed", attempted)
            }
            GatewayError::PartialStreamAborted { provider } => write!(
                f,
                "Provider '{}' aborted mid-stream, partial audio may have been emitted",
                provider
            ),
            GatewayError::CapacityExceeded { limit } => {
                write!(f, "Maximum concurrent sessions ({}) reached", limit)
            }
            GatewayError::SessionNotFound(id) => write!(f, "Session '{}' not found", id),
            GatewayError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            GatewayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Converts gateway errors into HTTP responses at the REST boundary.
///
/// ## Status Code Mapping:
/// - CapacityExceeded → 503 (Service Unavailable)
/// - SessionNotFound → 404 (Not Found)
/// - ConfigMismatch / InvalidFrame → 400 (Bad Request)
/// - Remote-call failures → 502 (Bad Gateway)
/// - Everything else → 500 (Internal Server Error)
impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let status = match self {
            GatewayError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ConfigMismatch(_) | GatewayError::InvalidFrame(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Transcription(_)
            | GatewayError::CircuitOpen { .. }
            | GatewayError::AllProvidersExhausted { .. }
            | GatewayError::PartialStreamAborted { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BufferOverflow { .. } | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "retryable": self.retryable(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidFrame(format!("JSON parsing error: {}", err))
    }
}

impl From<TranscriptionError> for GatewayError {
    fn from(err: TranscriptionError) -> Self {
        GatewayError::Transcription(err)
    }
}

/// Shorthand for Results carrying the gateway error type.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(
            GatewayError::ConfigMismatch("x".into()).kind(),
            "config_mismatch"
        );
        assert_eq!(
            GatewayError::BufferOverflow { buffered_ms: 12000 }.kind(),
            "buffer_overflow"
        );
        assert_eq!(
            GatewayError::CircuitOpen { provider: "p".into() }.kind(),
            "circuit_open"
        );
        assert_eq!(
            GatewayError::AllProvidersExhausted { attempted: 3 }.kind(),
            "all_providers_exhausted"
        );
        assert_eq!(
            GatewayError::PartialStreamAborted { provider: "p".into() }.kind(),
            "partial_stream_aborted"
        );
        assert_eq!(
            GatewayError::CapacityExceeded { limit: 8 }.kind(),
            "capacity_exceeded"
        );
        assert_eq!(
            GatewayError::SessionNotFound("s".into()).kind(),
            "session_not_found"
        );
    }

    #[test]
    fn test_transcription_kinds_map_to_distinct_wire_kinds() {
        let timeout = GatewayError::Transcription(TranscriptionError::new(
            RemoteCallFailure::Timeout,
            "deadline",
        ));
        let transport = GatewayError::Transcription(TranscriptionError::new(
            RemoteCallFailure::Transport,
            "reset",
        ));
        let rejected = GatewayError::Transcription(TranscriptionError::new(
            RemoteCallFailure::ProviderRejected,
            "422",
        ));

        assert_eq!(timeout.kind(), "transcription_timeout");
        assert_eq!(transport.kind(), "transcription_transport");
        assert_eq!(rejected.kind(), "transcription_provider_rejected");

        assert!(timeout.retryable());
        assert!(transport.retryable());
        assert!(!rejected.retryable());
    }

    #[test]
    fn test_boundary_errors_are_not_retryable() {
        assert!(!GatewayError::SessionNotFound("x".into()).retryable());
        assert!(!GatewayError::InvalidFrame("bad json".into()).retryable());
        // Capacity is transient: sessions end and free slots.
        assert!(GatewayError::CapacityExceeded { limit: 4 }.retryable());
    }
}
