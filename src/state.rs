//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket connection. The
//! configuration is immutable after startup; everything mutable sits behind
//! `Arc<RwLock<T>>` so concurrent requests read without blocking each other
//! and updates stay race-free.

use crate::config::AppConfig;
use crate::session::SessionRegistry;
use crate::synthesis::SpeechSynthesisRouter;
use crate::transcription::SpeechToText;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The shared application state.
///
/// Cheap to clone: every field is an `Arc` (or `Copy`), so each handler gets
/// its own handle to the same underlying collaborators.
#[derive(Clone)]
pub struct AppState {
    /// Validated configuration, frozen for the process lifetime
    pub config: Arc<AppConfig>,

    /// Active voice sessions and the concurrency limit
    pub registry: Arc<SessionRegistry>,

    /// Speech-to-text backend used for every dispatched window
    pub transcriber: Arc<dyn SpeechToText>,

    /// Synthesis provider chain with per-provider breakers
    pub synthesizer: Arc<SpeechSynthesisRouter>,

    /// Request and pipeline counters, updated by middleware and sessions
    pub metrics: Arc<RwLock<GatewayMetrics>>,

    /// When the server started (Instant is Copy, no locking needed)
    pub start_time: Instant,
}

/// Counters collected across HTTP requests and the voice pipeline.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Total HTTP requests processed since start
    pub request_count: u64,

    /// Total HTTP errors since start
    pub error_count: u64,

    /// Audio windows handed to the transcription backend
    pub windows_dispatched: u64,

    /// Windows that came back with a transcription
    pub windows_transcribed: u64,

    /// Windows whose transcription failed after the retry discipline
    pub transcription_failures: u64,

    /// Synthesis requests accepted into the provider chain
    pub synthesis_requests: u64,

    /// Per-endpoint request statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: Arc<SessionRegistry>,
        transcriber: Arc<dyn SpeechToText>,
        synthesizer: Arc<SpeechSynthesisRouter>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            transcriber,
            synthesizer,
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    pub fn record_window_dispatched(&self) {
        self.metrics.write().unwrap().windows_dispatched += 1;
    }

    pub fn record_window_transcribed(&self) {
        self.metrics.write().unwrap().windows_transcribed += 1;
    }

    pub fn record_transcription_failure(&self) {
        self.metrics.write().unwrap().transcription_failures += 1;
    }

    pub fn record_synthesis_request(&self) {
        self.metrics.write().unwrap().synthesis_requests += 1;
    }

    /// Record one finished HTTP request against its endpoint bucket.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let entry = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();
        entry.request_count += 1;
        entry.total_duration_ms += duration_ms;
        if is_error {
            entry.error_count += 1;
        }
    }

    /// Consistent copy of the counters, cloned so no lock is held while the
    /// response serializes.
    pub fn metrics_snapshot(&self) -> GatewayMetrics {
        let metrics = self.metrics.read().unwrap();
        GatewayMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            windows_dispatched: metrics.windows_dispatched,
            windows_transcribed: metrics.windows_transcribed,
            transcription_failures: metrics.transcription_failures,
            synthesis_requests: metrics.synthesis_requests,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds, 0.0 before any request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::HttpTranscriptionClient;
    use std::time::Duration;

    fn state() -> AppState {
        let config = AppConfig::default();
        let registry = Arc::new(SessionRegistry::new(
            config.session.max_concurrent,
            Duration::from_secs(config.session.idle_timeout_secs),
        ));
        let transcriber = Arc::new(HttpTranscriptionClient::new(config.transcription.clone()));
        let synthesizer = Arc::new(SpeechSynthesisRouter::from_config(&config.synthesis));
        AppState::new(config, registry, transcriber, synthesizer)
    }

    #[test]
    fn test_pipeline_counters() {
        let state = state();
        state.record_window_dispatched();
        state.record_window_dispatched();
        state.record_window_transcribed();
        state.record_transcription_failure();

        let snapshot = state.metrics_snapshot();
        assert_eq!(snapshot.windows_dispatched, 2);
        assert_eq!(snapshot.windows_transcribed, 1);
        assert_eq!(snapshot.transcription_failures, 1);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
