//! # Speech Synthesis Router
//!
//! Routes text-to-speech requests across a prioritized provider chain. Each
//! provider sits behind its own circuit breaker; providers with an open
//! breaker are skipped without a network call. When a provider fails after
//! emitting some audio the router reports the partial stream and resumes
//! with the next provider in the chain rather than replaying from the start.

use crate::config::{SynthesisConfig, SynthesisProviderConfig};
use crate::error::{GatewayError, RemoteCallFailure, SynthesisCallError};
use crate::synthesis::breaker::{Admission, BreakerSnapshot, CircuitBreaker};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Per-request voice settings from the client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceOptions {
    pub voice: Option<String>,
    pub speed: Option<f32>,
}

/// Chunked audio from one provider.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes, SynthesisCallError>> + Send>>;

/// One entry in the synthesis chain.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Open an audio stream for the given text. Errors here mean no audio
    /// was emitted; errors on the returned stream mean partial audio may
    /// already have reached the client.
    async fn open_stream(
        &self,
        text: &str,
        options: &VoiceOptions,
    ) -> Result<AudioStream, SynthesisCallError>;
}

/// Events delivered to the session while a synthesis request runs.
#[derive(Debug)]
pub enum SynthesisEvent {
    /// One chunk of synthesized audio, forward to the client as-is.
    Audio(Bytes),
    /// The active provider failed mid-stream; audio already delivered is
    /// partial. The router continues with the next provider if one remains.
    PartialStreamAborted { provider: String },
    /// The stream finished cleanly.
    Completed { provider: String },
    /// No provider could finish the request.
    Failed(GatewayError),
}

/// Speech synthesis over an OpenAI-compatible `/audio/speech` endpoint.
pub struct HttpSpeechProvider {
    name: String,
    client: reqwest::Client,
    config: SynthesisProviderConfig,
    request_timeout: Duration,
}

impl HttpSpeechProvider {
    pub fn new(config: SynthesisProviderConfig, request_timeout: Duration) -> Self {
        Self {
            name: config.name.clone(),
            client: reqwest::Client::new(),
            config,
            request_timeout,
        }
    }

    fn classify(&self, err: reqwest::Error) -> SynthesisCallError {
        let kind = if err.is_timeout() {
            RemoteCallFailure::Timeout
        } else {
            RemoteCallFailure::Transport
        };
        SynthesisCallError::new(kind, &self.name, err.to_string())
    }
}

#[async_trait]
impl SpeechProvider for HttpSpeechProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_stream(
        &self,
        text: &str,
        options: &VoiceOptions,
    ) -> Result<AudioStream, SynthesisCallError> {
        let voice = options
            .voice
            .clone()
            .or_else(|| self.config.default_voice.clone());

        let mut body = json!({ "input": text });
        if let Some(voice) = voice {
            body["voice"] = json!(voice);
        }
        if let Some(speed) = options.speed {
            body["speed"] = json!(speed);
        }

        let mut request = self
            .client
            .post(&self.config.endpoint_url)
            .timeout(self.request_timeout)
            .json(&body);

        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("provider returned {}", status);
            return Err(if status.is_client_error() {
                SynthesisCallError::rejected_by_client_fault(&self.name, message)
            } else {
                SynthesisCallError::new(RemoteCallFailure::ProviderRejected, &self.name, message)
            });
        }

        let name = self.name.clone();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                SynthesisCallError::new(RemoteCallFailure::Transport, name.clone(), e.to_string())
            })
        });

        Ok(Box::pin(stream))
    }
}

struct ChainEntry {
    provider: Arc<dyn SpeechProvider>,
    breaker: Arc<CircuitBreaker<SynthesisCallError>>,
}

/// Prioritized provider chain with per-provider breakers.
pub struct SpeechSynthesisRouter {
    chain: Vec<ChainEntry>,
    request_timeout: Duration,
}

impl SpeechSynthesisRouter {
    /// Build the chain from configuration, one HTTP provider and breaker per
    /// entry, in priority order.
    pub fn from_config(config: &SynthesisConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|p| {
                Arc::new(HttpSpeechProvider::new(p.clone(), config.request_timeout()))
                    as Arc<dyn SpeechProvider>
            })
            .collect();
        Self::new(
            providers,
            config.breaker_failure_threshold,
            config.breaker_cooldown(),
            config.request_timeout(),
        )
    }

    pub fn new(
        providers: Vec<Arc<dyn SpeechProvider>>,
        failure_threshold: u32,
        cooldown: Duration,
        request_timeout: Duration,
    ) -> Self {
        let chain = providers
            .into_iter()
            .map(|provider| {
                let breaker = Arc::new(CircuitBreaker::new(
                    provider.name().to_string(),
                    failure_threshold,
                    cooldown,
                    // Caller-fault rejections say nothing about provider
                    // health; everything else counts.
                    |err: &SynthesisCallError| !err.client_error,
                ));
                ChainEntry { provider, breaker }
            })
            .collect();
        Self {
            chain,
            request_timeout,
        }
    }

    pub fn provider_count(&self) -> usize {
        self.chain.len()
    }

    /// Breaker state per provider, for health and metrics endpoints.
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.chain.iter().map(|e| e.breaker.snapshot()).collect()
    }

    /// Synthesize `text`, streaming events to the returned receiver.
    ///
    /// Fails fast with `AllProvidersExhausted` when no provider can even
    /// start a stream. Once a stream has started, mid-stream failures are
    /// reported as `PartialStreamAborted` events and the chain resumes with
    /// the next provider.
    pub async fn synthesize(
        &self,
        text: String,
        options: VoiceOptions,
    ) -> Result<ReceiverStream<SynthesisEvent>, GatewayError> {
        let (first_idx, first_stream, first_admission) = self
            .acquire_stream(0, &text, &options)
            .await
            .ok_or(GatewayError::AllProvidersExhausted {
                attempted: self.chain.len(),
            })?;

        let (tx, rx) = mpsc::channel(32);
        let chain = self.chain_handles();
        let request_timeout = self.request_timeout;

        tokio::spawn(forward_with_fallback(
            chain,
            first_idx,
            first_stream,
            first_admission,
            text,
            options,
            request_timeout,
            tx,
        ));

        Ok(ReceiverStream::new(rx))
    }

    /// Walk the chain from `start`, skipping open breakers, until one
    /// provider yields a stream. Records breaker outcomes for every attempt.
    async fn acquire_stream(
        &self,
        start: usize,
        text: &str,
        options: &VoiceOptions,
    ) -> Option<(usize, AudioStream, Admission)> {
        let chain = self.chain_handles();
        acquire_from(&chain, start, text, options, self.request_timeout).await
    }

    fn chain_handles(
        &self,
    ) -> Vec<(Arc<dyn SpeechProvider>, Arc<CircuitBreaker<SynthesisCallError>>)> {
        self.chain
            .iter()
            .map(|e| (Arc::clone(&e.provider), Arc::clone(&e.breaker)))
            .collect()
    }
}

async fn acquire_from(
    chain: &[(Arc<dyn SpeechProvider>, Arc<CircuitBreaker<SynthesisCallError>>)],
    start: usize,
    text: &str,
    options: &VoiceOptions,
    request_timeout: Duration,
) -> Option<(usize, AudioStream, Admission)> {
    for (idx, (provider, breaker)) in chain.iter().enumerate().skip(start) {
        let admission = breaker.try_acquire();
        if admission == Admission::Rejected {
            debug!(provider = provider.name(), "Skipping provider with open breaker");
            continue;
        }

        // The timeout bound holds even for providers that never answer.
        let attempt =
            tokio::time::timeout(request_timeout, provider.open_stream(text, options)).await;

        match attempt {
            Ok(Ok(stream)) => {
                info!(provider = provider.name(), "Synthesis stream opened");
                return Some((idx, stream, admission));
            }
            Ok(Err(err)) => {
                warn!(provider = provider.name(), error = %err, "Synthesis provider failed to start");
                breaker.record_failure(&err);
            }
            Err(_) => {
                let err = SynthesisCallError::new(
                    RemoteCallFailure::Timeout,
                    provider.name(),
                    "request timed out before a stream opened",
                );
                warn!(provider = provider.name(), "Synthesis provider timed out");
                breaker.record_failure(&err);
            }
        }
    }
    None
}

/// Pump audio chunks to the session, falling back down the chain on
/// mid-stream failures.
#[allow(clippy::too_many_arguments)]
async fn forward_with_fallback(
    chain: Vec<(Arc<dyn SpeechProvider>, Arc<CircuitBreaker<SynthesisCallError>>)>,
    mut idx: usize,
    mut stream: AudioStream,
    mut admission: Admission,
    text: String,
    options: VoiceOptions,
    request_timeout: Duration,
    tx: mpsc::Sender<SynthesisEvent>,
) {
    loop {
        let (_, breaker) = &chain[idx];

        match stream.next().await {
            Some(Ok(chunk)) => {
                if tx.send(SynthesisEvent::Audio(chunk)).await.is_err() {
                    // Receiver gone: the session closed mid-request.
                    if admission == Admission::Trial {
                        breaker.abandon_trial();
                    }
                    return;
                }
            }
            None => {
                breaker.record_success();
                let provider = chain[idx].0.name().to_string();
                let _ = tx.send(SynthesisEvent::Completed { provider }).await;
                return;
            }
            Some(Err(err)) => {
                warn!(provider = chain[idx].0.name(), error = %err, "Synthesis stream aborted mid-flight");
                breaker.record_failure(&err);

                let provider = chain[idx].0.name().to_string();
                if tx
                    .send(SynthesisEvent::PartialStreamAborted { provider })
                    .await
                    .is_err()
                {
                    return;
                }

                match acquire_from(&chain, idx + 1, &text, &options, request_timeout).await {
                    Some((next_idx, next_stream, next_admission)) => {
                        idx = next_idx;
                        stream = next_stream;
                        admission = next_admission;
                    }
                    None => {
                        let _ = tx
                            .send(SynthesisEvent::Failed(GatewayError::AllProvidersExhausted {
                                attempted: chain.len(),
                            }))
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider behaviors for chain tests.
    enum Script {
        /// Never answers within any timeout.
        Hang,
        /// Fails to open a stream.
        RefuseToStart,
        /// Streams `total` chunks and completes.
        Stream { total: usize },
        /// Streams `before_failure` chunks, then errors mid-stream.
        FailAfter { before_failure: usize },
        /// Answers the first `successes` calls with one chunk each, then
        /// never answers again.
        SucceedThenHang { successes: u32 },
    }

    struct MockProvider {
        name: String,
        script: Script,
        calls: AtomicU32,
    }

    impl MockProvider {
        fn new(name: &str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeechProvider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn open_stream(
            &self,
            _text: &str,
            _options: &VoiceOptions,
        ) -> Result<AudioStream, SynthesisCallError> {
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hung provider answered")
                }
                Script::RefuseToStart => Err(SynthesisCallError::new(
                    RemoteCallFailure::Transport,
                    &self.name,
                    "connection refused",
                )),
                Script::Stream { total } => {
                    let chunks: Vec<Result<Bytes, SynthesisCallError>> = (0..*total)
                        .map(|i| Ok(Bytes::from(format!("chunk-{}", i))))
                        .collect();
                    Ok(Box::pin(tokio_stream::iter(chunks)))
                }
                Script::FailAfter { before_failure } => {
                    let name = self.name.clone();
                    let mut chunks: Vec<Result<Bytes, SynthesisCallError>> = (0..*before_failure)
                        .map(|i| Ok(Bytes::from(format!("chunk-{}", i))))
                        .collect();
                    chunks.push(Err(SynthesisCallError::new(
                        RemoteCallFailure::Transport,
                        name,
                        "stream reset",
                    )));
                    Ok(Box::pin(tokio_stream::iter(chunks)))
                }
                Script::SucceedThenHang { successes } => {
                    if call_index < *successes {
                        let chunks: Vec<Result<Bytes, SynthesisCallError>> =
                            vec![Ok(Bytes::from("chunk-0"))];
                        Ok(Box::pin(tokio_stream::iter(chunks)))
                    } else {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        unreachable!("hung provider answered")
                    }
                }
            }
        }
    }

    fn router(providers: Vec<Arc<dyn SpeechProvider>>) -> SpeechSynthesisRouter {
        SpeechSynthesisRouter::new(
            providers,
            3,
            Duration::from_secs(60),
            Duration::from_millis(100),
        )
    }

    async fn collect(mut stream: ReceiverStream<SynthesisEvent>) -> Vec<SynthesisEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_open_breaker_skips_provider_without_calling_it() {
        let broken = MockProvider::new("broken", Script::RefuseToStart);
        let healthy = MockProvider::new("healthy", Script::Stream { total: 2 });
        let router = router(vec![broken.clone(), healthy.clone()]);

        // Drive the first provider's breaker open.
        for _ in 0..3 {
            let stream = router
                .synthesize("hello".into(), VoiceOptions::default())
                .await
                .unwrap();
            collect(stream).await;
        }
        assert_eq!(broken.call_count(), 3);

        // Breaker now open: the next request must not touch it.
        let stream = router
            .synthesize("hello".into(), VoiceOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(broken.call_count(), 3);
        assert!(matches!(events.last(), Some(SynthesisEvent::Completed { provider }) if provider == "healthy"));
    }

    #[tokio::test]
    async fn test_chain_walks_past_hung_and_failing_providers() {
        let broken = MockProvider::new("p1", Script::RefuseToStart);
        let hung = MockProvider::new("p2", Script::Hang);
        let healthy = MockProvider::new("p3", Script::Stream { total: 3 });
        let router = router(vec![broken, hung.clone(), healthy]);

        let stream = router
            .synthesize("hello".into(), VoiceOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;

        // The hung provider was attempted but bounded by the timeout.
        assert_eq!(hung.call_count(), 1);

        let audio_chunks = events
            .iter()
            .filter(|e| matches!(e, SynthesisEvent::Audio(_)))
            .count();
        assert_eq!(audio_chunks, 3);
        assert!(matches!(events.last(), Some(SynthesisEvent::Completed { provider }) if provider == "p3"));
    }

    #[tokio::test]
    async fn test_open_breaker_skipped_and_timeout_charged_to_its_provider() {
        let down = MockProvider::new("p1", Script::RefuseToStart);
        let slow = MockProvider::new("p2", Script::SucceedThenHang { successes: 2 });
        let healthy = MockProvider::new("p3", Script::Stream { total: 2 });
        let router = SpeechSynthesisRouter::new(
            vec![down.clone(), slow.clone(), healthy.clone()],
            2,
            Duration::from_secs(60),
            Duration::from_millis(100),
        );

        // Two failed starts open p1's breaker; p2 serves both requests.
        for _ in 0..2 {
            let stream = router
                .synthesize("warmup".into(), VoiceOptions::default())
                .await
                .unwrap();
            collect(stream).await;
        }
        assert_eq!(down.call_count(), 2);
        assert_eq!(router.breaker_snapshots()[0].state, "open");

        let stream = router
            .synthesize("hello".into(), VoiceOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;

        // p1 skipped without a call, p2 timed out with exactly one failure
        // recorded against it, p3 finished the request.
        assert_eq!(down.call_count(), 2);
        assert_eq!(slow.call_count(), 3);
        let snaps = router.breaker_snapshots();
        assert_eq!(snaps[1].consecutive_failures, 1);
        assert_eq!(snaps[1].state, "closed");
        assert!(matches!(events.last(), Some(SynthesisEvent::Completed { provider }) if provider == "p3"));
    }

    #[tokio::test]
    async fn test_all_providers_down_fails_fast() {
        let p1 = MockProvider::new("p1", Script::RefuseToStart);
        let p2 = MockProvider::new("p2", Script::RefuseToStart);
        let router = router(vec![p1, p2]);

        let err = router
            .synthesize("hello".into(), VoiceOptions::default())
            .await
            .unwrap_err();

        match err {
            GatewayError::AllProvidersExhausted { attempted } => assert_eq!(attempted, 2),
            other => panic!("expected AllProvidersExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_reports_partial_and_falls_back() {
        let flaky = MockProvider::new("flaky", Script::FailAfter { before_failure: 2 });
        let backup = MockProvider::new("backup", Script::Stream { total: 2 });
        let router = router(vec![flaky, backup]);

        let stream = router
            .synthesize("hello".into(), VoiceOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;

        // Two chunks from the flaky provider, the abort marker, then the
        // backup's chunks. The client is told audio so far is partial.
        let mut saw_abort_after = None;
        let mut audio_before_abort = 0;
        for (i, event) in events.iter().enumerate() {
            match event {
                SynthesisEvent::PartialStreamAborted { provider } => {
                    assert_eq!(provider, "flaky");
                    saw_abort_after = Some(i);
                }
                SynthesisEvent::Audio(_) if saw_abort_after.is_none() => audio_before_abort += 1,
                _ => {}
            }
        }
        assert_eq!(audio_before_abort, 2);
        assert!(saw_abort_after.is_some());
        assert!(matches!(events.last(), Some(SynthesisEvent::Completed { provider }) if provider == "backup"));
    }

    #[tokio::test]
    async fn test_mid_stream_exhaustion_emits_failed_event() {
        let flaky = MockProvider::new("only", Script::FailAfter { before_failure: 1 });
        let router = router(vec![flaky]);

        let stream = router
            .synthesize("hello".into(), VoiceOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;

        assert!(matches!(
            events.last(),
            Some(SynthesisEvent::Failed(GatewayError::AllProvidersExhausted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_breaker_snapshots_expose_chain_state() {
        let broken = MockProvider::new("down", Script::RefuseToStart);
        let healthy = MockProvider::new("up", Script::Stream { total: 1 });
        let router = router(vec![broken, healthy]);

        for _ in 0..3 {
            let stream = router
                .synthesize("x".into(), VoiceOptions::default())
                .await
                .unwrap();
            collect(stream).await;
        }

        let snaps = router.breaker_snapshots();
        assert_eq!(snaps[0].state, "open");
        assert_eq!(snaps[1].state, "closed");
    }
}
