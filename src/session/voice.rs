//! # Voice Session
//!
//! Per-connection session state: the audio window buffer, the window
//! sequence counter, the lifecycle state machine, and activity tracking for
//! the idle sweep. The session is pure state; the connection actor drives it
//! and owns dispatching windows to the transcription backend.
//!
//! ## Lifecycle:
//! Connecting → Ready → Recording ⇄ Processing → Closed, with Error as a
//! self-healing detour: a failed remote call marks the session Error, and
//! the next successfully ingested audio returns it to Recording. Errors on
//! one session never touch another.

use crate::audio::{AppendSignal, AudioChunk, AudioWindow, AudioWindowBuffer, SampleFormat, WindowPolicy};
use crate::config::AudioConfig;
use crate::error::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// Connection accepted, session not yet announced to the client.
    Connecting,
    /// Announced and idle: no buffered audio, no outstanding windows.
    Ready,
    /// Audio buffered, nothing dispatched yet.
    Recording,
    /// At least one window is outstanding. Ingestion continues; windows
    /// pipeline rather than blocking the stream.
    Processing,
    /// A remote call failed. Cleared by the next successful ingest.
    Error,
    /// Terminal.
    Closed,
}

/// Per-session audio configuration: the declared sample format, the window
/// policy thresholds, and an optional language hint for transcription.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub format: SampleFormat,
    pub policy: WindowPolicy,
    pub language: Option<String>,
}

impl SessionConfig {
    /// Session defaults from the application-level audio configuration.
    pub fn from_app(audio: &AudioConfig) -> Self {
        Self {
            format: SampleFormat::new(audio.sample_rate, audio.channels, audio.bit_depth),
            policy: WindowPolicy {
                min_window_ms: audio.min_window_ms,
                max_window_ms: audio.max_window_ms,
                hard_max_ms: audio.hard_max_ms,
            },
            language: None,
        }
    }

    pub fn validate(&self) -> GatewayResult<()> {
        self.format.validate()?;
        if self.policy.min_window_ms == 0 {
            return Err(GatewayError::ConfigMismatch(
                "min_window_ms must be greater than 0".to_string(),
            ));
        }
        if self.policy.min_window_ms > self.policy.max_window_ms
            || self.policy.max_window_ms > self.policy.hard_max_ms
        {
            return Err(GatewayError::ConfigMismatch(format!(
                "window policy must satisfy min <= max <= hard ({} / {} / {})",
                self.policy.min_window_ms, self.policy.max_window_ms, self.policy.hard_max_ms
            )));
        }
        Ok(())
    }
}

/// A window pulled out of the buffer, tagged with the per-session window
/// sequence used for in-order result delivery.
#[derive(Debug)]
pub struct DispatchedWindow {
    pub window_seq: u64,
    pub window: AudioWindow,
}

/// Outcome of ingesting one binary audio frame.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Absorbed; nothing to dispatch.
    Buffered,
    /// A window is ready for transcription.
    Window(DispatchedWindow),
    /// The hard ceiling was crossed. The window must still be dispatched and
    /// a buffer_overflow warning surfaced on this session's channel.
    Overflow {
        dispatched: DispatchedWindow,
        buffered_ms: u32,
    },
}

/// Serializable session snapshot for status frames and the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub buffered_ms: u32,
    pub chunks_received: u64,
    pub windows_dispatched: u64,
    pub windows_completed: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// State for one realtime voice session.
///
/// Not internally synchronized; the registry wraps sessions in a lock and
/// the owning connection serializes its own operations.
#[derive(Debug)]
pub struct VoiceSession {
    pub id: String,
    state: SessionState,
    config: SessionConfig,
    buffer: AudioWindowBuffer,

    /// Next window sequence to assign at dispatch time
    next_window_seq: u64,
    chunks_received: u64,
    windows_dispatched: u64,
    windows_completed: u64,

    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,

    /// Flipped to true exactly once, at close. In-flight remote calls for
    /// this session select against a receiver of this channel.
    closed_tx: watch::Sender<bool>,
}

impl VoiceSession {
    pub fn new(id: impl Into<String>, config: SessionConfig) -> GatewayResult<Self> {
        config.validate()?;
        let id = id.into();
        let (closed_tx, _) = watch::channel(false);
        let now = Utc::now();
        Ok(Self {
            buffer: AudioWindowBuffer::new(id.clone(), config.format, config.policy),
            id,
            state: SessionState::Connecting,
            config,
            next_window_seq: 0,
            chunks_received: 0,
            windows_dispatched: 0,
            windows_completed: 0,
            created_at: now,
            last_activity: now,
            closed_tx,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Receiver that observes session close, for cancelling in-flight work.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Announce the session: Connecting → Ready.
    pub fn mark_ready(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Ready;
            info!(session_id = %self.id, "Session ready");
        }
    }

    /// Ingest one binary audio frame.
    ///
    /// The silence hint is derived from the payload itself so a natural
    /// pause can close a window early once `min_window_ms` is buffered.
    pub fn ingest(&mut self, payload: Vec<u8>) -> GatewayResult<IngestOutcome> {
        match self.state {
            SessionState::Connecting => {
                return Err(GatewayError::InvalidFrame(
                    "audio received before the session was announced".to_string(),
                ));
            }
            SessionState::Closed => {
                return Err(GatewayError::InvalidFrame(
                    "audio received on a closed session".to_string(),
                ));
            }
            _ => {}
        }

        self.touch();
        let boundary_hint = self.config.format.is_silence(&payload);
        let sequence = self.chunks_received;
        let chunk = AudioChunk::new(sequence, payload);

        let signal = self.buffer.append(chunk, boundary_hint)?;
        self.chunks_received += 1;

        // A successful ingest heals a session-local error.
        if self.state == SessionState::Error {
            debug!(session_id = %self.id, "Session recovered from error state");
        }

        let outcome = match signal {
            AppendSignal::Buffered => IngestOutcome::Buffered,
            AppendSignal::WindowReady(window) => {
                IngestOutcome::Window(self.tag_dispatch(window))
            }
            AppendSignal::Overflow(window) => {
                let buffered_ms = window.duration_ms;
                warn!(
                    session_id = %self.id,
                    buffered_ms,
                    "Hard window ceiling exceeded, force-flushing buffer"
                );
                IngestOutcome::Overflow {
                    dispatched: self.tag_dispatch(window),
                    buffered_ms,
                }
            }
        };

        self.recompute_state();
        Ok(outcome)
    }

    /// Force out whatever is buffered, regardless of the minimum window
    /// duration. `None` when the buffer is empty.
    pub fn flush(&mut self) -> Option<DispatchedWindow> {
        self.touch();
        let window = self.buffer.flush()?;
        let dispatched = self.tag_dispatch(window);
        self.recompute_state();
        Some(dispatched)
    }

    /// Discard buffered audio that has not yet formed a window. Windows
    /// already dispatched still complete and deliver in order.
    pub fn reset(&mut self) {
        self.touch();
        self.buffer.clear();
        self.recompute_state();
    }

    /// Apply a new session configuration.
    ///
    /// Audio buffered under the old format is flushed first and must be
    /// dispatched by the caller; mixing formats within one window is never
    /// allowed. The returned window, if any, belongs to the old format.
    pub fn reconfigure(&mut self, config: SessionConfig) -> GatewayResult<Option<DispatchedWindow>> {
        config.validate()?;
        self.touch();

        let flushed = self.buffer.flush().map(|w| self.tag_dispatch(w));
        self.buffer = AudioWindowBuffer::new(self.id.clone(), config.format, config.policy);
        info!(
            session_id = %self.id,
            sample_rate = config.format.sample_rate,
            "Session reconfigured"
        );
        self.config = config;
        self.recompute_state();
        Ok(flushed)
    }

    /// Record that a dispatched window finished (successfully or not).
    pub fn complete_window(&mut self) {
        self.windows_completed = (self.windows_completed + 1).min(self.windows_dispatched);
        if self.state != SessionState::Error && self.state != SessionState::Closed {
            self.recompute_state();
        }
    }

    /// Mark a session-local failure. The session stays usable; the next
    /// successful ingest clears the state.
    pub fn mark_error(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Error;
        }
    }

    /// Terminal transition. Idempotent.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            let _ = self.closed_tx.send(true);
            info!(session_id = %self.id, "Session closed");
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// How long the session has been idle, for the sweep.
    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn outstanding_windows(&self) -> u64 {
        self.windows_dispatched - self.windows_completed
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            state: self.state,
            buffered_ms: self.buffer.buffered_ms(),
            chunks_received: self.chunks_received,
            windows_dispatched: self.windows_dispatched,
            windows_completed: self.windows_completed,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    fn tag_dispatch(&mut self, window: AudioWindow) -> DispatchedWindow {
        let window_seq = self.next_window_seq;
        self.next_window_seq += 1;
        self.windows_dispatched += 1;
        DispatchedWindow { window_seq, window }
    }

    /// Derive the lifecycle state from what the session is actually doing.
    /// Outstanding windows dominate; otherwise buffered audio means
    /// Recording, and an empty session is Ready.
    fn recompute_state(&mut self) {
        if matches!(self.state, SessionState::Connecting | SessionState::Closed) {
            return;
        }
        self.state = if self.outstanding_windows() > 0 {
            SessionState::Processing
        } else if !self.buffer.is_empty() {
            SessionState::Recording
        } else {
            SessionState::Ready
        };
    }
}
