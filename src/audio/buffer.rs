//! # Audio Window Buffer
//!
//! Accumulates raw audio bytes for one session and decides when the
//! accumulated span becomes a window ready for transcription.
//!
//! ## Window Policy:
//! A window is ready once accumulated duration reaches `min_window_ms` AND
//! either (a) it reaches `max_window_ms`, or (b) the caller supplied a
//! silence/boundary hint with the chunk. Otherwise the buffer keeps
//! accumulating up to `hard_max_ms`; crossing the hard ceiling force-flushes
//! everything as an overflow window — surfaced as a warning to the session,
//! never a silent drop.
//!
//! Durations are always derived from byte count and the session's declared
//! sample format; a payload that does not match the declared format is a
//! `config_mismatch` error before any byte enters the buffer.

use crate::audio::format::SampleFormat;
use crate::error::GatewayResult;

/// One inbound binary frame's worth of audio.
///
/// Transient: owned by the buffer only until merged into a window.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Monotonic per-session arrival sequence
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl AudioChunk {
    pub fn new(sequence: u64, payload: Vec<u8>) -> Self {
        Self { sequence, payload }
    }
}

/// A contiguous span of buffered audio dispatched as one transcription unit.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    pub session_id: String,
    pub start_sequence: u64,
    pub end_sequence: u64,
    pub duration_ms: u32,
    pub payload: Vec<u8>,
}

/// Window policy thresholds, taken from the owning session's config.
#[derive(Debug, Clone, Copy)]
pub struct WindowPolicy {
    pub min_window_ms: u32,
    pub max_window_ms: u32,
    pub hard_max_ms: u32,
}

/// Outcome of appending a chunk.
#[derive(Debug)]
pub enum AppendSignal {
    /// Chunk absorbed, no window ready yet.
    Buffered,
    /// A window became ready and was taken out of the buffer.
    WindowReady(AudioWindow),
    /// The hard ceiling was crossed; everything buffered is force-flushed.
    /// The caller must still dispatch the window and surface a
    /// buffer_overflow warning to the session.
    Overflow(AudioWindow),
}

/// Accumulates audio bytes for one session and emits windows per the policy.
///
/// Not internally synchronized; the owning session serializes access.
#[derive(Debug)]
pub struct AudioWindowBuffer {
    session_id: String,
    format: SampleFormat,
    policy: WindowPolicy,
    pending: Vec<u8>,
    /// Sequence of the first chunk contributing to `pending`
    start_sequence: Option<u64>,
    /// Sequence of the most recent chunk absorbed
    last_sequence: u64,
}

impl AudioWindowBuffer {
    pub fn new(session_id: impl Into<String>, format: SampleFormat, policy: WindowPolicy) -> Self {
        Self {
            session_id: session_id.into(),
            format,
            policy,
            pending: Vec::new(),
            start_sequence: None,
            last_sequence: 0,
        }
    }

    /// Append one chunk's bytes and evaluate the window policy.
    ///
    /// `boundary_hint` is the caller-supplied voice-activity signal: true
    /// means this chunk looks like a natural boundary (e.g. silence), so a
    /// window at or past `min_window_ms` may be cut early.
    pub fn append(&mut self, chunk: AudioChunk, boundary_hint: bool) -> GatewayResult<AppendSignal> {
        self.format.validate_payload(&chunk.payload)?;

        if self.start_sequence.is_none() {
            self.start_sequence = Some(chunk.sequence);
        }
        self.last_sequence = chunk.sequence;
        self.pending.extend_from_slice(&chunk.payload);

        let duration = self.buffered_ms();

        // Hard ceiling first: a single oversized chunk can jump straight
        // past it, and that must never be dispatched as a normal window.
        if duration > self.policy.hard_max_ms {
            let window = self.take_all();
            return Ok(AppendSignal::Overflow(window));
        }

        if duration >= self.policy.max_window_ms {
            // Cut exactly at the max boundary; the remainder stays buffered
            // so dispatched windows respect the [min, max] invariant.
            let window = self.take_up_to(self.policy.max_window_ms);
            return Ok(AppendSignal::WindowReady(window));
        }

        if boundary_hint && duration >= self.policy.min_window_ms {
            let window = self.take_all();
            return Ok(AppendSignal::WindowReady(window));
        }

        Ok(AppendSignal::Buffered)
    }

    /// Force emission of whatever is buffered.
    ///
    /// Used on explicit client request and at session teardown. The emitted
    /// window's duration may be below `min_window_ms`. Empty buffer → `None`.
    pub fn flush(&mut self) -> Option<AudioWindow> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.take_all())
    }

    /// Discard all buffered audio without emitting a window.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.start_sequence = None;
    }

    /// Duration of audio currently buffered, in milliseconds.
    pub fn buffered_ms(&self) -> u32 {
        self.format.duration_ms(self.pending.len())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take_all(&mut self) -> AudioWindow {
        let payload = std::mem::take(&mut self.pending);
        let start = self.start_sequence.take().unwrap_or(self.last_sequence);
        AudioWindow {
            session_id: self.session_id.clone(),
            start_sequence: start,
            end_sequence: self.last_sequence,
            duration_ms: self.format.duration_ms(payload.len()),
            payload,
        }
    }

    /// Split off the first `ms` milliseconds as a window, leaving the rest
    /// buffered. The split lands on a sample-frame boundary.
    fn take_up_to(&mut self, ms: u32) -> AudioWindow {
        let cut = self.format.bytes_for_ms(ms).min(self.pending.len());
        let remainder = self.pending.split_off(cut);
        let payload = std::mem::take(&mut self.pending);
        self.pending = remainder;

        let start = self.start_sequence.unwrap_or(self.last_sequence);
        // The remainder, if any, starts within the chunk that closed this
        // window, so the next window begins at the same sequence.
        self.start_sequence = if self.pending.is_empty() {
            None
        } else {
            Some(self.last_sequence)
        };

        AudioWindow {
            session_id: self.session_id.clone(),
            start_sequence: start,
            end_sequence: self.last_sequence,
            duration_ms: self.format.duration_ms(payload.len()),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> WindowPolicy {
        WindowPolicy {
            min_window_ms: 1000,
            max_window_ms: 3000,
            hard_max_ms: 10000,
        }
    }

    fn buffer() -> AudioWindowBuffer {
        AudioWindowBuffer::new("s1", SampleFormat::default(), policy())
    }

    /// 16kHz mono 16-bit → 32 bytes per millisecond.
    fn audio_bytes(ms: u32) -> Vec<u8> {
        let mut data = Vec::new();
        let samples = (ms * 16) as usize; // 16 samples per ms
        for i in 0..samples {
            let sample = (((i as f32) * 0.21).sin() * 9000.0) as i16;
            data.extend_from_slice(&sample.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_accumulates_below_min_without_emitting() {
        let mut buf = buffer();
        let signal = buf
            .append(AudioChunk::new(0, audio_bytes(500)), false)
            .unwrap();
        assert!(matches!(signal, AppendSignal::Buffered));
        assert_eq!(buf.buffered_ms(), 500);
    }

    #[test]
    fn test_window_ready_at_max_duration() {
        let mut buf = buffer();
        let mut seq = 0;
        // 2900ms buffered, still below max.
        for _ in 0..29 {
            let signal = buf
                .append(AudioChunk::new(seq, audio_bytes(100)), false)
                .unwrap();
            assert!(matches!(signal, AppendSignal::Buffered));
            seq += 1;
        }
        // Crossing 3000ms cuts a window at exactly the max boundary.
        let signal = buf
            .append(AudioChunk::new(seq, audio_bytes(200)), false)
            .unwrap();
        match signal {
            AppendSignal::WindowReady(window) => {
                assert_eq!(window.duration_ms, 3000);
                assert_eq!(window.start_sequence, 0);
                assert_eq!(window.end_sequence, seq);
            }
            other => panic!("expected WindowReady, got {:?}", other),
        }
        // The 100ms overshoot stays buffered for the next window.
        assert_eq!(buf.buffered_ms(), 100);
    }

    #[test]
    fn test_boundary_hint_cuts_early_window() {
        let mut buf = buffer();
        buf.append(AudioChunk::new(0, audio_bytes(900)), false)
            .unwrap();
        // Hint below min is ignored.
        let signal = buf
            .append(AudioChunk::new(1, audio_bytes(50)), true)
            .unwrap();
        assert!(matches!(signal, AppendSignal::Buffered));

        // Hint at >= min emits everything buffered.
        let signal = buf
            .append(AudioChunk::new(2, audio_bytes(250)), true)
            .unwrap();
        match signal {
            AppendSignal::WindowReady(window) => {
                assert_eq!(window.duration_ms, 1200);
                assert!(window.duration_ms >= 1000 && window.duration_ms <= 3000);
            }
            other => panic!("expected WindowReady, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_chunk_overflows_with_force_flush() {
        let mut buf = buffer();
        // A single chunk past the hard ceiling: overflow, nothing dropped.
        let signal = buf
            .append(AudioChunk::new(0, audio_bytes(11000)), false)
            .unwrap();
        match signal {
            AppendSignal::Overflow(window) => {
                assert_eq!(window.duration_ms, 11000);
                assert!(!window.payload.is_empty());
            }
            other => panic!("expected Overflow, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_flush_non_empty_emits_exactly_one_window() {
        let mut buf = buffer();
        buf.append(AudioChunk::new(0, audio_bytes(300)), false)
            .unwrap();

        let window = buf.flush().expect("flush of non-empty buffer emits a window");
        assert_eq!(window.duration_ms, 300); // below min is allowed on flush
        assert!(buf.flush().is_none()); // and the buffer is now drained
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let mut buf = buffer();
        assert!(buf.flush().is_none());
    }

    #[test]
    fn test_misaligned_payload_is_config_mismatch() {
        let mut buf = buffer();
        let err = buf
            .append(AudioChunk::new(0, vec![0u8; 33]), false)
            .unwrap_err();
        assert_eq!(err.kind(), "config_mismatch");
        // Nothing entered the buffer.
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_preserves_sequence_attribution() {
        let mut buf = buffer();
        buf.append(AudioChunk::new(0, audio_bytes(2900)), false)
            .unwrap();
        let signal = buf
            .append(AudioChunk::new(1, audio_bytes(300)), false)
            .unwrap();
        let window = match signal {
            AppendSignal::WindowReady(w) => w,
            other => panic!("expected WindowReady, got {:?}", other),
        };
        assert_eq!(window.end_sequence, 1);

        // Remainder belongs to chunk 1; the next flush reports it.
        let tail = buf.flush().unwrap();
        assert_eq!(tail.start_sequence, 1);
        assert_eq!(tail.duration_ms, 200);
    }
}
