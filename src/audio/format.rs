//! # Sample Format Validation
//!
//! Declares the PCM sample format a session expects and validates that
//! inbound payloads actually match it. A mismatch between the declared
//! configuration and the bytes on the wire is a `config_mismatch` error —
//! the gateway never silently coerces audio into a different format.
//!
//! Duration math lives here too: every window/buffer duration in the system
//! is derived from byte count, sample rate, channel count, and bit depth.

use crate::error::{GatewayError, GatewayResult};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Mean-absolute-amplitude threshold below which 16-bit PCM audio is treated
/// as silence for window-boundary purposes.
const SILENCE_AMPLITUDE_THRESHOLD: u32 = 250;

/// PCM sample format declared at session configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl SampleFormat {
    pub fn new(sample_rate: u32, channels: u8, bit_depth: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    /// Size in bytes of one multi-channel sample frame.
    pub fn frame_bytes(&self) -> usize {
        (self.bit_depth as usize / 8) * self.channels as usize
    }

    /// Bytes of audio per second at this format.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }

    /// Duration in milliseconds represented by `byte_len` bytes of audio.
    pub fn duration_ms(&self, byte_len: usize) -> u32 {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return 0;
        }
        ((byte_len * 1000) / bps) as u32
    }

    /// Byte count corresponding to `ms` milliseconds, aligned down to a
    /// whole sample frame so a split never lands mid-sample.
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        let raw = (self.bytes_per_second() * ms as usize) / 1000;
        let frame = self.frame_bytes().max(1);
        (raw / frame) * frame
    }

    /// Check that the format itself is one the gateway can handle.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.sample_rate == 0 {
            return Err(GatewayError::ConfigMismatch(
                "sample rate must be greater than 0".to_string(),
            ));
        }
        if self.channels == 0 {
            return Err(GatewayError::ConfigMismatch(
                "channel count must be greater than 0".to_string(),
            ));
        }
        if !matches!(self.bit_depth, 8 | 16) {
            return Err(GatewayError::ConfigMismatch(format!(
                "unsupported bit depth {} (expected 8 or 16)",
                self.bit_depth
            )));
        }
        Ok(())
    }

    /// Validate that a binary payload is structurally consistent with this
    /// declared format.
    ///
    /// An empty payload or one that does not divide into whole sample frames
    /// means the client is sending something other than what it declared.
    pub fn validate_payload(&self, data: &[u8]) -> GatewayResult<()> {
        if data.is_empty() {
            return Err(GatewayError::ConfigMismatch(
                "empty audio payload".to_string(),
            ));
        }

        let frame = self.frame_bytes();
        if frame == 0 || data.len() % frame != 0 {
            return Err(GatewayError::ConfigMismatch(format!(
                "payload of {} bytes does not align to {}-byte sample frames \
                 declared by the session format",
                data.len(),
                frame
            )));
        }

        Ok(())
    }

    /// Voice-activity hint: whether a payload is effectively silent.
    ///
    /// Computes the mean absolute amplitude over at most the first 4000
    /// samples. Only meaningful for 16-bit PCM; other depths always report
    /// non-silent so the window policy falls back to the max-duration bound.
    pub fn is_silence(&self, data: &[u8]) -> bool {
        if self.bit_depth != 16 || data.len() < 2 {
            return false;
        }

        let mut cursor = Cursor::new(data);
        let mut total: u64 = 0;
        let mut count: u64 = 0;

        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            total += (sample as i32).unsigned_abs() as u64;
            count += 1;
            if count >= 4000 {
                break;
            }
        }

        if count == 0 {
            return false;
        }

        (total / count) < SILENCE_AMPLITUDE_THRESHOLD as u64
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_math_16khz_mono_16bit() {
        let fmt = SampleFormat::default();
        // 16000 samples/s * 2 bytes = 32000 bytes/s → 32 bytes per ms.
        assert_eq!(fmt.bytes_per_second(), 32000);
        assert_eq!(fmt.duration_ms(32000), 1000);
        assert_eq!(fmt.duration_ms(3200), 100);
        assert_eq!(fmt.bytes_for_ms(1000), 32000);
    }

    #[test]
    fn test_bytes_for_ms_aligns_to_frames() {
        let stereo = SampleFormat::new(16000, 2, 16);
        let bytes = stereo.bytes_for_ms(333);
        assert_eq!(bytes % stereo.frame_bytes(), 0);
    }

    #[test]
    fn test_payload_alignment_mismatch() {
        let fmt = SampleFormat::default();
        // Odd byte count cannot be 16-bit samples.
        assert!(fmt.validate_payload(&[0u8; 15]).is_err());
        assert!(fmt.validate_payload(&[0u8; 16]).is_ok());
        assert!(fmt.validate_payload(&[]).is_err());
    }

    #[test]
    fn test_unsupported_format_rejected() {
        assert!(SampleFormat::new(16000, 1, 24).validate().is_err());
        assert!(SampleFormat::new(0, 1, 16).validate().is_err());
        assert!(SampleFormat::new(16000, 0, 16).validate().is_err());
        assert!(SampleFormat::new(48000, 2, 16).validate().is_ok());
    }

    #[test]
    fn test_silence_detection() {
        let fmt = SampleFormat::default();

        let silent = vec![0u8; 3200];
        assert!(fmt.is_silence(&silent));

        let mut loud = Vec::new();
        for i in 0..1600i32 {
            let sample = (((i as f32) * 0.3).sin() * 12000.0) as i16;
            loud.extend_from_slice(&sample.to_le_bytes());
        }
        assert!(!fmt.is_silence(&loud));
    }

    #[test]
    fn test_silence_hint_disabled_for_8bit() {
        let fmt = SampleFormat::new(8000, 1, 8);
        assert!(!fmt.is_silence(&[0u8; 800]));
    }
}
