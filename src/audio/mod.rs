//! # Audio Module
//!
//! Buffering and format handling for the realtime voice pipeline.
//!
//! ## Key Components:
//! - **Window Buffer**: accumulates raw audio and cuts transcription windows
//! - **Sample Format**: declared PCM format, duration math, payload
//!   validation, and the silence hint used for window boundaries
//!
//! ## Audio Format:
//! Sessions default to 16kHz mono 16-bit little-endian PCM; the `configure`
//! control frame may declare a different supported format per session.

pub mod buffer; // Window accumulation and readiness policy
pub mod format; // Declared sample format and validation

pub use buffer::{AppendSignal, AudioChunk, AudioWindow, AudioWindowBuffer, WindowPolicy};
pub use format::SampleFormat;
