//! # Transcription Module
//!
//! Speech-to-text dispatch against a remote HTTP backend.
//!
//! ## Key Components:
//! - **SpeechToText trait**: the seam sessions depend on, mockable in tests
//! - **HTTP client**: OpenAI-compatible multipart upload with a bounded
//!   per-call timeout
//! - **Retry discipline**: one retry after a fixed backoff, transport
//!   failures only
//!
//! ## Failure Classification:
//! Every failed call is classified as timeout, transport, or provider
//! rejection. The classification decides both the retry behavior and the
//! stable error kind the client sees on the wire.

pub mod client; // HTTP speech-to-text client and retry discipline

pub use client::{HttpTranscriptionClient, SpeechToText, TranscriptionResult};
