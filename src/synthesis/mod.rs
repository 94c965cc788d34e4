//! # Synthesis Module
//!
//! Text-to-speech routing with failure isolation.
//!
//! ## Key Components:
//! - **Circuit Breaker**: per-provider failure isolation with half-open
//!   trial probing
//! - **Router**: prioritized provider chain, open breakers skipped, partial
//!   streams reported and resumed on the next provider

pub mod breaker; // Per-provider circuit breaker
pub mod router; // Provider chain and streaming fallback

pub use router::{SpeechSynthesisRouter, SynthesisEvent, VoiceOptions};
