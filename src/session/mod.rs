//! # Session Module
//!
//! Voice session lifecycle and tracking.
//!
//! ## Key Components:
//! - **Voice Session**: per-connection state machine, window sequencing,
//!   and activity tracking
//! - **Registry**: concurrent-session limit and idle sweep
//! - **Ordering**: in-order delivery of concurrently transcribed windows

pub mod ordering; // In-order result delivery
pub mod registry; // Session tracking and limits
pub mod voice; // Per-session state machine

pub use ordering::ResultSequencer;
pub use registry::{spawn_idle_sweeper, SessionRegistry, SharedSession};
pub use voice::{DispatchedWindow, IngestOutcome, SessionConfig, SessionStatus};
