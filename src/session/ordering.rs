//! # In-Order Result Delivery
//!
//! Windows are transcribed concurrently, but within one session the client
//! must observe transcription results in window order. The sequencer is a
//! per-session completion queue: completions are inserted under their window
//! sequence number and released only once every earlier window has been
//! released.

use std::collections::BTreeMap;

/// Per-session completion queue keyed by window sequence.
///
/// Owned by the connection actor; no internal locking needed.
pub struct ResultSequencer<T> {
    next_seq: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ResultSequencer<T> {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Record the completion of `seq` and return every completion that is
    /// now releasable, in sequence order.
    ///
    /// Returns an empty vec while an earlier window is still outstanding.
    pub fn complete(&mut self, seq: u64, item: T) -> Vec<(u64, T)> {
        self.pending.insert(seq, item);

        let mut released = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_seq) {
            released.push((self.next_seq, item));
            self.next_seq += 1;
        }
        released
    }

    /// Number of completions held back waiting for an earlier window.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The next sequence the client has not yet observed.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

impl<T> Default for ResultSequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_completions_release_immediately() {
        let mut seq = ResultSequencer::new();
        assert_eq!(seq.complete(0, "a"), vec![(0, "a")]);
        assert_eq!(seq.complete(1, "b"), vec![(1, "b")]);
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn test_out_of_order_completion_is_held_back() {
        let mut seq = ResultSequencer::new();

        // Window 1 finishes before window 0: nothing may be released yet.
        assert!(seq.complete(1, "second").is_empty());
        assert_eq!(seq.pending_len(), 1);

        // Window 0 arrives: both release, in window order.
        let released = seq.complete(0, "first");
        assert_eq!(released, vec![(0, "first"), (1, "second")]);
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn test_three_windows_with_middle_last() {
        let mut seq = ResultSequencer::new();
        assert!(seq.complete(2, "c").is_empty());
        assert_eq!(seq.complete(0, "a"), vec![(0, "a")]);
        let released = seq.complete(1, "b");
        assert_eq!(released, vec![(1, "b"), (2, "c")]);
    }

    #[test]
    fn test_next_seq_advances_only_on_release() {
        let mut seq: ResultSequencer<u8> = ResultSequencer::new();
        assert_eq!(seq.next_seq(), 0);
        seq.complete(3, 3);
        assert_eq!(seq.next_seq(), 0);
        seq.complete(0, 0);
        assert_eq!(seq.next_seq(), 1);
    }
}
