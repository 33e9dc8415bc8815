//! Transcript accumulation for streaming recognition
//!
//! Recognizers emit hypotheses in two halves: a confirmed prefix that will
//! never change again, and a stash that the server may still rewrite. The
//! accumulator tracks both for one session and enforces that confirmed text
//! is append-only.

use serde::{Deserialize, Serialize};

/// Accumulates one session's transcript.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptAccumulator {
    /// Confirmed text; only ever grows
    confirmed: String,
    /// Unconfirmed tail, replaced wholesale on every partial
    stash: String,
    /// Number of partial updates observed
    partials: u64,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stash with the latest unconfirmed hypothesis.
    pub fn set_stash(&mut self, text: impl Into<String>) {
        self.stash = text.into();
        self.partials += 1;
    }

    /// Promote a finished segment into the confirmed text and clear the
    /// stash. Segments are joined with a single space.
    pub fn commit(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            if !self.confirmed.is_empty() {
                self.confirmed.push(' ');
            }
            self.confirmed.push_str(text);
        }
        self.stash.clear();
        self.partials += 1;
    }

    /// Confirmed prefix
    pub fn confirmed(&self) -> &str {
        &self.confirmed
    }

    /// Unconfirmed tail
    pub fn stash(&self) -> &str {
        &self.stash
    }

    /// Current `(confirmed, stash)` pair for a partial event
    pub fn snapshot(&self) -> (String, String) {
        (self.confirmed.clone(), self.stash.clone())
    }

    /// Best final text: confirmed plus whatever stash is left over.
    ///
    /// Used when a session ends without the server folding its last stash
    /// into a terminal hypothesis.
    pub fn finalize(&self) -> String {
        let mut text = self.confirmed.clone();
        let stash = self.stash.trim();
        if !stash.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(stash);
        }
        text
    }

    /// Partial updates seen so far
    pub fn partial_count(&self) -> u64 {
        self.partials
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.stash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_is_append_only() {
        let mut acc = TranscriptAccumulator::new();
        acc.set_stash("he");
        acc.set_stash("hel");
        assert_eq!(acc.confirmed(), "");
        assert_eq!(acc.stash(), "hel");

        acc.commit("hello");
        assert_eq!(acc.confirmed(), "hello");
        assert_eq!(acc.stash(), "");

        acc.set_stash("wor");
        acc.commit("world");
        assert_eq!(acc.confirmed(), "hello world");
        assert_eq!(acc.partial_count(), 4);
    }

    #[test]
    fn test_finalize_merges_leftover_stash() {
        let mut acc = TranscriptAccumulator::new();
        acc.commit("first segment");
        acc.set_stash("more");
        assert_eq!(acc.finalize(), "first segment more");
    }

    #[test]
    fn test_commit_ignores_whitespace_segments() {
        let mut acc = TranscriptAccumulator::new();
        acc.commit("   ");
        assert!(acc.is_empty());
        acc.commit("text");
        assert_eq!(acc.confirmed(), "text");
    }

    #[test]
    fn test_empty_finalize() {
        let acc = TranscriptAccumulator::new();
        assert_eq!(acc.finalize(), "");
        assert!(acc.is_empty());
    }
}
