//! Pipeline states and host-visible events

use serde::{Deserialize, Serialize};

/// Pipeline state
///
/// Only `Idle` permits config replacement or destruction. The FFI layer
/// mirrors this into an atomic integer for lock-free reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// Nothing running, ready for `start_streaming`
    Idle,
    /// Capturing audio with a live (or reconnecting) recognizer session
    Recording,
    /// EOS sent, draining the terminal result
    Processing,
}

impl PipelineState {
    /// Integer encoding used across the C ABI (`-1` is reserved for an
    /// invalid handle on that side).
    pub fn as_i32(&self) -> i32 {
        match self {
            PipelineState::Idle => 0,
            PipelineState::Recording => 1,
            PipelineState::Processing => 2,
        }
    }

    /// True while a start-session is in flight
    pub fn is_streaming(&self) -> bool {
        matches!(self, PipelineState::Recording | PipelineState::Processing)
    }
}

/// Event delivered to the host callback.
///
/// For any moment of a session, `confirmed` followed by `stash` is the best
/// current estimate of the transcription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Incremental hypothesis: `confirmed` will not change again, `stash`
    /// may still be rewritten by the recognizer.
    Partial { confirmed: String, stash: String },
    /// Terminal hypothesis for one recognizer session. During
    /// auto-reconnect the host sees one `Final` per server segment; the
    /// last one closes the start-session.
    Final { text: String },
    /// Unrecoverable failure; the pipeline is back in `Idle`.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_encoding() {
        assert_eq!(PipelineState::Idle.as_i32(), 0);
        assert_eq!(PipelineState::Recording.as_i32(), 1);
        assert_eq!(PipelineState::Processing.as_i32(), 2);
    }

    #[test]
    fn test_is_streaming() {
        assert!(!PipelineState::Idle.is_streaming());
        assert!(PipelineState::Recording.is_streaming());
        assert!(PipelineState::Processing.is_streaming());
    }
}
