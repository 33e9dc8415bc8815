//! Engine tunables
//!
//! Timeouts and buffer sizes for the streaming pipeline. Everything has a
//! default the host never needs to touch; the section exists so slow
//! networks and unusual recognizer deployments can be accommodated without
//! an ABI change.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Streaming engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTunables {
    /// Recognizer connect + handshake timeout (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum stall on one audio send before the session is recycled (ms)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Post-EOS wait for the terminal hypothesis (ms)
    #[serde(default = "default_final_wait")]
    pub final_wait_ms: u64,

    /// Enhancement round-trip budget (ms)
    #[serde(default = "default_enhancer_timeout")]
    pub enhancer_timeout_ms: u64,

    /// Audio chunk length handed to recognizers (ms)
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,

    /// Pre-roll kept for seeding a fresh session (ms)
    #[serde(default = "default_preroll_ms")]
    pub preroll_ms: u64,

    /// Capacity of the capture-to-forwarder queue (ms of audio)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity_ms: u64,

    /// Consecutive reconnect failures tolerated before giving up
    #[serde(default = "default_reconnect_failures")]
    pub reconnect_max_failures: u32,

    /// Window within which failures count as consecutive (ms)
    #[serde(default = "default_reconnect_window")]
    pub reconnect_window_ms: u64,

    /// Peak amplitude below which a whole utterance is treated as silence
    #[serde(default = "default_silence_floor")]
    pub silence_floor: f32,
}

fn default_connect_timeout() -> u64 {
    5_000
}
fn default_send_timeout() -> u64 {
    500
}
fn default_final_wait() -> u64 {
    3_000
}
fn default_enhancer_timeout() -> u64 {
    10_000
}
fn default_chunk_ms() -> u64 {
    100
}
fn default_preroll_ms() -> u64 {
    300
}
fn default_queue_capacity() -> u64 {
    1_000
}
fn default_reconnect_failures() -> u32 {
    3
}
fn default_reconnect_window() -> u64 {
    2_000
}
fn default_silence_floor() -> f32 {
    0.001
}

impl Default for EngineTunables {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            send_timeout_ms: default_send_timeout(),
            final_wait_ms: default_final_wait(),
            enhancer_timeout_ms: default_enhancer_timeout(),
            chunk_ms: default_chunk_ms(),
            preroll_ms: default_preroll_ms(),
            queue_capacity_ms: default_queue_capacity(),
            reconnect_max_failures: default_reconnect_failures(),
            reconnect_window_ms: default_reconnect_window(),
            silence_floor: default_silence_floor(),
        }
    }
}

impl EngineTunables {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn final_wait(&self) -> Duration {
        Duration::from_millis(self.final_wait_ms)
    }

    pub fn enhancer_timeout(&self) -> Duration {
        Duration::from_millis(self.enhancer_timeout_ms)
    }

    pub fn reconnect_window(&self) -> Duration {
        Duration::from_millis(self.reconnect_window_ms)
    }

    /// Sanity-check relationships between the knobs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_ms == 0 || self.chunk_ms > 1_000 {
            return Err(ConfigError::InvalidValue {
                field: "engine.chunk_ms".into(),
                message: "chunk length must be within 1..=1000 ms".into(),
            });
        }
        if self.queue_capacity_ms < self.chunk_ms {
            return Err(ConfigError::InvalidValue {
                field: "engine.queue_capacity_ms".into(),
                message: "queue must hold at least one chunk".into(),
            });
        }
        if self.final_wait_ms < 200 {
            return Err(ConfigError::InvalidValue {
                field: "engine.final_wait_ms".into(),
                message: "final wait too low (minimum 200ms)".into(),
            });
        }
        if self.reconnect_max_failures == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.reconnect_max_failures".into(),
                message: "at least one reconnect attempt is required".into(),
            });
        }
        Ok(())
    }

    /// Queue capacity in whole chunks
    pub fn queue_capacity_chunks(&self) -> usize {
        (self.queue_capacity_ms / self.chunk_ms).max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let tunables = EngineTunables::default();
        assert!(tunables.validate().is_ok());
        assert_eq!(tunables.queue_capacity_chunks(), 10);
        assert_eq!(tunables.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let tunables = EngineTunables {
            chunk_ms: 0,
            ..Default::default()
        };
        assert!(tunables.validate().is_err());
    }
}
