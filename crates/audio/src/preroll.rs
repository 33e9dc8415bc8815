//! Pre-roll ring buffer
//!
//! Keeps the most recent few hundred milliseconds of captured audio so a
//! newly connected recognizer session can be seeded with the speech that
//! happened while its socket was still opening.

use std::collections::VecDeque;

use vhisper_core::encode_pcm_s16le;

/// Ring of recent samples at the stream rate.
pub struct PrerollRing {
    samples: VecDeque<f32>,
    max_samples: usize,
}

impl PrerollRing {
    /// Ring sized for `preroll_ms` at `sample_rate`.
    pub fn new(preroll_ms: u64, sample_rate: u32) -> Self {
        let max_samples = ((preroll_ms * u64::from(sample_rate)) / 1000).max(1) as usize;
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Append samples, evicting the oldest past capacity.
    pub fn extend(&mut self, block: &[f32]) {
        for &sample in block {
            if self.samples.len() == self.max_samples {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
        }
    }

    /// Take the buffered audio as one s16le block, leaving the ring empty.
    pub fn drain_pcm(&mut self) -> Vec<u8> {
        let samples: Vec<f32> = self.samples.drain(..).collect();
        encode_pcm_s16le(&samples)
    }

    /// Buffered duration in samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_most_recent() {
        // 1ms at 16kHz = 16 samples capacity
        let mut ring = PrerollRing::new(1, 16_000);
        let first: Vec<f32> = (0..16).map(|i| i as f32 / 100.0).collect();
        ring.extend(&first);
        assert_eq!(ring.len(), 16);

        ring.extend(&[0.5; 8]);
        assert_eq!(ring.len(), 16);
        let pcm = ring.drain_pcm();
        assert_eq!(pcm.len(), 32);
        // The tail must be the newest block
        let last = i16::from_le_bytes([pcm[30], pcm[31]]);
        assert_eq!(last, (0.5 * i16::MAX as f32) as i16);
    }

    #[test]
    fn test_drain_empties_ring() {
        let mut ring = PrerollRing::new(10, 16_000);
        ring.extend(&[0.1; 64]);
        assert!(!ring.is_empty());
        let _ = ring.drain_pcm();
        assert!(ring.is_empty());
        assert!(ring.drain_pcm().is_empty());
    }
}
