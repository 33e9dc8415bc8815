//! Audio chunk types and PCM helpers

/// The rate every recognizer session consumes. Device-native formats are
/// downmixed and resampled to this before they reach a session.
pub const STREAM_SAMPLE_RATE: u32 = 16_000;

/// One chunk of mono 16 kHz 16-bit little-endian PCM.
///
/// `offset_samples` is the chunk's position from stream start, measured in
/// samples at the stream rate, and increases monotonically for the lifetime
/// of a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Raw s16le payload
    pub pcm: Vec<u8>,
    /// Offset from stream start, in samples
    pub offset_samples: u64,
}

impl AudioChunk {
    pub fn new(pcm: Vec<u8>, offset_samples: u64) -> Self {
        Self {
            pcm,
            offset_samples,
        }
    }

    /// Number of samples in this chunk
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Chunk duration at the stream rate
    pub fn duration_ms(&self) -> u64 {
        (self.sample_count() as u64 * 1000) / STREAM_SAMPLE_RATE as u64
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}

/// Encode normalized f32 samples as 16-bit little-endian PCM.
pub fn encode_pcm_s16le(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * i16::MAX as f32) as i16;
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    pcm
}

/// Peak absolute amplitude of a sample block.
///
/// Used by the silence gate: a whole-utterance peak below the floor usually
/// means the process never got real microphone input.
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_duration() {
        // 100ms at 16kHz mono s16le = 3200 bytes
        let chunk = AudioChunk::new(vec![0u8; 3200], 0);
        assert_eq!(chunk.sample_count(), 1600);
        assert_eq!(chunk.duration_ms(), 100);
    }

    #[test]
    fn test_encode_pcm_clamps() {
        let pcm = encode_pcm_s16le(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(pcm.len(), 8);
        let max = i16::from_le_bytes([pcm[2], pcm[3]]);
        assert_eq!(max, i16::MAX);
        // Out-of-range input clamps rather than wrapping
        let clamped = i16::from_le_bytes([pcm[6], pcm[7]]);
        assert_eq!(clamped, i16::MAX);
    }

    #[test]
    fn test_peak_amplitude() {
        assert_eq!(peak_amplitude(&[]), 0.0);
        assert_eq!(peak_amplitude(&[0.1, -0.6, 0.3]), 0.6);
    }
}
