//! Format conversion: downmix and resample to the 16 kHz stream rate
//!
//! Microphones commonly deliver 44.1/48 kHz stereo; recognizers want 16 kHz
//! mono. Downsampling runs a short windowed-sinc low-pass first so sibilants
//! do not alias into the speech band, then interpolates linearly, which is
//! plenty for speech at dictation latencies.

use std::f32::consts::PI;

use vhisper_core::audio::STREAM_SAMPLE_RATE;

// Practical device-rate bounds; anything outside is a broken driver report.
const MIN_DEVICE_RATE: u32 = 2_000;
const MAX_DEVICE_RATE: u32 = 384_000;
const MAX_FIR_TAPS: usize = 129;

/// Average interleaved frames down to mono, applying `convert` per sample.
pub fn downmix_to_mono<T, F>(out: &mut Vec<f32>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        out.extend(data.iter().copied().map(&mut convert));
        return;
    }

    let mut acc = 0.0f32;
    let mut filled = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        filled += 1;
        if filled == channels {
            out.push(acc / channels as f32);
            acc = 0.0;
            filled = 0;
        }
    }
    if filled > 0 {
        out.push(acc / filled as f32);
    }
}

/// Resample mono samples from `device_rate` to the stream rate.
pub fn resample_to_stream_rate(input: &[f32], device_rate: u32) -> Vec<f32> {
    if input.is_empty() || device_rate == 0 || device_rate == STREAM_SAMPLE_RATE {
        return input.to_vec();
    }
    if !(MIN_DEVICE_RATE..=MAX_DEVICE_RATE).contains(&device_rate) {
        return input.to_vec();
    }

    let ratio = STREAM_SAMPLE_RATE as f32 / device_rate as f32;
    if device_rate > STREAM_SAMPLE_RATE {
        let filtered = low_pass(input, device_rate);
        linear_interpolate(&filtered, ratio)
    } else {
        linear_interpolate(input, ratio)
    }
}

fn linear_interpolate(input: &[f32], ratio: f32) -> Vec<f32> {
    let out_len = (input.len() as f32 * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f32 / ratio;
        let idx = pos.floor() as usize;
        let frac = pos - idx as f32;
        let sample = match (input.get(idx), input.get(idx + 1)) {
            (Some(&a), Some(&b)) => a * (1.0 - frac) + b * frac,
            (Some(&a), None) => a,
            _ => input.last().copied().unwrap_or(0.0),
        };
        out.push(sample);
    }
    out
}

fn low_pass(input: &[f32], device_rate: u32) -> Vec<f32> {
    let taps = tap_count(device_rate);
    if taps <= 1 {
        return input.to_vec();
    }
    let cutoff = (STREAM_SAMPLE_RATE as f32 * 0.5 / device_rate as f32).min(0.499);
    let coeffs = windowed_sinc(cutoff, taps);
    let half = taps / 2;

    let mut out = Vec::with_capacity(input.len());
    for n in 0..input.len() {
        let mut acc = 0.0f32;
        for (k, coeff) in coeffs.iter().enumerate() {
            if let Some(idx) = (n + k).checked_sub(half) {
                if let Some(sample) = input.get(idx) {
                    acc += sample * coeff;
                }
            }
        }
        out.push(acc);
    }
    out
}

// Short filter near 16 kHz devices, longer when collapsing 48 kHz.
fn tap_count(device_rate: u32) -> usize {
    let decimation = device_rate as f32 / STREAM_SAMPLE_RATE as f32;
    let mut taps = (decimation * 4.0).ceil().max(11.0) as usize;
    if taps % 2 == 0 {
        taps += 1;
    }
    taps.min(MAX_FIR_TAPS)
}

fn windowed_sinc(cutoff: f32, taps: usize) -> Vec<f32> {
    let m = (taps - 1) as f32;
    let mut coeffs = Vec::with_capacity(taps);
    for n in 0..taps {
        let centered = n as f32 - m / 2.0;
        let x = 2.0 * PI * cutoff * centered;
        let sinc = if centered == 0.0 {
            2.0 * cutoff
        } else {
            (2.0 * cutoff * x.sin()) / x
        };
        let hamming = 0.54 - 0.46 * ((2.0 * PI * n as f32) / m).cos();
        coeffs.push(sinc * hamming);
    }
    let sum: f32 = coeffs.iter().sum();
    if sum != 0.0 {
        for coeff in coeffs.iter_mut() {
            *coeff /= sum;
        }
    }
    coeffs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo_averages() {
        let mut out = Vec::new();
        downmix_to_mono(&mut out, &[0.2f32, 0.4, -0.2, -0.4], 2, |s| s);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_converts_i16() {
        let mut out = Vec::new();
        downmix_to_mono(&mut out, &[i16::MAX, 0], 1, |s| s as f32 / 32_768.0);
        assert_eq!(out.len(), 2);
        assert!(out[0] > 0.99);
    }

    #[test]
    fn test_identity_rate_is_passthrough() {
        let input = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_to_stream_rate(&input, STREAM_SAMPLE_RATE), input);
    }

    #[test]
    fn test_downsample_halves_length() {
        let input = vec![0.5f32; 3200];
        let out = resample_to_stream_rate(&input, 32_000);
        // 2:1 decimation within rounding slack
        assert!((out.len() as i64 - 1600).abs() <= 1);
    }

    #[test]
    fn test_upsample_doubles_length() {
        let input = vec![0.25f32; 800];
        let out = resample_to_stream_rate(&input, 8_000);
        assert!((out.len() as i64 - 1600).abs() <= 1);
    }

    #[test]
    fn test_dc_level_preserved_through_filter() {
        let input = vec![0.5f32; 4800];
        let out = resample_to_stream_rate(&input, 48_000);
        // Windowed-sinc taps are normalized, so DC should survive
        let mid = out[out.len() / 2];
        assert!((mid - 0.5).abs() < 0.01);
    }
}
