//! Sample codec
//!
//! Pure conversions between normalized f32 samples, little-endian PCM16 bytes,
//! and the base64 text carried inside JSON envelopes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Result, VoiceError};

/// Encode normalized samples as little-endian PCM16.
///
/// Samples are clamped to [-1, 1]. Negative values scale by 32768 and
/// non-negative values by 32767 so neither end overflows.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| sample_to_i16(s).to_le_bytes())
        .collect()
}

/// Decode little-endian PCM16 into normalized samples (divides by 32768).
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

pub fn to_transport_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_transport_text(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| VoiceError::Decode(format!("invalid base64: {}", e)))
}

/// Frame → wire text in one step
pub fn encode_frame(samples: &[f32]) -> String {
    to_transport_text(&encode_pcm16(samples))
}

/// Wire text → normalized samples in one step
pub fn decode_chunk(text: &str) -> Result<Vec<f32>> {
    decode_pcm16(&from_transport_text(text)?)
}

/// Clamp and scale one sample to i16 (asymmetric, see `encode_pcm16`)
pub fn sample_to_i16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    let s = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };

    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Average interleaved channels down to mono
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Root-mean-square energy of a frame (0.0 for an empty frame)
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asymmetric_scaling_extremes() {
        let bytes = encode_pcm16(&[-1.0, 1.0, 0.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![i16::MIN, i16::MAX, 0]);
    }

    #[test]
    fn test_out_of_range_samples_are_clamped() {
        let bytes = encode_pcm16(&[-3.5, 2.0, f32::NAN]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![-32768, 32767, 0]);
    }

    #[test]
    fn test_decode_divides_by_32768() {
        let bytes: Vec<u8> = [i16::MIN, 16384, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = decode_pcm16(&bytes).unwrap();
        assert_eq!(samples, vec![-1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_decode_odd_length_fails() {
        let err = decode_pcm16(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
    }

    #[test]
    fn test_pcm_roundtrip_within_quantization_step() {
        let input: Vec<f32> = (0..=2000).map(|i| -1.0 + i as f32 / 1000.0).collect();
        let output = decode_pcm16(&encode_pcm16(&input)).unwrap();
        assert_eq!(input.len(), output.len());
        for (a, b) in input.iter().zip(output.iter()) {
            // negative half and up to 0.5 stay within one step; the 32767/32768
            // scale mismatch adds at most half a step near positive full scale
            let step = 1.0 / 32768.0;
            let bound = if *a <= 0.5 { step } else { 1.5 * step };
            assert!((a - b).abs() <= bound + 1e-7, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_transport_text_roundtrip_all_lengths() {
        let data: Vec<u8> = (0..=255u8).collect();
        for len in [0, 1, 2, 3, 4, 5, 64, 255, 256] {
            let slice = &data[..len.min(data.len())];
            assert_eq!(from_transport_text(&to_transport_text(slice)).unwrap(), slice);
        }
    }

    #[test]
    fn test_transport_text_uses_classic_alphabet() {
        assert_eq!(to_transport_text(&[0xfb, 0xff]), "+/8=");
    }

    #[test]
    fn test_invalid_transport_text() {
        assert!(matches!(
            from_transport_text("not base64!"),
            Err(VoiceError::Decode(_))
        ));
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix_to_mono(&[0.2, 0.4, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono[1], 0.0);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }
}
