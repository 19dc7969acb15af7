//! Float <-> 16-bit PCM conversion and the outbound audio buffer
//!
//! The scaling is asymmetric: negative samples use 32768, the rest 32767.
//! The backend and the playback side use the same convention.

use crate::error::{LiveError, Result};
use crate::media_event::AudioChunk;
use base64::{engine::general_purpose::STANDARD as B64, Engine};

/// Convert one float sample to PCM, clamping to [-1, 1].
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Inverse of [`float_to_pcm16`].
pub fn pcm16_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Decode base64 little-endian PCM.
pub fn decode_pcm16_base64(data: &str) -> Result<Vec<i16>> {
    let bytes = B64.decode(data.trim())?;
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Decode(format!(
            "PCM payload has an odd byte count ({})",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Accumulates converted microphone samples until the next flush.
#[derive(Debug)]
pub struct AudioEncoder {
    buffer: Vec<i16>,
    sample_rate: u32,
}

impl AudioEncoder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            buffer: Vec::with_capacity(sample_rate as usize),
            sample_rate,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.buffer.extend(samples.iter().map(|s| float_to_pcm16(*s)));
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take everything buffered as one chunk; `None` when empty.
    pub fn flush(&mut self) -> Option<AudioChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(AudioChunk {
            pcm: std::mem::take(&mut self.buffer),
            sample_rate: self.sample_rate,
        })
    }

    /// Drop buffered samples without sending them.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_one_lsb() {
        let lsb = 1.0 / 32767.0;
        let mut sample = -1.0f32;
        while sample <= 1.0 {
            let back = pcm16_to_float(float_to_pcm16(sample));
            assert!(
                (back - sample).abs() <= lsb,
                "sample {} came back as {}",
                sample,
                back
            );
            sample += 0.000_731;
        }
    }

    #[test]
    fn test_scaling_extremes_and_clamping() {
        assert_eq!(float_to_pcm16(-1.0), -32768);
        assert_eq!(float_to_pcm16(1.0), 32767);
        assert_eq!(float_to_pcm16(0.0), 0);
        assert_eq!(float_to_pcm16(3.5), 32767);
        assert_eq!(float_to_pcm16(-7.0), -32768);
        assert_eq!(float_to_pcm16(f32::NAN), 0);

        assert_eq!(pcm16_to_float(-32768), -1.0);
        assert_eq!(pcm16_to_float(32767), 1.0);
    }

    #[test]
    fn test_flush_takes_buffer() {
        let mut encoder = AudioEncoder::new(16_000);
        assert!(encoder.flush().is_none());

        encoder.push(&[0.0, 0.5, -0.5]);
        encoder.push(&[1.0]);
        assert_eq!(encoder.len(), 4);

        let chunk = encoder.flush().unwrap();
        assert_eq!(chunk.pcm, vec![0, 16383, -16384, 32767]);
        assert_eq!(chunk.sample_rate, 16_000);
        assert!(encoder.is_empty());
        assert!(encoder.flush().is_none());
    }

    #[test]
    fn test_decode_pcm() {
        assert_eq!(decode_pcm16_base64("AQD+/w==").unwrap(), vec![1, -2]);
        assert!(matches!(decode_pcm16_base64("AQD+"), Err(LiveError::Decode(_))));
        assert!(matches!(decode_pcm16_base64("not base64!"), Err(LiveError::Base64(_))));
    }
}
