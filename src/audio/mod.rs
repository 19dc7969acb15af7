//! Audio: PCM conversion, ordered playback and host devices

pub mod encoder;
pub mod playback;

#[cfg(feature = "pulse")]
pub mod device;

use crate::error::Result;

pub use encoder::{decode_pcm16_base64, float_to_pcm16, pcm16_to_float, AudioEncoder};
pub use playback::{AudioSink, PlaybackItem, PlaybackQueue, SilentSink};

/// Blocking microphone source producing mono float samples in [-1, 1].
pub trait AudioSource: Send + 'static {
    /// Fill `buf` completely, blocking until enough samples were captured.
    fn read(&mut self, buf: &mut [f32]) -> Result<()>;
}
