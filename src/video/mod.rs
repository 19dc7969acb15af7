//! Video: frame shaping, periodic sampling and host sources

pub mod frame;
pub mod sampler;

#[cfg(any(feature = "capture", feature = "camera"))]
pub mod device;

use crate::error::Result;
use image::DynamicImage;

pub use frame::{encode_jpeg, letterbox};
pub use sampler::{FrameSampler, SamplerExit};

/// Blocking source of still frames (camera or screen).
pub trait FrameSource: Send + 'static {
    /// Grab the current frame. `LiveError::SourceEnded` means the source is gone for good.
    fn grab(&mut self) -> Result<DynamicImage>;
}
