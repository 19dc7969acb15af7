//! Media units flowing from the capturers to the session

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use std::time::Instant;

/// Which visual source produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualSource {
    Camera,
    Screen,
}

impl VisualSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisualSource::Camera => "camera",
            VisualSource::Screen => "screen",
        }
    }
}

/// Ordered slice of 16-bit mono PCM, in capture order.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Little-endian bytes, base64 encoded.
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(self.pcm.len() * 2);
        for sample in &self.pcm {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        B64.encode(bytes)
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.pcm.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// One letterboxed JPEG frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub jpeg: Vec<u8>,
    pub frame_id: u64,
    pub source: VisualSource,
    pub timestamp: Instant,
}

impl VideoFrame {
    pub fn mime_type(&self) -> &'static str {
        "image/jpeg"
    }

    pub fn to_base64(&self) -> String {
        B64.encode(&self.jpeg)
    }

    /// `data:image/jpeg;base64,...`, the form used for reference images.
    pub fn to_data_url(&self) -> String {
        data_url(self.mime_type(), &self.jpeg)
    }
}

pub fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, B64.encode(bytes))
}
