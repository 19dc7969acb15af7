//! Letterboxing and JPEG encoding

use crate::error::Result;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, RgbImage};

/// Scale `image` to fit a `dimension` square, preserving aspect ratio, centred on black.
pub fn letterbox(image: &DynamicImage, dimension: u32) -> RgbImage {
    let mut canvas = RgbImage::new(dimension, dimension);
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || dimension == 0 {
        return canvas;
    }

    let scale = f64::min(
        dimension as f64 / width as f64,
        dimension as f64 / height as f64,
    );
    let scaled_w = ((width as f64 * scale).round() as u32).clamp(1, dimension);
    let scaled_h = ((height as f64 * scale).round() as u32).clamp(1, dimension);

    let resized = image
        .resize_exact(scaled_w, scaled_h, FilterType::Triangle)
        .to_rgb8();
    let x = (dimension - scaled_w) / 2;
    let y = (dimension - scaled_h) / 2;
    imageops::overlay(&mut canvas, &resized, x as i64, y as i64);
    canvas
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg = Vec::with_capacity(128 * 1024);
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    encoder.encode_image(image)?;
    Ok(jpeg)
}
