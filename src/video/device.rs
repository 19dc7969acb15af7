//! Screen (xcap) and camera (nokhwa) frame sources

use crate::error::{LiveError, Result};
use crate::video::FrameSource;
use image::DynamicImage;
#[cfg(feature = "capture")]
use image::RgbaImage;
#[cfg(feature = "camera")]
use image::RgbImage;
#[cfg(feature = "camera")]
use std::time::Duration;
use tracing::info;
#[cfg(feature = "camera")]
use tracing::warn;

/// Primary monitor, grabbed on demand.
#[cfg(feature = "capture")]
pub struct ScreenSource {
    monitor: xcap::Monitor,
}

#[cfg(feature = "capture")]
impl ScreenSource {
    pub fn open() -> Result<Self> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| LiveError::PermissionDenied(format!("screen capture unavailable: {}", e)))?;
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .or_else(|| monitors.first())
            .cloned()
            .ok_or_else(|| LiveError::Device("no monitors found".to_string()))?;

        info!(
            "🖥️ Sharing monitor {} ({}x{})",
            monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0)
        );
        Ok(Self { monitor })
    }
}

#[cfg(feature = "capture")]
impl FrameSource for ScreenSource {
    fn grab(&mut self) -> Result<DynamicImage> {
        let shot = self
            .monitor
            .capture_image()
            .map_err(|e| LiveError::Device(format!("screen grab failed: {}", e)))?;
        let (width, height) = (shot.width(), shot.height());
        let rgba = RgbaImage::from_raw(width, height, shot.into_raw())
            .ok_or_else(|| LiveError::Device("screen frame size mismatch".to_string()))?;
        Ok(DynamicImage::ImageRgba8(rgba))
    }
}

/// Camera stream on its own thread; `grab` returns the newest decoded frame.
///
/// The camera handle never leaves its thread. Dropping the source ends it.
#[cfg(feature = "camera")]
pub struct CameraSource {
    frames: std::sync::mpsc::Receiver<RgbImage>,
}

#[cfg(feature = "camera")]
impl CameraSource {
    pub fn open(index: u32) -> Result<Self> {
        use nokhwa::pixel_format::RgbFormat;
        use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
        use nokhwa::Camera;

        let (tx, frames) = std::sync::mpsc::sync_channel::<RgbImage>(1);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        std::thread::spawn(move || {
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
            let mut camera = match Camera::new(CameraIndex::Index(index), requested)
                .and_then(|mut cam| cam.open_stream().map(|_| cam))
            {
                Ok(camera) => camera,
                Err(e) => {
                    let _ = ready_tx.send(Err(LiveError::PermissionDenied(format!(
                        "camera unavailable: {}",
                        e
                    ))));
                    return;
                }
            };
            let format = camera.camera_format();
            info!(
                "📷 Camera {} streaming {}x{} @{}",
                index,
                format.resolution().width(),
                format.resolution().height(),
                format.frame_rate()
            );
            let _ = ready_tx.send(Ok(()));

            loop {
                let decoded = match camera.frame().and_then(|f| f.decode_image::<RgbFormat>()) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("Camera frame error: {}", e);
                        continue;
                    }
                };
                let (width, height) = (decoded.width(), decoded.height());
                let Some(frame) = RgbImage::from_raw(width, height, decoded.into_raw()) else {
                    continue;
                };
                match tx.try_send(frame) {
                    Ok(()) | Err(std::sync::mpsc::TrySendError::Full(_)) => {}
                    Err(std::sync::mpsc::TrySendError::Disconnected(_)) => break,
                }
            }
            let _ = camera.stop_stream();
            info!("📷 Camera {} released", index);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { frames }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LiveError::Device("camera thread exited".to_string())),
        }
    }
}

#[cfg(feature = "camera")]
impl FrameSource for CameraSource {
    fn grab(&mut self) -> Result<DynamicImage> {
        use std::sync::mpsc::RecvTimeoutError;
        match self.frames.recv_timeout(Duration::from_secs(2)) {
            Ok(frame) => Ok(DynamicImage::ImageRgb8(frame)),
            Err(RecvTimeoutError::Timeout) => Err(LiveError::Device("camera produced no frame".to_string())),
            Err(RecvTimeoutError::Disconnected) => Err(LiveError::SourceEnded),
        }
    }
}
