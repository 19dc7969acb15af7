//! Periodic frame sampling
//!
//! Every tick one frame is grabbed, letterboxed and JPEG encoded on the
//! blocking pool. Only one capture may be in flight: the owned permit is
//! held through the encode and released a short delay afterwards, so a slow
//! grab makes the following ticks skip rather than pile up.

use crate::capture::CaptureGate;
use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::lifecycle::SessionController;
use crate::media_event::{VideoFrame, VisualSource};
use crate::video::frame::{encode_jpeg, letterbox};
use crate::video::FrameSource;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::interval_at;
use tracing::{debug, error, info, warn};

/// Why a sampler loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerExit {
    /// The capture gate was closed
    Stopped,
    /// The source reported it ended
    SourceEnded,
}

pub struct FrameSampler {
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    kind: VisualSource,
    interval: Duration,
    dimension: u32,
    quality: u8,
    guard_release: Duration,
    in_flight: Arc<Semaphore>,
    frame_counter: Arc<AtomicU64>,
}

impl FrameSampler {
    pub fn new(source: Box<dyn FrameSource>, kind: VisualSource, config: &LiveConfig) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            kind,
            interval: config.frame_interval,
            dimension: config.frame_dimension,
            quality: config.jpeg_quality,
            guard_release: config.frame_guard_release,
            in_flight: Arc::new(Semaphore::new(1)),
            frame_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sample until the gate closes or the source ends.
    pub async fn run(
        self,
        gate: Arc<CaptureGate>,
        controller: Arc<SessionController>,
        last_frame: Arc<Mutex<Option<VideoFrame>>>,
    ) -> SamplerExit {
        info!("📹 Sampling {} every {:?}", self.kind.as_str(), self.interval);
        let mut ticker = interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<()>();

        loop {
            tokio::select! {
                _ = gate.closed() => return SamplerExit::Stopped,
                Some(()) = ended_rx.recv() => {
                    info!("📹 {} source ended", self.kind.as_str());
                    gate.close();
                    return SamplerExit::SourceEnded;
                }
                _ = ticker.tick() => {}
            }

            if !gate.is_open() {
                return SamplerExit::Stopped;
            }
            if !controller.is_live() {
                debug!("Session not live, frame skipped");
                continue;
            }
            let permit = match self.in_flight.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("Frame capture still in flight, tick skipped");
                    continue;
                }
            };

            tokio::spawn(capture_one(
                self.source.clone(),
                self.kind,
                self.dimension,
                self.quality,
                self.guard_release,
                self.frame_counter.clone(),
                permit,
                gate.clone(),
                controller.clone(),
                last_frame.clone(),
                ended_tx.clone(),
            ));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn capture_one(
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    kind: VisualSource,
    dimension: u32,
    quality: u8,
    guard_release: Duration,
    counter: Arc<AtomicU64>,
    permit: OwnedSemaphorePermit,
    gate: Arc<CaptureGate>,
    controller: Arc<SessionController>,
    last_frame: Arc<Mutex<Option<VideoFrame>>>,
    ended: mpsc::UnboundedSender<()>,
) {
    let job = tokio::task::spawn_blocking(move || {
        let image = source
            .lock()
            .map_err(|_| LiveError::Device("frame source lock poisoned".to_string()))?
            .grab()?;
        encode_jpeg(&letterbox(&image, dimension), quality)
    })
    .await;

    match job {
        Ok(Ok(jpeg)) => {
            let frame = VideoFrame {
                jpeg,
                frame_id: counter.fetch_add(1, Ordering::SeqCst),
                source: kind,
                timestamp: Instant::now(),
            };
            let size_kb = frame.jpeg.len() / 1024;
            let frame_id = frame.frame_id;
            let sent = gate.emit(|| {
                let result = controller.send_frame(frame.to_base64());
                // Only a frame the model actually saw can serve as reference.
                if result.is_ok() {
                    if let Ok(mut last) = last_frame.lock() {
                        *last = Some(frame);
                    }
                }
                result
            });
            match sent {
                Some(Ok(())) => debug!("📹 Sent {} frame #{} ({} KB)", kind.as_str(), frame_id, size_kb),
                Some(Err(e)) => debug!("Frame #{} not sent: {}", frame_id, e),
                None => debug!("Capture stopped, frame #{} dropped", frame_id),
            }
        }
        Ok(Err(LiveError::SourceEnded)) => {
            let _ = ended.send(());
        }
        Ok(Err(e)) => warn!("Frame capture failed: {}", e),
        Err(e) => error!("Frame capture task failed: {}", e),
    }

    tokio::time::sleep(guard_release).await;
    drop(permit);
}
