//! Ordered playback of inbound audio segments
//!
//! Segments are queued as they arrive and played one at a time by a single
//! consumer task that owns the output device. Item N+1 is decoded only after
//! the sink returned from item N. A segment that fails to decode or play is
//! logged and skipped.

use crate::audio::encoder::{decode_pcm16_base64, pcm16_to_float};
use crate::error::{LiveError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Blocking audio output.
pub trait AudioSink: Send + 'static {
    /// Play mono samples and return once they have been played out.
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;
}

/// Sink without a device; takes as long as the audio would.
#[derive(Debug, Default)]
pub struct SilentSink;

impl AudioSink for SilentSink {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        if sample_rate > 0 {
            let micros = samples.len() as u64 * 1_000_000 / sample_rate as u64;
            std::thread::sleep(Duration::from_micros(micros));
        }
        Ok(())
    }
}

/// One inbound audio segment, still encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    /// Base64 little-endian 16-bit PCM
    pub audio: String,
    pub mime_type: Option<String>,
}

impl PlaybackItem {
    /// Rate announced in the mime type (`audio/pcm;rate=24000`), if any.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .as_deref()?
            .split(';')
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.parse().ok())
    }
}

/// FIFO playback with a single consumer.
pub struct PlaybackQueue {
    tx: mpsc::UnboundedSender<PlaybackItem>,
    pending: Arc<AtomicUsize>,
    consumer: JoinHandle<()>,
}

impl PlaybackQueue {
    /// Start the consumer. `sample_rate` is used when an item does not announce one.
    pub fn spawn(sink: Box<dyn AudioSink>, sample_rate: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let consumer = tokio::spawn(consume(rx, sink, sample_rate, pending.clone()));
        Self {
            tx,
            pending,
            consumer,
        }
    }

    pub fn enqueue(&self, item: PlaybackItem) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(LiveError::ChannelClosed);
        }
        Ok(())
    }

    /// Items queued or playing.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting items and wait until everything queued was played.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.consumer.await {
            error!("Playback task failed: {}", e);
        }
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<PlaybackItem>,
    sink: Box<dyn AudioSink>,
    default_rate: u32,
    pending: Arc<AtomicUsize>,
) {
    let mut sink = Some(sink);
    let mut played: u64 = 0;

    while let Some(item) = rx.recv().await {
        let samples: Vec<f32> = match decode_pcm16_base64(&item.audio) {
            Ok(pcm) => pcm.into_iter().map(pcm16_to_float).collect(),
            Err(e) => {
                warn!("Skipping undecodable audio segment: {}", e);
                pending.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
        };
        let rate = item.sample_rate().unwrap_or(default_rate);

        let Some(mut device) = sink.take() else {
            break;
        };
        let outcome = tokio::task::spawn_blocking(move || {
            let result = device.play(&samples, rate);
            (device, result)
        })
        .await;
        pending.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok((device, result)) => {
                sink = Some(device);
                match result {
                    Ok(()) => {
                        played += 1;
                        debug!("🔊 Played segment #{}", played);
                    }
                    Err(e) => warn!("Playback of a segment failed: {}", e),
                }
            }
            Err(e) => {
                error!("Audio output panicked, playback stopped: {}", e);
                break;
            }
        }
    }

    debug!("Playback consumer terminated after {} segments", played);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_event::AudioChunk;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// Records what was played and fails the test on overlap.
    struct RecordingSink {
        played: Arc<Mutex<Vec<(i16, u32)>>>,
        playing: Arc<AtomicBool>,
        fail_on: Option<i16>,
    }

    impl AudioSink for RecordingSink {
        fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
            assert!(
                !self.playing.swap(true, Ordering::SeqCst),
                "two segments played at once"
            );
            std::thread::sleep(Duration::from_millis(5));
            let marker = (samples[0] * 32767.0).round() as i16;
            self.played.lock().unwrap().push((marker, sample_rate));
            self.playing.store(false, Ordering::SeqCst);
            if Some(marker) == self.fail_on {
                return Err(LiveError::Playback("device busy".to_string()));
            }
            Ok(())
        }
    }

    fn item(marker: i16, mime_type: Option<&str>) -> PlaybackItem {
        PlaybackItem {
            audio: AudioChunk {
                pcm: vec![marker; 32],
                sample_rate: 24_000,
            }
            .to_base64(),
            mime_type: mime_type.map(str::to_string),
        }
    }

    fn recording(fail_on: Option<i16>) -> (Box<dyn AudioSink>, Arc<Mutex<Vec<(i16, u32)>>>) {
        let played = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            played: played.clone(),
            playing: Arc::new(AtomicBool::new(false)),
            fail_on,
        };
        (Box::new(sink), played)
    }

    #[tokio::test]
    async fn test_plays_every_item_in_order() {
        let (sink, played) = recording(None);
        let queue = PlaybackQueue::spawn(sink, 24_000);

        for marker in 1..=20 {
            queue.enqueue(item(marker * 100, None)).unwrap();
        }
        queue.close().await;

        let played = played.lock().unwrap();
        let markers: Vec<i16> = played.iter().map(|(m, _)| *m).collect();
        assert_eq!(markers, (1..=20).map(|m| m * 100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_bad_items_are_skipped() {
        let (sink, played) = recording(Some(200));
        let queue = PlaybackQueue::spawn(sink, 24_000);

        queue.enqueue(item(100, None)).unwrap();
        queue
            .enqueue(PlaybackItem {
                audio: "%%%".to_string(),
                mime_type: None,
            })
            .unwrap();
        queue.enqueue(item(200, None)).unwrap();
        queue.enqueue(item(300, None)).unwrap();
        queue.close().await;

        let markers: Vec<i16> = played.lock().unwrap().iter().map(|(m, _)| *m).collect();
        assert_eq!(markers, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_rate_from_mime_type() {
        let (sink, played) = recording(None);
        let queue = PlaybackQueue::spawn(sink, 24_000);

        queue.enqueue(item(100, Some("audio/pcm;rate=16000"))).unwrap();
        queue.enqueue(item(200, Some("audio/pcm"))).unwrap();
        queue.close().await;

        let played = played.lock().unwrap();
        assert_eq!(played[0], (100, 16_000));
        assert_eq!(played[1], (200, 24_000));
    }

    #[tokio::test]
    async fn test_pending_drains_to_zero() {
        let queue = PlaybackQueue::spawn(Box::new(SilentSink), 24_000);
        queue.enqueue(item(1, None)).unwrap();
        assert!(queue.pending() <= 1);

        let pending = queue.pending.clone();
        queue.close().await;
        assert_eq!(pending.load(Ordering::SeqCst), 0);
    }
}
