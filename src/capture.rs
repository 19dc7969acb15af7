//! Media capture: microphone, camera and screen
//!
//! Each running capture owns a [`CaptureGate`]. Everything a capture emits
//! goes through its gate, and the gate lock is held across the send, so once
//! `stop_*` returns nothing more from that capture reaches the session.
//!
//! The visual slot is single: camera and screen share replace each other.

use crate::audio::{AudioEncoder, AudioSink, AudioSource};
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::events::Notifier;
use crate::lifecycle::SessionController;
use crate::media_event::{VideoFrame, VisualSource};
use crate::video::{FrameSampler, FrameSource, SamplerExit};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Microphone,
    Camera,
    Screen,
}

impl CaptureKind {
    fn bit(self) -> u8 {
        match self {
            CaptureKind::Microphone => 0b001,
            CaptureKind::Camera => 0b010,
            CaptureKind::Screen => 0b100,
        }
    }

    fn visual_source(self) -> Option<VisualSource> {
        match self {
            CaptureKind::Microphone => None,
            CaptureKind::Camera => Some(VisualSource::Camera),
            CaptureKind::Screen => Some(VisualSource::Screen),
        }
    }
}

/// Which captures the user currently wants running. Shared with the
/// lifecycle controller, which uses it to decide whether to restart a session.
#[derive(Debug, Clone, Default)]
pub struct CaptureIntent(Arc<AtomicU8>);

impl CaptureIntent {
    pub fn set(&self, kind: CaptureKind, active: bool) {
        if active {
            self.0.fetch_or(kind.bit(), Ordering::SeqCst);
        } else {
            self.0.fetch_and(!kind.bit(), Ordering::SeqCst);
        }
    }

    pub fn contains(&self, kind: CaptureKind) -> bool {
        self.0.load(Ordering::SeqCst) & kind.bit() != 0
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }
}

/// Open/closed switch guarding every emission of one capture.
#[derive(Debug)]
pub struct CaptureGate {
    open: Mutex<bool>,
    closed: watch::Sender<bool>,
}

impl CaptureGate {
    pub fn new() -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            open: Mutex::new(true),
            closed,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.lock().map(|open| *open).unwrap_or(false)
    }

    /// Run `emit` if the gate is open, holding the gate across the call.
    pub fn emit<R>(&self, emit: impl FnOnce() -> R) -> Option<R> {
        let open = self.open.lock().ok()?;
        if !*open {
            return None;
        }
        Some(emit())
    }

    /// Close the gate. Waits for an emission in progress to finish.
    pub fn close(&self) {
        if let Ok(mut open) = self.open.lock() {
            *open = false;
        }
        self.closed.send_replace(true);
    }

    /// Resolves once the gate is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Host device access.
pub trait DeviceProvider: Send + Sync + 'static {
    fn open_microphone(&self, config: &LiveConfig) -> Result<Box<dyn AudioSource>>;
    fn open_camera(&self, config: &LiveConfig) -> Result<Box<dyn FrameSource>>;
    fn open_screen(&self, config: &LiveConfig) -> Result<Box<dyn FrameSource>>;
    fn open_speaker(&self, config: &LiveConfig) -> Result<Box<dyn AudioSink>>;
}

/// Devices of this machine, as far as the enabled features allow.
#[derive(Debug, Default)]
pub struct HostDevices {
    pub camera_index: u32,
}

impl DeviceProvider for HostDevices {
    fn open_microphone(&self, config: &LiveConfig) -> Result<Box<dyn AudioSource>> {
        #[cfg(feature = "pulse")]
        {
            let mic = crate::audio::device::PulseMicrophone::open(
                &config.app_name,
                config.capture_sample_rate,
            )?;
            Ok(Box::new(mic))
        }
        #[cfg(not(feature = "pulse"))]
        {
            let _ = config;
            Err(LiveError::Device(
                "microphone support requires the `pulse` feature".to_string(),
            ))
        }
    }

    fn open_camera(&self, config: &LiveConfig) -> Result<Box<dyn FrameSource>> {
        let _ = config;
        #[cfg(feature = "camera")]
        {
            Ok(Box::new(crate::video::device::CameraSource::open(
                self.camera_index,
            )?))
        }
        #[cfg(not(feature = "camera"))]
        {
            Err(LiveError::Device(format!(
                "camera {} unavailable, built without the `camera` feature",
                self.camera_index
            )))
        }
    }

    fn open_screen(&self, config: &LiveConfig) -> Result<Box<dyn FrameSource>> {
        let _ = config;
        #[cfg(feature = "capture")]
        {
            Ok(Box::new(crate::video::device::ScreenSource::open()?))
        }
        #[cfg(not(feature = "capture"))]
        {
            Err(LiveError::Device(
                "screen sharing requires the `capture` feature".to_string(),
            ))
        }
    }

    fn open_speaker(&self, config: &LiveConfig) -> Result<Box<dyn AudioSink>> {
        #[cfg(feature = "pulse")]
        {
            let speaker = crate::audio::device::PulseSpeaker::open(
                &config.app_name,
                config.playback_sample_rate,
            )?;
            Ok(Box::new(speaker))
        }
        #[cfg(not(feature = "pulse"))]
        {
            let _ = config;
            warn!("Built without the `pulse` feature, model audio will not be heard");
            Ok(Box::new(crate::audio::SilentSink))
        }
    }
}

struct CaptureHandle {
    kind: CaptureKind,
    gate: Arc<CaptureGate>,
    _task: JoinHandle<()>,
}

impl CaptureHandle {
    fn is_running(&self) -> bool {
        self.gate.is_open()
    }
}

/// Owns the running captures of one client.
pub struct MediaCapture {
    devices: Arc<dyn DeviceProvider>,
    controller: Arc<SessionController>,
    notifier: Notifier,
    intent: CaptureIntent,
    config: LiveConfig,
    microphone: Mutex<Option<CaptureHandle>>,
    visual: Mutex<Option<CaptureHandle>>,
    last_frame: Arc<Mutex<Option<VideoFrame>>>,
    /// Serializes starts; stops never wait on it.
    starting: tokio::sync::Mutex<()>,
}

impl MediaCapture {
    pub fn new(
        devices: Arc<dyn DeviceProvider>,
        controller: Arc<SessionController>,
        intent: CaptureIntent,
        config: &LiveConfig,
    ) -> Self {
        Self {
            devices,
            notifier: controller.notifier().clone(),
            controller,
            intent,
            config: config.clone(),
            microphone: Mutex::new(None),
            visual: Mutex::new(None),
            last_frame: Arc::new(Mutex::new(None)),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    /// Start streaming the microphone. Requires a live session.
    pub async fn start_microphone(&self) -> Result<()> {
        let _starting = self.starting.lock().await;
        if self.is_active(CaptureKind::Microphone) {
            debug!("Microphone already active");
            return Ok(());
        }

        if !self.controller.ensure_live(self.config.connect_timeout).await {
            return Err(LiveError::ConnectTimeout);
        }

        let source = match self
            .open_device(CaptureKind::Microphone, |devices, config| {
                devices.open_microphone(config)
            })
            .await
        {
            Ok(source) => source,
            Err(e) => {
                self.notifier.error("Failed to start voice");
                return Err(e);
            }
        };

        let gate = CaptureGate::new();
        let task = spawn_microphone(
            source,
            gate.clone(),
            self.controller.clone(),
            self.notifier.clone(),
            self.intent.clone(),
            &self.config,
        );
        self.install(
            &self.microphone,
            CaptureHandle {
                kind: CaptureKind::Microphone,
                gate,
                _task: task,
            },
        );
        self.notifier
            .success(format!("Listening, {}!", self.config.user_name));
        Ok(())
    }

    pub fn stop_microphone(&self) {
        if self.stop_slot(&self.microphone, CaptureKind::Microphone) {
            self.notifier.info("Mic off");
        }
    }

    /// Start sending camera frames, replacing a screen share.
    pub async fn start_camera(&self) -> Result<()> {
        self.start_visual(CaptureKind::Camera).await
    }

    pub fn stop_camera(&self) {
        if self.stop_slot(&self.visual, CaptureKind::Camera) {
            self.notifier.info("Camera off");
        }
    }

    /// Start sending screen frames, replacing the camera.
    pub async fn start_screen_share(&self) -> Result<()> {
        self.start_visual(CaptureKind::Screen).await
    }

    pub fn stop_screen_share(&self) {
        if self.stop_slot(&self.visual, CaptureKind::Screen) {
            self.notifier.info("Screen sharing stopped");
        }
    }

    /// Stop every capture.
    pub fn stop_all(&self) {
        self.stop_microphone();
        self.stop_camera();
        self.stop_screen_share();
    }

    pub fn is_active(&self, kind: CaptureKind) -> bool {
        let slot = match kind {
            CaptureKind::Microphone => &self.microphone,
            CaptureKind::Camera | CaptureKind::Screen => &self.visual,
        };
        slot.lock()
            .map(|slot| {
                slot.as_ref()
                    .is_some_and(|handle| handle.kind == kind && handle.is_running())
            })
            .unwrap_or(false)
    }

    /// Whether any capture is running.
    pub fn capture_active(&self) -> bool {
        self.intent.is_active()
    }

    /// Data URL of the most recent frame sent, camera or screen.
    pub fn last_frame_data_url(&self) -> Option<String> {
        self.last_frame
            .lock()
            .ok()?
            .as_ref()
            .map(|frame| frame.to_data_url())
    }

    pub fn clear_last_frame(&self) {
        if let Ok(mut last) = self.last_frame.lock() {
            *last = None;
        }
    }

    async fn start_visual(&self, kind: CaptureKind) -> Result<()> {
        let (failed, started) = match kind {
            CaptureKind::Camera => ("Camera failed", "Camera on"),
            _ => ("Screen share failed", "Screen sharing"),
        };
        let source_kind = kind
            .visual_source()
            .ok_or_else(|| LiveError::Device(format!("{:?} is not a visual source", kind)))?;

        let _starting = self.starting.lock().await;
        if self.is_active(kind) {
            debug!("{:?} already active", kind);
            return Ok(());
        }

        // A visual capture may start before the session is live; frames are
        // skipped until it is.
        if !self.controller.ensure_live(self.config.connect_timeout).await {
            warn!("Starting {:?} without a live session", kind);
        }

        // Single visual slot: the other source goes first.
        let other = match kind {
            CaptureKind::Camera => CaptureKind::Screen,
            _ => CaptureKind::Camera,
        };
        match other {
            CaptureKind::Screen => self.stop_screen_share(),
            _ => self.stop_camera(),
        }

        let source = match self
            .open_device(kind, move |devices, config| match kind {
                CaptureKind::Camera => devices.open_camera(config),
                _ => devices.open_screen(config),
            })
            .await
        {
            Ok(source) => source,
            Err(e) => {
                self.notifier.error(failed);
                return Err(e);
            }
        };

        let gate = CaptureGate::new();
        let sampler = FrameSampler::new(source, source_kind, &self.config);
        let task = {
            let gate = gate.clone();
            let controller = self.controller.clone();
            let last_frame = self.last_frame.clone();
            let intent = self.intent.clone();
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                if sampler.run(gate, controller, last_frame).await == SamplerExit::SourceEnded {
                    intent.set(kind, false);
                    notifier.info(match kind {
                        CaptureKind::Screen => "Screen sharing stopped",
                        _ => "Camera off",
                    });
                }
            })
        };
        self.install(
            &self.visual,
            CaptureHandle {
                kind,
                gate,
                _task: task,
            },
        );
        self.notifier.success(started);
        Ok(())
    }

    /// Open a device on the blocking pool.
    async fn open_device<T, F>(&self, kind: CaptureKind, open: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DeviceProvider, &LiveConfig) -> Result<T> + Send + 'static,
    {
        let devices = self.devices.clone();
        let config = self.config.clone();
        let opened = tokio::task::spawn_blocking(move || open(devices.as_ref(), &config))
            .await
            .map_err(|e| LiveError::Device(format!("device open task failed: {}", e)))?;

        match &opened {
            Ok(_) => info!("Opened {:?}", kind),
            Err(e) => error!("Could not open {:?}: {}", kind, e),
        }
        opened
    }

    fn install(&self, slot: &Mutex<Option<CaptureHandle>>, handle: CaptureHandle) {
        let kind = handle.kind;
        if let Ok(mut slot) = slot.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.gate.close();
            }
        }
        self.intent.set(kind, true);
    }

    /// Close and drop the slot's capture if it is of `kind`. Returns whether one was running.
    fn stop_slot(&self, slot: &Mutex<Option<CaptureHandle>>, kind: CaptureKind) -> bool {
        let handle = match slot.lock() {
            Ok(mut slot) if slot.as_ref().is_some_and(|h| h.kind == kind) => slot.take(),
            _ => None,
        };
        match handle {
            Some(handle) => {
                let was_running = handle.is_running();
                handle.gate.close();
                self.intent.set(kind, false);
                debug!("Stopped {:?}", kind);
                was_running
            }
            None => false,
        }
    }
}

impl Drop for MediaCapture {
    fn drop(&mut self) {
        for slot in [&self.microphone, &self.visual] {
            if let Ok(mut slot) = slot.lock() {
                if let Some(handle) = slot.take() {
                    handle.gate.close();
                }
            }
        }
    }
}

fn spawn_microphone(
    mut source: Box<dyn AudioSource>,
    gate: Arc<CaptureGate>,
    controller: Arc<SessionController>,
    notifier: Notifier,
    intent: CaptureIntent,
    config: &LiveConfig,
) -> JoinHandle<()> {
    let (tx, rx) = mpsc::unbounded_channel::<Vec<f32>>();
    let block_size = config.capture_block_size;
    let reader_gate = gate.clone();

    // Blocking reads run on their own thread.
    std::thread::spawn(move || {
        let mut block = vec![0f32; block_size];
        while reader_gate.is_open() {
            match source.read(&mut block) {
                Ok(()) => {
                    if tx.send(block.clone()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if reader_gate.is_open() {
                        reader_gate.close();
                        intent.set(CaptureKind::Microphone, false);
                        notifier.error(format!("Microphone stopped: {}", e));
                    }
                    break;
                }
            }
        }
        debug!("🎤 Microphone reader finished");
    });

    tokio::spawn(run_audio_flush(
        rx,
        gate,
        controller,
        config.audio_flush_interval,
        config.capture_sample_rate,
    ))
}

/// Buffer microphone blocks and send them every `flush_interval`.
async fn run_audio_flush(
    mut rx: mpsc::UnboundedReceiver<Vec<f32>>,
    gate: Arc<CaptureGate>,
    controller: Arc<SessionController>,
    flush_interval: Duration,
    sample_rate: u32,
) {
    let mut encoder = AudioEncoder::new(sample_rate);
    let mut ticker = interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
    let mut chunks: u64 = 0;

    loop {
        tokio::select! {
            _ = gate.closed() => break,
            block = rx.recv() => match block {
                Some(samples) => encoder.push(&samples),
                None => break,
            },
            _ = ticker.tick() => {
                if !controller.is_live() {
                    if !encoder.is_empty() {
                        debug!("Session not live, dropping {} buffered samples", encoder.len());
                        encoder.clear();
                    }
                    continue;
                }
                let Some(chunk) = encoder.flush() else {
                    continue;
                };
                let samples = chunk.pcm.len();
                let audio = chunk.to_base64();
                match gate.emit(|| controller.send_audio_chunk(audio)) {
                    Some(Ok(())) => {
                        chunks += 1;
                        debug!("🎤 Sent chunk #{} ({} samples)", chunks, samples);
                    }
                    Some(Err(e)) => debug!("Audio chunk not sent: {}", e),
                    None => break,
                }
            }
        }
    }

    debug!("Audio flush loop finished after {} chunks", chunks);
}


#[cfg(test)]
mod tests {
    use super::testing::MockDevices;
    use super::*;
    use crate::events::NoticeLevel;
    use crate::session::SessionState;
    use crate::transport::mock::MockTransport;

    fn fast_config() -> LiveConfig {
        LiveConfig {
            audio_flush_interval: Duration::from_millis(40),
            frame_interval: Duration::from_millis(20),
            frame_dimension: 32,
            frame_guard_release: Duration::from_millis(1),
            capture_block_size: 64,
            connect_timeout: Duration::from_millis(200),
            ..LiveConfig::default()
        }
    }

    fn setup(devices: MockDevices) -> (Arc<MockTransport>, Arc<SessionController>, MediaCapture) {
        let transport = MockTransport::new(true);
        let intent = CaptureIntent::default();
        let config = fast_config();
        let controller = SessionController::new(
            transport.clone(),
            "session-1".to_string(),
            Notifier::new(),
            intent.clone(),
            &config,
        );
        controller.transition(SessionState::Live).unwrap();
        let capture = MediaCapture::new(Arc::new(devices), controller.clone(), intent, &config);
        (transport, controller, capture)
    }

    #[test]
    fn test_capture_intent_bits() {
        let intent = CaptureIntent::default();
        assert!(!intent.is_active());
        intent.set(CaptureKind::Camera, true);
        intent.set(CaptureKind::Microphone, true);
        assert!(intent.contains(CaptureKind::Camera));
        intent.set(CaptureKind::Camera, false);
        assert!(!intent.contains(CaptureKind::Camera));
        assert!(intent.is_active());
        intent.set(CaptureKind::Microphone, false);
        assert!(!intent.is_active());
    }

    #[test]
    fn test_gate_refuses_after_close() {
        let gate = CaptureGate::new();
        assert_eq!(gate.emit(|| 1), Some(1));
        gate.close();
        assert_eq!(gate.emit(|| 2), None);
        assert!(!gate.is_open());
    }

    #[tokio::test]
    async fn test_gate_close_waits_for_emission_in_flight() {
        let gate = CaptureGate::new();
        let emitted = Arc::new(AtomicU8::new(0));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let emitter = {
            let gate = gate.clone();
            let emitted = emitted.clone();
            std::thread::spawn(move || {
                gate.emit(|| {
                    entered_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(50));
                    emitted.store(1, Ordering::SeqCst);
                })
            })
        };
        entered_rx.recv().unwrap();
        gate.close();
        // close() returned, so the emission that held the gate is complete
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
        assert!(emitter.join().unwrap().is_some());
        gate.closed().await;
    }

    #[tokio::test]
    async fn test_no_audio_after_stop() {
        let (transport, _controller, capture) = setup(MockDevices::default());

        capture.start_microphone().await.unwrap();
        assert!(capture.capture_active());

        for _ in 0..100 {
            if transport.sent_named("send_audio").len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        capture.stop_microphone();
        let sent = transport.sent_named("send_audio").len();
        assert!(sent >= 2);
        assert!(!capture.capture_active());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.sent_named("send_audio").len(), sent);
    }

    #[tokio::test]
    async fn test_camera_and_screen_replace_each_other() {
        let (_transport, _controller, capture) = setup(MockDevices::default());

        capture.start_screen_share().await.unwrap();
        assert!(capture.is_active(CaptureKind::Screen));

        capture.start_camera().await.unwrap();
        assert!(capture.is_active(CaptureKind::Camera));
        assert!(!capture.is_active(CaptureKind::Screen));
        assert!(!capture.intent.contains(CaptureKind::Screen));

        capture.start_screen_share().await.unwrap();
        assert!(capture.is_active(CaptureKind::Screen));
        assert!(!capture.is_active(CaptureKind::Camera));

        // Stopping the inactive kind is a no-op
        capture.stop_camera();
        assert!(capture.is_active(CaptureKind::Screen));
    }

    #[tokio::test]
    async fn test_denied_camera_leaves_no_state() {
        let devices = MockDevices {
            deny_camera: true,
            ..MockDevices::default()
        };
        let (_transport, controller, capture) = setup(devices);
        let mut notices = controller.notifier().subscribe();

        let result = capture.start_camera().await;
        assert!(matches!(result, Err(LiveError::PermissionDenied(_))));
        assert!(!capture.is_active(CaptureKind::Camera));
        assert!(!capture.capture_active());
        assert!(controller.is_live());

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.message, "Camera failed");
    }

    #[tokio::test]
    async fn test_repeated_start_opens_device_once() {
        let devices = Arc::new(MockDevices::default());
        let transport = MockTransport::new(true);
        let intent = CaptureIntent::default();
        let config = fast_config();
        let controller = SessionController::new(
            transport.clone(),
            "session-1".to_string(),
            Notifier::new(),
            intent.clone(),
            &config,
        );
        controller.transition(SessionState::Live).unwrap();
        let capture = MediaCapture::new(devices.clone(), controller, intent, &config);

        let (a, b) = tokio::join!(capture.start_camera(), capture.start_camera());
        a.unwrap();
        b.unwrap();
        assert_eq!(devices.camera_opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_flushes_on_interval() {
        let transport = MockTransport::new(true);
        let controller = SessionController::new(
            transport.clone(),
            "session-1".to_string(),
            Notifier::new(),
            CaptureIntent::default(),
            &LiveConfig::default(),
        );
        controller.transition(SessionState::Live).unwrap();
        let gate = CaptureGate::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_audio_flush(
            rx,
            gate.clone(),
            controller,
            Duration::from_millis(500),
            16_000,
        ));

        tx.send(vec![0.5; 4096]).unwrap();
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(transport.sent_named("send_audio").is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(transport.sent_named("send_audio").len(), 1);

        // Empty buffer: nothing at the next tick
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.sent_named("send_audio").len(), 1);

        tx.send(vec![-0.5; 4096]).unwrap();
        tx.send(vec![0.25; 4096]).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let sent = transport.sent_named("send_audio");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["session_id"], "session-1");
        let pcm = crate::audio::decode_pcm16_base64(sent[1]["audio"].as_str().unwrap()).unwrap();
        assert_eq!(pcm.len(), 8192);

        gate.close();
    }
}
