//! Live client
//!
//! Wires the transport, the session lifecycle, media capture, playback and
//! tool dispatch into one object. A single dispatcher task consumes the
//! server events after the lifecycle has reacted to them.

use crate::audio::{AudioSink, PlaybackItem, PlaybackQueue, SilentSink};
use crate::capture::{CaptureIntent, CaptureKind, DeviceProvider, MediaCapture};
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::events::{LiveEvent, Notice, Notifier};
use crate::lifecycle::SessionController;
use crate::media_event::data_url;
use crate::protocol::ServerEvent;
use crate::session::{SessionIdStore, SessionState};
use crate::tools::{PendingFunctionCall, ToolContext, ToolExecutor};
use crate::transport::Transport;

use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Most images that can be attached at once.
pub const MAX_UPLOADED_IMAGES: usize = 14;

const VOICE_IMAGE_PROMPT: &str = "I have uploaded an image. Please look at it.";

/// Images the user attached, as data URLs.
type Uploads = Arc<Mutex<Vec<String>>>;

pub struct LiveClient {
    config: LiveConfig,
    store: SessionIdStore,
    transport: Arc<dyn Transport>,
    controller: Arc<SessionController>,
    capture: Arc<MediaCapture>,
    executor: Arc<dyn ToolExecutor>,
    playback: Arc<Mutex<Option<PlaybackQueue>>>,
    uploads: Uploads,
    events: broadcast::Sender<LiveEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveClient {
    /// Build the client and start its background tasks.
    ///
    /// The session id is loaded from (or minted into) the state directory.
    /// No live session is requested until the first send or capture.
    pub async fn start(
        config: LiveConfig,
        transport: Arc<dyn Transport>,
        devices: Arc<dyn DeviceProvider>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<Self> {
        let store = SessionIdStore::new(config.state_dir.as_deref())?;
        let session_id = store.load_or_create()?;
        info!("Using session {} ({})", session_id, store.path().display());

        let notifier = Notifier::new();
        let intent = CaptureIntent::default();
        let controller = SessionController::new(
            transport.clone(),
            session_id,
            notifier.clone(),
            intent.clone(),
            &config,
        );
        let capture = Arc::new(MediaCapture::new(
            devices.clone(),
            controller.clone(),
            intent,
            &config,
        ));

        let sink = open_speaker(devices, &config, &notifier).await;
        let playback = Arc::new(Mutex::new(Some(PlaybackQueue::spawn(
            sink,
            config.playback_sample_rate,
        ))));

        let (events, _) = broadcast::channel(256);
        let uploads: Uploads = Arc::new(Mutex::new(Vec::new()));

        // Subscribe before the lifecycle loop starts so nothing is missed.
        let server_events = controller.subscribe();
        let mut tasks = vec![controller.start()];

        let dispatcher = Dispatcher {
            controller: controller.clone(),
            capture: capture.clone(),
            executor: executor.clone(),
            playback: playback.clone(),
            uploads: uploads.clone(),
            events: events.clone(),
        };
        tasks.push(tokio::spawn(dispatcher.run(server_events)));
        tasks.push(tokio::spawn(forward_state(
            controller.watch_state(),
            events.clone(),
        )));

        Ok(Self {
            config,
            store,
            transport,
            controller,
            capture,
            executor,
            playback,
            uploads,
            events,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn session_id(&self) -> String {
        self.controller.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn capture(&self) -> &MediaCapture {
        &self.capture
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.controller.notifier().subscribe()
    }

    /// Request a live session without waiting for it.
    pub fn connect(&self) -> bool {
        self.controller.connect()
    }

    /// Send a chat message, bringing the session up first when needed.
    ///
    /// Uploaded images go along with the text.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let notifier = self.controller.notifier();
        if self.controller.state() == SessionState::Connecting {
            notifier.warn("Please wait, connecting...");
            return Err(LiveError::NotLive);
        }

        if !self.controller.ensure_live(self.config.connect_timeout).await {
            return Err(LiveError::ConnectTimeout);
        }

        let images = self.uploaded_images();
        let sent = if images.is_empty() {
            self.controller.send_text(text)
        } else {
            self.controller.send_text_with_images(text, images)
        };
        if sent.is_err() {
            notifier.error("Not connected. Please try again.");
        }
        sent
    }

    /// Start the microphone. Uploaded images are shown to the model first.
    pub async fn start_voice(&self) -> Result<()> {
        if !self.controller.ensure_live(self.config.connect_timeout).await {
            return Err(LiveError::ConnectTimeout);
        }
        let images = self.uploaded_images();
        if !images.is_empty() {
            if let Err(e) = self.controller.send_text_with_images(VOICE_IMAGE_PROMPT, images) {
                warn!("Uploaded images not sent: {}", e);
            }
        }
        self.capture.start_microphone().await
    }

    pub fn stop_voice(&self) {
        self.capture.stop_microphone();
    }

    pub async fn start_camera(&self) -> Result<()> {
        self.capture.start_camera().await
    }

    pub fn stop_camera(&self) {
        self.capture.stop_camera();
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.capture.start_screen_share().await
    }

    pub fn stop_screen_share(&self) {
        self.capture.stop_screen_share();
    }

    pub fn is_capturing(&self, kind: CaptureKind) -> bool {
        self.capture.is_active(kind)
    }

    /// Attach an image file to the following messages.
    pub async fn add_image(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let notifier = self.controller.notifier();
        let count = self.uploaded_count();
        if count >= MAX_UPLOADED_IMAGES {
            notifier.warn(format!("Max {} images. You have {}.", MAX_UPLOADED_IMAGES, count));
            return Err(LiveError::InvalidInput(format!(
                "at most {} images can be attached",
                MAX_UPLOADED_IMAGES
            )));
        }

        let bytes = tokio::fs::read(path).await?;
        let format = match image::guess_format(&bytes) {
            Ok(format) => format,
            Err(_) => {
                notifier.error("Please select only image files");
                return Err(LiveError::InvalidInput(format!(
                    "{} is not an image",
                    path.display()
                )));
            }
        };
        let url = data_url(format.to_mime_type(), &bytes);

        let count = {
            let mut uploads = self
                .uploads
                .lock()
                .map_err(|_| LiveError::InvalidInput("upload list poisoned".to_string()))?;
            uploads.push(url);
            uploads.len()
        };
        debug!("Attached {} ({} KB)", path.display(), bytes.len() / 1024);
        notifier.success(format!("{} image(s) ready", count));
        Ok(count)
    }

    /// Detach the image at `index`.
    pub fn remove_image(&self, index: usize) -> bool {
        let removed = match self.uploads.lock() {
            Ok(mut uploads) if index < uploads.len() => {
                uploads.remove(index);
                true
            }
            _ => false,
        };
        if removed {
            self.controller.notifier().info("Image removed");
        }
        removed
    }

    pub fn clear_images(&self) {
        clear_uploads(&self.uploads);
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploads.lock().map(|u| u.len()).unwrap_or(0)
    }

    fn uploaded_images(&self) -> Vec<String> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }

    /// Stop the live session and everything attached to it, then start over
    /// with a fresh session id.
    pub async fn clear(&self) -> Result<String> {
        self.capture.stop_all();
        self.controller.disconnect();

        let old_id = self.controller.session_id();
        if let Err(e) = self.executor.clear_session(&old_id).await {
            warn!("Server content of {} not cleared: {}", old_id, e);
        }

        self.clear_images();
        self.capture.clear_last_frame();

        let id = self.store.reset()?;
        self.controller.set_session_id(id.clone());
        self.controller.notifier().success("All cleared!");
        Ok(id)
    }

    /// Stop captures and the session, drain playback and close the socket.
    pub async fn shutdown(&self) {
        info!("🔌 Shutting down");
        self.capture.stop_all();
        self.controller.disconnect();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }

        let queue = self.playback.lock().ok().and_then(|mut q| q.take());
        if let Some(queue) = queue {
            queue.close().await;
        }
        self.transport.close();
    }
}

async fn open_speaker(
    devices: Arc<dyn DeviceProvider>,
    config: &LiveConfig,
    notifier: &Notifier,
) -> Box<dyn AudioSink> {
    let speaker_config = config.clone();
    match tokio::task::spawn_blocking(move || devices.open_speaker(&speaker_config)).await {
        Ok(Ok(sink)) => sink,
        Ok(Err(e)) => {
            notifier.warn("Audio output unavailable");
            warn!("🔊 Speaker not opened, replies stay silent: {}", e);
            Box::new(SilentSink)
        }
        Err(e) => {
            error!("🔊 Speaker open task failed: {}", e);
            Box::new(SilentSink)
        }
    }
}

fn clear_uploads(uploads: &Uploads) {
    if let Ok(mut uploads) = uploads.lock() {
        uploads.clear();
    }
}

async fn forward_state(
    mut state: tokio::sync::watch::Receiver<SessionState>,
    events: broadcast::Sender<LiveEvent>,
) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        let _ = events.send(LiveEvent::StateChanged(current));
    }
}

/// Reacts to server events on behalf of the client.
struct Dispatcher {
    controller: Arc<SessionController>,
    capture: Arc<MediaCapture>,
    executor: Arc<dyn ToolExecutor>,
    playback: Arc<Mutex<Option<PlaybackQueue>>>,
    uploads: Uploads,
    events: broadcast::Sender<LiveEvent>,
}

impl Dispatcher {
    async fn run(self, mut rx: broadcast::Receiver<ServerEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.handle(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dispatcher lagged, {} server events skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Dispatcher finished");
    }

    fn handle(&self, event: ServerEvent) {
        match event {
            ServerEvent::AudioResponse(response) => {
                let bytes = response.audio.len();
                let item = PlaybackItem {
                    audio: response.audio,
                    mime_type: response.mime_type,
                };
                let queued = match self.playback.lock() {
                    Ok(queue) => queue.as_ref().map(|q| q.enqueue(item)),
                    Err(_) => None,
                };
                match queued {
                    Some(Ok(())) => {
                        debug!("🔊 Queued {} bytes of audio", bytes);
                        let _ = self.events.send(LiveEvent::AudioQueued { bytes });
                    }
                    Some(Err(e)) => warn!("🔊 Audio dropped: {}", e),
                    None => debug!("🔊 Playback closed, audio dropped"),
                }
            }
            ServerEvent::TextResponse { text } => {
                let _ = self.events.send(LiveEvent::Text(text));
            }
            ServerEvent::GenerationRequest(request) => {
                let _ = self.events.send(LiveEvent::GenerationStarted(request.clone()));
                let call = PendingFunctionCall::from(request);
                self.controller.notifier().info(call.progress_message());
                tokio::spawn(run_tool(
                    call,
                    self.controller.clone(),
                    self.executor.clone(),
                    self.capture.clone(),
                    self.uploads.clone(),
                    self.events.clone(),
                ));
            }
            ServerEvent::SessionEnded => clear_uploads(&self.uploads),
            ServerEvent::SessionError(err) => {
                let _ = self.events.send(LiveEvent::SessionError(err));
            }
            ServerEvent::Unknown { name, .. } => debug!("Ignoring unknown event {}", name),
            _ => {}
        }
    }
}

/// Execute one tool call and echo its result under the original call id.
async fn run_tool(
    call: PendingFunctionCall,
    controller: Arc<SessionController>,
    executor: Arc<dyn ToolExecutor>,
    capture: Arc<MediaCapture>,
    uploads: Uploads,
    events: broadcast::Sender<LiveEvent>,
) {
    let mut ctx = ToolContext {
        session_id: controller.session_id(),
        reference_images: Vec::new(),
    };
    if call.refers_to_camera() {
        let uploaded = uploads.lock().map(|u| u.clone()).unwrap_or_default();
        ctx.reference_images = if uploaded.is_empty() {
            capture.last_frame_data_url().into_iter().collect()
        } else {
            uploaded
        };
        debug!("{} reference image(s) for {}", ctx.reference_images.len(), call.call_id);
    }

    // A file and an error may come back together; the file is still delivered.
    let (outcome, failure) = match executor.execute(&call, &ctx).await {
        Ok(outcome) => {
            let error = outcome.error.clone();
            (Some(outcome), error)
        }
        Err(e) => (None, Some(e.to_string())),
    };

    match outcome.as_ref().and_then(|o| o.completion_for(&call).map(|done| (o, done))) {
        Some((outcome, done)) => {
            let kind = done.kind.clone();
            let url = outcome
                .file
                .as_ref()
                .and_then(|file| file.location())
                .map(str::to_string);
            match controller.send_function_result(&call.call_id, done) {
                Ok(()) => {
                    info!("🛠️ {} finished ({})", call.function_name, call.call_id);
                    let _ = events.send(LiveEvent::GenerationFinished {
                        function_call_id: call.call_id.clone(),
                        kind,
                        url,
                    });
                }
                Err(e) => warn!("Result of {} not delivered: {}", call.call_id, e),
            }
        }
        None if failure.is_none() => debug!("{} produced no file", call.call_id),
        None => {}
    }

    if let Some(err) = failure {
        controller
            .notifier()
            .error(format!("{} failed: {}", call.function_name, err));
        let _ = events.send(LiveEvent::GenerationFailed {
            function_call_id: call.call_id,
            error: err,
        });
    }
}
