//! Live session lifecycle
//!
//! The controller owns the session id and the session state. State lives in a
//! `watch` channel so that waiters (`ensure_live`) are woken by the
//! transition itself. Outbound sends are refused unless the session is Live.

use crate::capture::CaptureIntent;
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::events::Notifier;
use crate::protocol::{ClientEvent, GenerationCompleted, ServerEvent, StatusAck};
use crate::session::SessionState;
use crate::transport::{DisconnectReason, Transport, TransportEvent};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TIMEOUT_MESSAGE: &str = "Connection timeout. Please try again.";

/// Owns one logical live session on top of a transport.
pub struct SessionController {
    transport: Arc<dyn Transport>,
    session_id: RwLock<String>,
    state: watch::Sender<SessionState>,
    server_events: broadcast::Sender<ServerEvent>,
    notifier: Notifier,
    intent: CaptureIntent,
    reconnect_delay: Duration,
    ack_timeout: Duration,
    connect_timeout: Duration,
    /// Bumped on every entry into Connecting; a deadline only ends its own attempt.
    attempt: AtomicU64,
    me: Weak<SessionController>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn Transport>,
        session_id: String,
        notifier: Notifier,
        intent: CaptureIntent,
        config: &LiveConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (server_events, _) = broadcast::channel(256);
        Arc::new_cyclic(|me| Self {
            transport,
            session_id: RwLock::new(session_id),
            state,
            server_events,
            notifier,
            intent,
            reconnect_delay: config.reconnect_delay,
            ack_timeout: config.ack_timeout,
            connect_timeout: config.connect_timeout,
            attempt: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    /// Start consuming transport events.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let rx = self.transport.subscribe();
        let controller = self.clone();
        // The socket may have connected before we subscribed.
        if self.transport.is_connected() {
            controller.clone().on_socket_connected();
        }
        tokio::spawn(controller.run(rx))
    }

    pub fn session_id(&self) -> String {
        self.session_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_default()
    }

    /// Replace the session id. Only meaningful while Disconnected.
    pub fn set_session_id(&self, id: String) {
        if let Ok(mut current) = self.session_id.write() {
            info!("Session id is now {}", id);
            *current = id;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Live
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Typed stream of server events, delivered after the lifecycle has reacted to them.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.server_events.subscribe()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Validated transition from whatever the current state is.
    pub fn transition(&self, to: SessionState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match state.transition(to) {
            Ok(next) => {
                info!("Session {} -> {}", state.as_str(), next.as_str());
                *state = next;
                true
            }
            Err(e) => {
                result = Err(e);
                false
            }
        });
        result
    }

    /// Transition only if the current state is `from`.
    fn transition_from(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from && from.can_transition_to(to) {
                info!("Session {} -> {}", from.as_str(), to.as_str());
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Enter Connecting from `from` and arm the connect deadline for this attempt.
    fn begin_connecting(&self, from: SessionState) -> bool {
        let mut attempt = 0;
        let entered = self.state.send_if_modified(|state| {
            if *state == from && from.can_transition_to(SessionState::Connecting) {
                info!("Session {} -> {}", from.as_str(), SessionState::Connecting.as_str());
                *state = SessionState::Connecting;
                attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
                true
            } else {
                false
            }
        });
        if entered {
            self.arm_connect_deadline(attempt);
        }
        entered
    }

    fn arm_connect_deadline(&self, attempt: u64) {
        let me = self.me.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(controller) = me.upgrade() else {
                return;
            };
            // Checked under the state lock so a newer attempt is never ended.
            let expired = controller.state.send_if_modified(|state| {
                if *state == SessionState::Connecting
                    && controller.attempt.load(Ordering::SeqCst) == attempt
                {
                    *state = SessionState::Disconnected;
                    true
                } else {
                    false
                }
            });
            if expired {
                warn!("Session did not go live within {:?}", timeout);
                controller.notifier.error(TIMEOUT_MESSAGE);
            }
        });
    }

    /// Request a live session. Single-flight: a no-op while Connecting or Live.
    ///
    /// Returns whether a new request was issued. An attempt that is not
    /// answered within `connect_timeout` falls back to Disconnected.
    pub fn connect(&self) -> bool {
        if !self.begin_connecting(SessionState::Disconnected) {
            debug!("Connect ignored, session is {}", self.state().as_str());
            return false;
        }
        self.emit_start();
        true
    }

    fn emit_start(&self) {
        if !self.transport.is_connected() {
            info!("Socket not connected yet, session start deferred until it is");
            return;
        }
        if let Err(e) = self.emit(ClientEvent::StartLiveSession) {
            warn!("Failed to request a live session: {}", e);
        }
    }

    /// Resolve `true` once Live, or `false` at the deadline.
    ///
    /// Issues a connect request when needed. A timed out attempt is abandoned
    /// (Connecting -> Disconnected) and reported to the user.
    pub async fn ensure_live(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        if *rx.borrow_and_update() == SessionState::Live {
            return true;
        }

        self.connect();

        let wait = rx.wait_for(|s| *s != SessionState::Connecting);
        let outcome = tokio::time::timeout(timeout, wait)
            .await
            .map(|r| r.map(|state| *state));
        match outcome {
            Ok(Ok(state)) => state == SessionState::Live,
            Ok(Err(_)) => false,
            Err(_) => {
                // The connect deadline may have ended the attempt first and reported it.
                if self.transition_from(SessionState::Connecting, SessionState::Disconnected) {
                    warn!("Session did not go live within {:?}", timeout);
                    self.notifier.error(TIMEOUT_MESSAGE);
                }
                self.is_live()
            }
        }
    }

    /// Stop the live session.
    pub fn disconnect(&self) {
        if let Err(e) = self.emit(ClientEvent::StopLiveSession) {
            debug!("Stop not sent: {}", e);
        }
        if self.state() != SessionState::Disconnected {
            let _ = self.transition(SessionState::Disconnected);
        }
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_live(ClientEvent::SendText {
            text: text.to_string(),
        })
    }

    pub fn send_text_with_images(&self, text: &str, images: Vec<String>) -> Result<()> {
        self.send_live(ClientEvent::SendMessageWithImages {
            text: text.to_string(),
            images,
        })
    }

    /// Send one base64 PCM chunk.
    pub fn send_audio_chunk(&self, audio: String) -> Result<()> {
        self.send_live(ClientEvent::SendAudio { audio })
    }

    /// Send one base64 JPEG frame.
    pub fn send_frame(&self, frame: String) -> Result<()> {
        self.send_live(ClientEvent::SendCameraFrame { frame })
    }

    /// Echo a tool result, correlated by `call_id`.
    pub fn send_function_result(&self, call_id: &str, mut result: GenerationCompleted) -> Result<()> {
        result.function_call_id = call_id.to_string();
        self.send_live(ClientEvent::GenerationCompleted(result))
    }

    fn send_live(&self, event: ClientEvent) -> Result<()> {
        if !self.is_live() {
            self.notifier
                .warn(format!("Not live, {} was not sent", event.name()));
            return Err(LiveError::NotLive);
        }
        self.emit(event)
    }

    fn emit(&self, event: ClientEvent) -> Result<()> {
        let payload = event.payload(&self.session_id());
        debug!("📤 {}", event.name());
        self.transport.emit(event.name(), payload)
    }

    async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<TransportEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.handle_transport_event(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Lifecycle lagged behind by {} transport events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Lifecycle loop terminated");
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { .. } => self.clone().on_socket_connected(),
            TransportEvent::Disconnected(reason) => self.on_socket_dropped(reason),
            TransportEvent::Event { name, data } => match ServerEvent::from_event(&name, data) {
                Ok(event) => {
                    debug!("📥 {}", event.name());
                    self.on_server_event(&event);
                    let _ = self.server_events.send(event);
                }
                Err(e) => warn!("Dropping malformed {} event: {}", name, e),
            },
        }
    }

    /// Resume a pending start, or ask the server whether our session survived.
    fn on_socket_connected(self: Arc<Self>) {
        if self.state() == SessionState::Connecting {
            self.emit_start();
            return;
        }

        let ack = match self.transport.emit_with_ack(
            ClientEvent::CheckSessionStatus.name(),
            ClientEvent::CheckSessionStatus.payload(&self.session_id()),
        ) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Session status check not sent: {}", e);
                return;
            }
        };

        tokio::spawn(async move {
            let args = match tokio::time::timeout(self.ack_timeout, ack).await {
                Ok(Ok(args)) => args,
                Ok(Err(_)) => return,
                Err(_) => {
                    warn!("Session status check timed out");
                    return;
                }
            };
            let status: StatusAck = args
                .into_iter()
                .next()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            debug!("Session status: active={} starting={}", status.active, status.starting);

            if status.active {
                if self.state() != SessionState::Live {
                    let _ = self.transition(SessionState::Live);
                }
            } else if status.starting {
                self.begin_connecting(SessionState::Disconnected);
            } else if self.state() == SessionState::Live {
                let _ = self.transition(SessionState::Disconnected);
            }
        });
    }

    fn on_socket_dropped(&self, reason: DisconnectReason) {
        if reason == DisconnectReason::ClientRequested {
            return;
        }
        if self.state() != SessionState::Live {
            return;
        }
        if !reason.is_intentional() && self.intent.is_active() {
            if self.begin_connecting(SessionState::Live) {
                self.notifier.warn("Connection lost, reconnecting...");
            }
        } else {
            self.transition_from(SessionState::Live, SessionState::Disconnected);
        }
    }

    fn on_server_event(self: &Arc<Self>, event: &ServerEvent) {
        match event {
            ServerEvent::SessionStarted(started) => {
                if self.state() != SessionState::Live {
                    let _ = self.transition(SessionState::Live);
                    match &started.user_name {
                        Some(name) => self.notifier.success(format!("Live session started for {}", name)),
                        None => self.notifier.success("Live session started"),
                    }
                }
            }
            ServerEvent::SessionEnded | ServerEvent::SessionStopped => {
                if self.state() != SessionState::Disconnected {
                    let _ = self.transition(SessionState::Disconnected);
                }
            }
            ServerEvent::SessionError(err) => {
                self.notifier.error(format!("Session error: {}", err.error));
                if self.state() == SessionState::Connecting {
                    let _ = self.transition(SessionState::Disconnected);
                }
            }
            ServerEvent::SessionEndedReconnect(_) => self.on_session_ended_reconnect(),
            _ => {}
        }
    }

    fn on_session_ended_reconnect(self: &Arc<Self>) {
        if !self.intent.is_active() {
            if self.state() != SessionState::Disconnected {
                let _ = self.transition(SessionState::Disconnected);
            }
            return;
        }

        // Only the caller that moves Live -> Connecting schedules the restart.
        if !self.begin_connecting(SessionState::Live) {
            debug!("Session restart already in progress");
            return;
        }
        self.notifier.warn("Session ended, reconnecting...");

        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(controller.reconnect_delay).await;
            if controller.state() == SessionState::Connecting {
                controller.emit_start();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureKind;
    use crate::events::NoticeLevel;
    use crate::transport::mock::MockTransport;
    use serde_json::json;

    fn controller(transport: &Arc<MockTransport>, intent: CaptureIntent) -> Arc<SessionController> {
        SessionController::new(
            transport.clone(),
            "session-1".to_string(),
            Notifier::new(),
            intent,
            &LiveConfig::default(),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_single_flight() {
        let transport = MockTransport::new(true);
        let controller = controller(&transport, CaptureIntent::default());
        controller.start();

        assert!(controller.connect());
        assert!(!controller.connect());
        assert_eq!(controller.state(), SessionState::Connecting);
        assert_eq!(transport.sent_named("start_live_session").len(), 1);
        assert_eq!(
            transport.sent_named("start_live_session")[0]["session_id"],
            "session-1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_live_resolves_on_transition() {
        let transport = MockTransport::new(true);
        let controller = controller(&transport, CaptureIntent::default());
        controller.start();
        settle().await;

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ensure_live(Duration::from_secs(30)).await })
        };
        settle().await;
        transport.server_event("live_session_started", json!({"status": "started"}));

        assert!(waiter.await.unwrap());
        assert!(controller.is_live());
        // Already live: immediate and no second request
        assert!(controller.ensure_live(Duration::from_secs(30)).await);
        assert_eq!(transport.sent_named("start_live_session").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_live_timeout_clears_guard() {
        let transport = MockTransport::new(true);
        let notifier = Notifier::new();
        let mut notices = notifier.subscribe();
        let controller = SessionController::new(
            transport.clone(),
            "session-1".to_string(),
            notifier,
            CaptureIntent::default(),
            &LiveConfig::default(),
        );
        controller.start();

        let started = tokio::time::Instant::now();
        assert!(!controller.ensure_live(Duration::from_secs(30)).await);
        assert!(started.elapsed() <= Duration::from_secs(31));
        assert_eq!(controller.state(), SessionState::Disconnected);

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.message, TIMEOUT_MESSAGE);

        // The guard is clear: a new attempt issues a new request
        assert!(controller.connect());
        assert_eq!(transport.sent_named("start_live_session").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_refused_unless_live() {
        let transport = MockTransport::new(true);
        let controller = controller(&transport, CaptureIntent::default());

        assert!(matches!(controller.send_text("hello"), Err(LiveError::NotLive)));
        assert!(matches!(
            controller.send_audio_chunk("AAA=".to_string()),
            Err(LiveError::NotLive)
        ));
        assert!(transport.sent().is_empty());

        controller.transition(SessionState::Live).unwrap();
        controller.send_text("hello").unwrap();
        let sent = transport.sent_named("send_text_message");
        assert_eq!(sent[0]["text"], "hello");
        assert_eq!(sent[0]["session_id"], "session-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_ack_restores_live_session() {
        let transport = MockTransport::new(false);
        transport.set_ack_reply("check_session_status", json!({"active": true}));
        let controller = controller(&transport, CaptureIntent::default());
        controller.start();

        transport.set_connected(true);
        transport.push(TransportEvent::Connected { reconnect: true });
        settle().await;

        assert_eq!(transport.sent_named("check_session_status").len(), 1);
        assert!(controller.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_with_capture_intent_requests_session_again() {
        let transport = MockTransport::new(true);
        let intent = CaptureIntent::default();
        intent.set(CaptureKind::Microphone, true);
        let controller = controller(&transport, intent);
        controller.start();
        settle().await;
        controller.transition(SessionState::Live).unwrap();

        transport.set_connected(false);
        transport.push(TransportEvent::Disconnected(DisconnectReason::PingTimeout));
        settle().await;
        assert_eq!(controller.state(), SessionState::Connecting);

        transport.set_connected(true);
        transport.push(TransportEvent::Connected { reconnect: true });
        settle().await;
        assert_eq!(transport.sent_named("start_live_session").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_connect_gives_up() {
        let transport = MockTransport::new(true);
        let notifier = Notifier::new();
        let mut notices = notifier.subscribe();
        let controller = SessionController::new(
            transport.clone(),
            "session-1".to_string(),
            notifier,
            CaptureIntent::default(),
            &LiveConfig::default(),
        );
        controller.start();
        settle().await;

        assert!(controller.connect());
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(controller.state(), SessionState::Connecting);
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(controller.state(), SessionState::Disconnected);

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.message, TIMEOUT_MESSAGE);
        assert!(controller.connect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_spares_a_later_attempt() {
        let transport = MockTransport::new(true);
        let controller = controller(&transport, CaptureIntent::default());
        controller.start();
        settle().await;

        assert!(controller.connect());
        tokio::time::sleep(Duration::from_secs(10)).await;
        controller.disconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(controller.connect());

        // The first attempt's deadline passes while the second is pending
        tokio::time::sleep(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(controller.state(), SessionState::Connecting);

        tokio::time::sleep(Duration::from_secs(16)).await;
        settle().await;
        assert_eq!(controller.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_reconnect_is_bounded() {
        let transport = MockTransport::new(true);
        let intent = CaptureIntent::default();
        intent.set(CaptureKind::Microphone, true);
        let controller = controller(&transport, intent);
        controller.start();
        settle().await;
        controller.transition(SessionState::Live).unwrap();

        transport.set_connected(false);
        transport.push(TransportEvent::Disconnected(DisconnectReason::PingTimeout));
        settle().await;
        assert_eq!(controller.state(), SessionState::Connecting);

        // The socket never comes back
        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(controller.state(), SessionState::Disconnected);
        assert!(transport.sent_named("start_live_session").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_session_restart_is_bounded() {
        let transport = MockTransport::new(true);
        let notifier = Notifier::new();
        let mut notices = notifier.subscribe();
        let intent = CaptureIntent::default();
        intent.set(CaptureKind::Camera, true);
        let controller = SessionController::new(
            transport.clone(),
            "session-1".to_string(),
            notifier,
            intent,
            &LiveConfig::default(),
        );
        controller.start();
        settle().await;
        controller.transition(SessionState::Live).unwrap();

        transport.server_event("session_ended_reconnect", json!({"session_id": "session-1", "can_resume": true}));
        settle().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(controller.state(), SessionState::Disconnected);
        assert_eq!(transport.sent_named("start_live_session").len(), 1);

        let mut messages = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            messages.push(notice.message);
        }
        assert_eq!(
            messages,
            vec!["Session ended, reconnecting...".to_string(), TIMEOUT_MESSAGE.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_intent_disconnects() {
        let transport = MockTransport::new(true);
        let controller = controller(&transport, CaptureIntent::default());
        controller.start();
        settle().await;
        controller.transition(SessionState::Live).unwrap();

        transport.push(TransportEvent::Disconnected(DisconnectReason::TransportClosed));
        settle().await;
        assert_eq!(controller.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_ended_reconnect_with_capture_intent() {
        let transport = MockTransport::new(true);
        let intent = CaptureIntent::default();
        intent.set(CaptureKind::Camera, true);
        let controller = controller(&transport, intent);
        controller.start();
        settle().await;
        controller.transition(SessionState::Live).unwrap();

        transport.server_event("session_ended_reconnect", json!({"session_id": "session-1", "can_resume": true}));
        transport.server_event("session_ended_reconnect", json!({"session_id": "session-1", "can_resume": true}));
        settle().await;
        assert_eq!(controller.state(), SessionState::Connecting);
        assert!(transport.sent_named("start_live_session").is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(transport.sent_named("start_live_session").len(), 1);

        transport.server_event("live_session_started", json!({"status": "reconnected"}));
        settle().await;
        assert!(controller.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_ended_reconnect_without_intent() {
        let transport = MockTransport::new(true);
        let controller = controller(&transport, CaptureIntent::default());
        controller.start();
        settle().await;
        controller.transition(SessionState::Live).unwrap();

        transport.server_event("session_ended_reconnect", json!({}));
        settle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.state(), SessionState::Disconnected);
        assert!(transport.sent_named("start_live_session").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_error_abandons_pending_start() {
        let transport = MockTransport::new(true);
        let controller = controller(&transport, CaptureIntent::default());
        controller.start();
        controller.connect();

        transport.server_event("live_session_error", json!({"error": "quota", "code": 429}));
        settle().await;
        assert_eq!(controller.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_function_result_carries_call_id() {
        let transport = MockTransport::new(true);
        let controller = controller(&transport, CaptureIntent::default());
        controller.transition(SessionState::Live).unwrap();

        controller
            .send_function_result(
                "call-42",
                GenerationCompleted {
                    kind: "image".to_string(),
                    id: json!(7),
                    function_call_id: String::new(),
                    user_request: "a cat".to_string(),
                },
            )
            .unwrap();
        let sent = transport.sent_named("generation_completed");
        assert_eq!(sent[0]["function_call_id"], "call-42");
        assert_eq!(sent[0]["type"], "image");
    }
}
