//! Events and user-visible notices published by the client

use crate::protocol::{GenerationRequest, SessionError};
use crate::session::SessionState;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Toast-style notification for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Single channel through which every failure and status message reaches the user.
///
/// Each notice is also written to the log at the matching level.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Info | NoticeLevel::Success => info!("🔔 {}", message),
            NoticeLevel::Warning => warn!("🔔 {}", message),
            NoticeLevel::Error => error!("🔔 {}", message),
        }
        // No subscribers is fine
        let _ = self.tx.send(Notice { level, message });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.notify(NoticeLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.notify(NoticeLevel::Success, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.notify(NoticeLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.notify(NoticeLevel::Error, message);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// High level events for whoever drives the client (UI, demo binary).
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Session state transition
    StateChanged(SessionState),
    /// Text from the model
    Text(String),
    /// An audio segment was queued for playback
    AudioQueued { bytes: usize },
    /// The model requested a tool call
    GenerationStarted(GenerationRequest),
    /// A tool call finished and its result was sent back
    GenerationFinished {
        function_call_id: String,
        kind: String,
        url: Option<String>,
    },
    /// A tool call failed; the session continues
    GenerationFailed {
        function_call_id: String,
        error: String,
    },
    /// The backend reported a session error
    SessionError(SessionError),
}
