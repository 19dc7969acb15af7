//! Session identity and state
//!
//! A session id is a stable string persisted across restarts. The session
//! state is a small state machine; the "start pending" guard is the
//! `Connecting` state itself.

use crate::error::{LiveError, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Key under which the session id is persisted.
pub const SESSION_ID_KEY: &str = "genmedia_session_id";

const STATE_FILE: &str = "state.json";

/// Connection state of the logical live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Live,
}

impl SessionState {
    /// Whether `self -> to` is a legal transition.
    ///
    /// `Live -> Connecting` is the auto-reconnect path taken when the server
    /// ends a session while local capture is still wanted.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Disconnected, Live)
                | (Connecting, Live)
                | (Connecting, Disconnected)
                | (Live, Disconnected)
                | (Live, Connecting)
        )
    }

    /// Validate a transition, returning the target state.
    pub fn transition(self, to: SessionState) -> Result<SessionState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(LiveError::IllegalTransition { from: self, to })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Live => "Live",
        }
    }
}

/// Mint a fresh session id (`session-<unix millis>`).
pub fn new_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("session-{}", millis)
}

/// Durable key/value store holding the session id.
#[derive(Debug, Clone)]
pub struct SessionIdStore {
    path: PathBuf,
}

impl SessionIdStore {
    /// Store in `dir`, or in the platform data directory when `dir` is `None`.
    pub fn new(dir: Option<&Path>) -> Result<Self> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => directories::ProjectDirs::from("dev", "genmedia", "genmedia-live")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or_else(|| {
                    LiveError::Config("could not determine a data directory".to_string())
                })?,
        };
        Ok(Self {
            path: dir.join(STATE_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the persisted session id, minting and persisting one if absent.
    pub fn load_or_create(&self) -> Result<String> {
        let mut state = self.read_state();
        if let Some(id) = state.get(SESSION_ID_KEY).and_then(|v| v.as_str()) {
            if !id.is_empty() {
                debug!("Reusing persisted session id {}", id);
                return Ok(id.to_string());
            }
        }

        let id = new_session_id();
        state.insert(SESSION_ID_KEY.to_string(), Value::String(id.clone()));
        self.write_state(&state)?;
        info!("Minted new session id {}", id);
        Ok(id)
    }

    /// Replace the persisted session id with a fresh one.
    pub fn reset(&self) -> Result<String> {
        let mut state = self.read_state();
        let mut id = new_session_id();
        // Two resets within the same millisecond must still change the id.
        if state.get(SESSION_ID_KEY).and_then(|v| v.as_str()) == Some(id.as_str()) {
            id.push_str("-1");
        }
        state.insert(SESSION_ID_KEY.to_string(), Value::String(id.clone()));
        self.write_state(&state)?;
        info!("Session id reset to {}", id);
        Ok(id)
    }

    fn read_state(&self) -> Map<String, Value> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Ignoring unreadable state file {:?}: {}", self.path, e);
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        }
    }

    fn write_state(&self, state: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}
