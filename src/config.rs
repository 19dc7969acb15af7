//! Client configuration
//!
//! Every constant the pipeline depends on lives here. The media constants
//! (sample rates, frame size) must match what the backend expects, so the
//! defaults should only be changed together with the server.

use crate::error::{LiveError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the live client
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Base URL of the backend (`http://`, `https://`, `ws://` or `wss://`)
    pub server_url: String,
    /// Application name reported to the audio server
    pub app_name: String,
    /// Display name used in notices
    pub user_name: String,
    /// Directory for the persisted session id; platform data dir when `None`
    pub state_dir: Option<PathBuf>,

    /// Microphone capture rate (mono)
    pub capture_sample_rate: u32,
    /// Samples read from the microphone per block
    pub capture_block_size: usize,
    /// Playback rate of inbound audio (mono)
    pub playback_sample_rate: u32,
    /// How often buffered microphone audio is flushed to the session
    pub audio_flush_interval: Duration,

    /// How often a video frame is sampled
    pub frame_interval: Duration,
    /// Side of the square frame sent to the backend
    pub frame_dimension: u32,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
    /// Delay between encode completion and releasing the frame guard
    pub frame_guard_release: Duration,

    /// Bound on waiting for a session to go live
    pub connect_timeout: Duration,
    /// Delay before re-requesting a session the server ended
    pub reconnect_delay: Duration,
    /// Timeout for acknowledged emits
    pub ack_timeout: Duration,

    /// Initial socket reconnection delay
    pub socket_reconnect_delay: Duration,
    /// Upper bound for the socket reconnection delay
    pub socket_reconnect_delay_max: Duration,
    /// Maximum socket reconnection attempts; unlimited when `None`
    pub socket_reconnect_attempts: Option<u32>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            app_name: "genmedia-live".to_string(),
            user_name: "User".to_string(),
            state_dir: None,
            capture_sample_rate: 16_000,
            capture_block_size: 4096,
            playback_sample_rate: 24_000,
            audio_flush_interval: Duration::from_millis(500),
            frame_interval: Duration::from_secs(2),
            frame_dimension: 768,
            jpeg_quality: 60,
            frame_guard_release: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(10),
            socket_reconnect_delay: Duration::from_secs(1),
            socket_reconnect_delay_max: Duration::from_secs(3),
            socket_reconnect_attempts: None,
        }
    }
}

impl LiveConfig {
    /// Build a configuration from the defaults plus `GENMEDIA_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("GENMEDIA_SERVER_URL") {
            config.server_url = url;
        }
        if let Some(dir) = lookup("GENMEDIA_STATE_DIR") {
            config.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(user) = lookup("GENMEDIA_USER") {
            config.user_name = user;
        }
        if let Some(ms) = lookup("GENMEDIA_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = parse_millis("GENMEDIA_CONNECT_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("GENMEDIA_AUDIO_FLUSH_MS") {
            config.audio_flush_interval = parse_millis("GENMEDIA_AUDIO_FLUSH_MS", &ms)?;
        }
        if let Some(ms) = lookup("GENMEDIA_FRAME_INTERVAL_MS") {
            config.frame_interval = parse_millis("GENMEDIA_FRAME_INTERVAL_MS", &ms)?;
        }

        Ok(config)
    }

    /// MIME type of the outbound PCM stream.
    pub fn capture_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.capture_sample_rate)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    let ms: u64 = value
        .trim()
        .parse()
        .map_err(|_| LiveError::Config(format!("{} must be milliseconds, got {:?}", key, value)))?;
    if ms == 0 {
        return Err(LiveError::Config(format!("{} must be greater than zero", key)));
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_backend_constants() {
        let config = LiveConfig::default();
        assert_eq!(config.capture_sample_rate, 16_000);
        assert_eq!(config.playback_sample_rate, 24_000);
        assert_eq!(config.frame_dimension, 768);
        assert_eq!(config.audio_flush_interval, Duration::from_millis(500));
        assert_eq!(config.frame_interval, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.capture_mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GENMEDIA_SERVER_URL", "https://example.test"),
            ("GENMEDIA_AUDIO_FLUSH_MS", "250"),
            ("GENMEDIA_STATE_DIR", "/tmp/genmedia"),
        ]
        .into_iter()
        .collect();

        let config = LiveConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.server_url, "https://example.test");
        assert_eq!(config.audio_flush_interval, Duration::from_millis(250));
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/genmedia")));
        assert_eq!(config.frame_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let result = LiveConfig::from_lookup(|k| {
            (k == "GENMEDIA_CONNECT_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(LiveError::Config(_))));

        let result = LiveConfig::from_lookup(|k| {
            (k == "GENMEDIA_FRAME_INTERVAL_MS").then(|| "0".to_string())
        });
        assert!(matches!(result, Err(LiveError::Config(_))));
    }
}
