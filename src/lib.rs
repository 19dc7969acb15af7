//! genmedia-live - real-time multimodal client for a generative-media backend
//!
//! Streams microphone audio and camera or screen frames into a live
//! conversation session over Socket.IO, plays the spoken replies, and runs
//! the image and video generation calls the model asks for.

#![forbid(unsafe_code)]

pub mod audio;
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod media_event;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;
pub mod video;

pub use capture::{CaptureKind, DeviceProvider, HostDevices, MediaCapture};
pub use client::LiveClient;
pub use config::LiveConfig;
pub use error::{LiveError, Result};
pub use events::{LiveEvent, Notice, NoticeLevel};
pub use session::SessionState;
pub use tools::{HttpToolExecutor, ToolExecutor};
pub use transport::{SocketIoTransport, Transport, TransportOptions};
