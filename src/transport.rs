//! Reconnecting Socket.IO transport
//!
//! The WebSocket is split into sink and stream halves. All producers push
//! already-encoded frames into one channel; a single connection task owns
//! both halves, so frames go out in the order they were emitted. Inbound
//! events are published on a broadcast channel.
//!
//! The socket reconnects on its own with a bounded backoff. Whether the
//! *live session* is re-requested after a reconnect is decided one layer up,
//! in the lifecycle controller.

use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::protocol::{EnginePacket, OpenHandshake, SocketPacket};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Why the socket went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called locally
    ClientRequested,
    /// The server sent a Socket.IO disconnect or an Engine.IO close
    ServerDisconnect,
    /// The WebSocket closed underneath us
    TransportClosed,
    /// The server stopped answering pings
    PingTimeout,
    /// Read/write failure
    TransportError(String),
}

impl DisconnectReason {
    /// Disconnects that one of the two peers asked for, as opposed to drops.
    pub fn is_intentional(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ClientRequested | DisconnectReason::ServerDisconnect
        )
    }
}

/// Socket-level events.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket.IO namespace connected; `reconnect` is false for the first connection
    Connected { reconnect: bool },
    Disconnected(DisconnectReason),
    /// A named server event with its first argument (`null` when absent)
    Event { name: String, data: Value },
}

/// Event-named duplex channel used by the lifecycle controller.
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget emit.
    fn emit(&self, name: &str, data: Value) -> Result<()>;

    /// Emit with an acknowledgement; the receiver resolves with the ack arguments.
    fn emit_with_ack(&self, name: &str, data: Value) -> Result<oneshot::Receiver<Vec<Value>>>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn is_connected(&self) -> bool;

    /// Close the socket for good.
    fn close(&self);
}

/// Reconnection behaviour of the socket.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub url: String,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    /// Unlimited when `None`
    pub reconnect_attempts: Option<u32>,
}

impl TransportOptions {
    pub fn from_config(config: &LiveConfig) -> Result<Self> {
        Ok(Self {
            url: socket_url(&config.server_url)?,
            reconnect_delay: config.socket_reconnect_delay,
            reconnect_delay_max: config.socket_reconnect_delay_max,
            reconnect_attempts: config.socket_reconnect_attempts,
        })
    }

    /// Delay before reconnection attempt `attempt` (0-based), doubling up to the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.reconnect_delay_max)
    }
}

/// Build the Engine.IO WebSocket endpoint for a server base URL.
pub fn socket_url(server_url: &str) -> Result<String> {
    let trimmed = server_url.trim().trim_end_matches('/');
    let rest = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(LiveError::Config(format!(
            "server url must start with http(s):// or ws(s)://, got {:?}",
            server_url
        )));
    };
    Ok(format!("{}/socket.io/?EIO=4&transport=websocket", rest))
}

struct Shared {
    options: TransportOptions,
    events: broadcast::Sender<TransportEvent>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    acks: Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
    next_ack: AtomicU64,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Socket.IO v4 client over a WebSocket.
pub struct SocketIoTransport {
    shared: Arc<Shared>,
}

impl SocketIoTransport {
    /// Start the connection task. Returns immediately; progress is reported
    /// through [`Transport::subscribe`].
    pub fn connect(options: TransportOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            options,
            events,
            writer: Mutex::new(None),
            acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            shutdown,
        });

        tokio::spawn(supervise(shared.clone()));
        Self { shared }
    }

    fn send_frame(&self, packet: SocketPacket) -> Result<()> {
        let frame = EnginePacket::Message(packet).encode()?;
        let writer = self
            .shared
            .writer
            .lock()
            .map_err(|_| LiveError::ChannelClosed)?
            .clone();
        match writer {
            Some(tx) => tx.send(frame).map_err(|_| LiveError::NotConnected),
            None => Err(LiveError::NotConnected),
        }
    }
}

impl Transport for SocketIoTransport {
    fn emit(&self, name: &str, data: Value) -> Result<()> {
        self.send_frame(SocketPacket::event(name, data, None))
    }

    fn emit_with_ack(&self, name: &str, data: Value) -> Result<oneshot::Receiver<Vec<Value>>> {
        let id = self.shared.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared
            .acks
            .lock()
            .map_err(|_| LiveError::ChannelClosed)?
            .insert(id, tx);

        if let Err(e) = self.send_frame(SocketPacket::event(name, data, Some(id))) {
            if let Ok(mut acks) = self.shared.acks.lock() {
                acks.remove(&id);
            }
            return Err(e);
        }
        Ok(rx)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let _ = self.shared.shutdown.send_replace(true);
    }
}

impl Drop for SocketIoTransport {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send_replace(true);
    }
}

/// Connect, run, and reconnect until closed or out of attempts.
async fn supervise(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match run_connection(&shared, ever_connected, &mut shutdown).await {
            Ok(reason) => {
                ever_connected = true;
                attempt = 0;
                info!("🔌 Socket disconnected: {:?}", reason);
                let _ = shared.events.send(TransportEvent::Disconnected(reason.clone()));
                if reason == DisconnectReason::ClientRequested {
                    break;
                }
            }
            Err(e) => {
                warn!("Socket connection attempt {} failed: {}", attempt + 1, e);
            }
        }

        if let Some(max) = shared.options.reconnect_attempts {
            if attempt >= max {
                error!("Giving up on the socket after {} reconnection attempts", attempt);
                break;
            }
        }

        let delay = shared.options.backoff(attempt);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting socket in {:?}", delay);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!("Socket supervisor terminated");
}

/// One connection lifetime. `Err` means the connection was never established.
async fn run_connection(
    shared: &Arc<Shared>,
    reconnect: bool,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<DisconnectReason> {
    info!("Connecting to {}", shared.options.url);

    let (ws, _resp) = timeout(HANDSHAKE_TIMEOUT, connect_async(&shared.options.url))
        .await
        .map_err(|_| LiveError::Protocol("WebSocket connect timed out".to_string()))??;
    let (mut sink, mut stream) = ws.split();

    // Engine.IO open, then Socket.IO namespace connect.
    let open = timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match EnginePacket::decode(text.as_str())? {
                    EnginePacket::Open(open) => return Ok::<OpenHandshake, LiveError>(open),
                    other => debug!("Ignoring {:?} before open", other),
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(LiveError::WebSocket(e)),
                None => return Err(LiveError::NotConnected),
            }
        }
    })
    .await
    .map_err(|_| LiveError::Protocol("no Engine.IO open packet".to_string()))??;

    debug!("Engine.IO open: sid={} ping={}ms", open.sid, open.ping_interval);
    sink.send(Message::text(
        EnginePacket::Message(SocketPacket::Connect(None)).encode()?,
    ))
    .await?;

    timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match EnginePacket::decode(text.as_str())? {
                    EnginePacket::Message(SocketPacket::Connect(_)) => {
                        return Ok::<(), LiveError>(())
                    }
                    EnginePacket::Message(SocketPacket::ConnectError(data)) => {
                        return Err(LiveError::Protocol(format!("connect refused: {}", data)))
                    }
                    EnginePacket::Ping => {
                        sink.send(Message::text(EnginePacket::Pong.encode()?)).await?;
                    }
                    other => debug!("Ignoring {:?} before namespace connect", other),
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(LiveError::WebSocket(e)),
                None => return Err(LiveError::NotConnected),
            }
        }
    })
    .await
    .map_err(|_| LiveError::Protocol("namespace connect timed out".to_string()))??;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if let Ok(mut writer) = shared.writer.lock() {
        *writer = Some(tx);
    }
    shared.connected.store(true, Ordering::SeqCst);
    info!("🔌 Socket connected{}", if reconnect { " (reconnect)" } else { "" });
    let _ = shared.events.send(TransportEvent::Connected { reconnect });

    let ping_window = Duration::from_millis(open.ping_interval + open.ping_timeout);
    let mut ping_deadline = Instant::now() + ping_window;

    let reason = loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                if let Err(e) = sink.send(Message::text(frame)).await {
                    error!("Failed to send frame: {:?}", e);
                    break DisconnectReason::TransportError(e.to_string());
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match handle_frame(shared, text.as_str()) {
                            Ok(FrameAction::Continue) => {}
                            Ok(FrameAction::Pong) => {
                                ping_deadline = Instant::now() + ping_window;
                                if let Err(e) = sink.send(Message::text("3")).await {
                                    break DisconnectReason::TransportError(e.to_string());
                                }
                            }
                            Ok(FrameAction::Disconnect) => break DisconnectReason::ServerDisconnect,
                            Err(e) => warn!("Dropping malformed frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket closed: {:?}", frame);
                        break DisconnectReason::TransportClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {:?}", e);
                        break DisconnectReason::TransportError(e.to_string());
                    }
                    None => break DisconnectReason::TransportClosed,
                }
            }

            _ = tokio::time::sleep_until(ping_deadline) => {
                warn!("No ping from server within {:?}", ping_window);
                break DisconnectReason::PingTimeout;
            }

            _ = shutdown.changed() => {
                let _ = sink.send(Message::text("41")).await;
                let _ = sink.close().await;
                break DisconnectReason::ClientRequested;
            }
        }
    };

    shared.connected.store(false, Ordering::SeqCst);
    if let Ok(mut writer) = shared.writer.lock() {
        *writer = None;
    }
    // Pending acks can no longer be answered; dropping the senders wakes the waiters.
    if let Ok(mut acks) = shared.acks.lock() {
        acks.clear();
    }

    Ok(reason)
}

enum FrameAction {
    Continue,
    Pong,
    Disconnect,
}

fn handle_frame(shared: &Shared, text: &str) -> Result<FrameAction> {
    match EnginePacket::decode(text)? {
        EnginePacket::Ping => Ok(FrameAction::Pong),
        EnginePacket::Close => Ok(FrameAction::Disconnect),
        EnginePacket::Message(SocketPacket::Disconnect) => Ok(FrameAction::Disconnect),
        EnginePacket::Message(SocketPacket::Event { name, mut args, .. }) => {
            debug!("📥 {}", name);
            let data = if args.is_empty() {
                Value::Null
            } else {
                args.swap_remove(0)
            };
            let _ = shared.events.send(TransportEvent::Event { name, data });
            Ok(FrameAction::Continue)
        }
        EnginePacket::Message(SocketPacket::Ack { id, args }) => {
            let waiter = shared
                .acks
                .lock()
                .map_err(|_| LiveError::ChannelClosed)?
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(args);
                }
                None => debug!("Ack {} has no waiter", id),
            }
            Ok(FrameAction::Continue)
        }
        other => {
            debug!("Ignoring {:?}", other);
            Ok(FrameAction::Continue)
        }
    }
}
