//! genmedia-live - terminal front end for the live client
//!
//! Type a message to talk to the model, or use one of the commands:
//! `/voice`, `/camera`, `/screen`, `/stop`, `/image <path>`, `/clear`, `/quit`.

use anyhow::Context;
use genmedia_live::{
    CaptureKind, HostDevices, HttpToolExecutor, LiveClient, LiveConfig, LiveEvent, NoticeLevel,
    SocketIoTransport, TransportOptions,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = LiveConfig::from_env().context("reading configuration")?;
    info!("Starting genmedia-live against {}", config.server_url);

    let transport = Arc::new(SocketIoTransport::connect(
        TransportOptions::from_config(&config).context("socket options")?,
    ));
    let executor = Arc::new(HttpToolExecutor::new(&config.server_url).context("tool executor")?);
    let devices = Arc::new(HostDevices { camera_index: 0 });

    let client = LiveClient::start(config, transport, devices, executor)
        .await
        .context("starting the live client")?;
    info!("Session {}", client.session_id());

    let mut notices = client.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            let marker = match notice.level {
                NoticeLevel::Info => "ℹ️",
                NoticeLevel::Success => "✅",
                NoticeLevel::Warning => "⚠️",
                NoticeLevel::Error => "❌",
            };
            println!("{} {}", marker, notice.message);
        }
    });

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LiveEvent::Text(text) => println!("🤖 {}", text),
                LiveEvent::StateChanged(state) => println!("🔌 {}", state.as_str()),
                LiveEvent::GenerationFinished { kind, url, .. } => {
                    println!("🎨 {} ready: {}", kind, url.unwrap_or_default())
                }
                LiveEvent::GenerationFailed { error, .. } => println!("💥 {}", error),
                _ => {}
            }
        }
    });

    println!("🎙️ genmedia-live. /voice /camera /screen /stop /image <path> /clear /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.trim();

        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => Ok(()),
            ("/quit", _) => break,
            ("/voice", _) if client.is_capturing(CaptureKind::Microphone) => {
                client.stop_voice();
                Ok(())
            }
            ("/voice", _) => client.start_voice().await,
            ("/camera", _) if client.is_capturing(CaptureKind::Camera) => {
                client.stop_camera();
                Ok(())
            }
            ("/camera", _) => client.start_camera().await,
            ("/screen", _) if client.is_capturing(CaptureKind::Screen) => {
                client.stop_screen_share();
                Ok(())
            }
            ("/screen", _) => client.start_screen_share().await,
            ("/stop", _) => {
                client.capture().stop_all();
                Ok(())
            }
            ("/image", path) => client.add_image(path.trim()).await.map(|_| ()),
            ("/clear", _) => client.clear().await.map(|id| info!("New session {}", id)),
            _ => client.send_message(line).await,
        };
        if let Err(e) = result {
            error!("{}", e);
        }
    }

    client.shutdown().await;
    Ok(())
}
