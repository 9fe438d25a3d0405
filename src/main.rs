//! # dualink
//!
//! Demo client: connects a `Transport` to an in-process echo peer, pings it
//! on both channels and logs every lifecycle and message event.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dualink_core::settings::{load_settings, load_settings_from_path};
use dualink_telemetry::{init_telemetry, TelemetryConfig};
use dualink_transport::{ChannelKind, MemoryAcceptor, MemoryConnector, Transport};
use serde_json::json;
use tracing::{debug, info, warn};

/// Dual-channel transport demo against a loopback echo peer.
#[derive(Parser, Debug)]
#[command(name = "dualink", about = "Dual-channel transport demo")]
struct Cli {
    /// Settings file. Defaults to `~/.dualink/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Connection target (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// Pings to send on each channel.
    #[arg(long, default_value_t = 3)]
    pings: u32,

    /// Emit JSON log lines.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    if let Some(url) = cli.url {
        settings.transport.url = url;
    }
    if cli.json {
        settings.logging.json = true;
    }
    settings.validate().context("Invalid settings")?;

    let telemetry = TelemetryConfig::from_settings(&settings.logging)?;
    init_telemetry(&telemetry)?;

    let (connector, acceptor) = MemoryConnector::new();
    let echo = tokio::spawn(run_echo_peer(acceptor));

    let transport = Transport::new(settings.transport.clone(), Arc::new(connector));
    let expected = cli.pings as usize * 2;
    let (echo_tx, mut echo_rx) = tokio::sync::mpsc::unbounded_channel();

    let _ = transport.on_ready(|| info!("transport ready"));
    let _ = transport.on_message(move |event, data| {
        info!(event, %data, "message received");
        let _ = echo_tx.send(());
    });
    let _ = transport.on_closed(|| info!("transport closed"));

    transport.connect().await.context("Failed to connect")?;
    info!(
        connection_id = %transport.connection_id(),
        url = %transport.settings().url,
        pings = cli.pings,
        "sending pings"
    );

    for seq in 0..cli.pings {
        transport.send_reliable("ping", &json!({ "seq": seq })).await?;
        transport
            .send_unreliable("position", &json!({ "seq": seq, "x": seq * 10, "y": seq * 5 }))
            .await?;
    }

    let all_echoed = async {
        for _ in 0..expected {
            if echo_rx.recv().await.is_none() {
                break;
            }
        }
    };

    tokio::select! {
        () = all_echoed => info!(count = expected, "all echoes received"),
        () = transport.closed() => warn!("transport closed before all echoes arrived"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl+c")?;
            info!("interrupted");
        }
    }

    transport.close();
    drop(transport);
    let _ = echo.await;

    info!("shutting down");
    Ok(())
}

/// Accept every connection the connector opens and write each payload back
/// on the channel it arrived on.
async fn run_echo_peer(mut acceptor: MemoryAcceptor) {
    while let Some(peer) = acceptor.accept().await {
        debug!(target_url = peer.target(), "echo peer accepted connection");
        loop {
            let (kind, payload) = tokio::select! {
                Some(payload) = peer.recv(ChannelKind::Reliable) => (ChannelKind::Reliable, payload),
                Some(payload) = peer.recv(ChannelKind::Unreliable) => (ChannelKind::Unreliable, payload),
                _ = peer.closed() => break,
            };
            if let Err(e) = peer.send(kind, payload) {
                warn!(channel = %kind, error = %e, "echo failed");
                break;
            }
        }
        debug!(target_url = peer.target(), "echo peer connection finished");
    }
}
