//! Quadio Server - headless device for Quadio multi-room sessions.
//!
//! Runs a device in host or guest role without a GUI: `host` loads audio
//! files into the session playlist and prints the session code; `join`
//! resolves a code over mDNS, connects, and renders the assigned channel.

mod config;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use quadio_core::net::discovery::{resolve_code, resolve_peer, SessionAdvertiser};
use quadio_core::net::ws;
use quadio_core::{ChannelMode, Device, EngineEvent, EventBridge, LinkKind, NullSink, PeerEvent};
use tokio::signal;

use crate::config::ServerConfig;

/// Quadio Server - headless LAN multi-room audio device.
#[derive(Parser, Debug)]
#[command(name = "quadio-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(
        short,
        long,
        default_value = "info",
        env = "QUADIO_LOG_LEVEL",
        global = true
    )]
    log_level: log::LevelFilter,

    /// Device label shown to other peers.
    #[arg(long, global = true)]
    label: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a session and print its 6-digit code.
    Host {
        /// Audio files to load into the playlist.
        #[arg(value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Start playing the first track once loaded.
        #[arg(long)]
        autoplay: bool,
    },
    /// Join a session by its 6-digit code.
    Join {
        /// Session code shown on the host.
        code: String,

        /// Which output channel this device renders.
        #[arg(long, value_enum, default_value_t = ChannelArg::Stereo)]
        channel: ChannelArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChannelArg {
    Stereo,
    Left,
    Right,
    Center,
    Sub,
}

impl From<ChannelArg> for ChannelMode {
    fn from(value: ChannelArg) -> Self {
        match value {
            ChannelArg::Stereo => ChannelMode::Stereo,
            ChannelArg::Left => ChannelMode::Left,
            ChannelArg::Right => ChannelMode::Right,
            ChannelArg::Center => ChannelMode::Center,
            ChannelArg::Sub => ChannelMode::Subwoofer,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Quadio Server v{}", env!("CARGO_PKG_VERSION"));

    let config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let label = args
        .label
        .or_else(hostname_label)
        .unwrap_or_else(|| "Quadio Device".to_string());

    let events = EventBridge::new(quadio_core::protocol_constants::EVENT_CHANNEL_CAPACITY);
    let device = Device::new(
        &label,
        config.to_engine_config(),
        Arc::new(NullSink::new()),
        Arc::clone(&events) as Arc<dyn quadio_core::EventEmitter>,
    )
    .context("Failed to build device")?;
    device.start();

    let advertise_ip = resolve_advertise_ip(&config)?;
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.bind_port);
    let server = ws::serve(Arc::clone(&device), bind)
        .await
        .context("Failed to start WebSocket listener")?;

    match args.command {
        Command::Host { files, autoplay } => {
            run_host(&device, &server, advertise_ip, files, autoplay).await?;
        }
        Command::Join { code, channel } => {
            run_guest(&device, &server, &events, advertise_ip, &code, channel.into()).await?;
        }
    }

    log::info!("Shutdown signal received, cleaning up...");
    device.leave_session().await;
    server.shutdown();
    log::info!("Shutdown complete");
    Ok(())
}

async fn run_host(
    device: &Arc<Device>,
    server: &ws::WsServer,
    advertise_ip: IpAddr,
    files: Vec<PathBuf>,
    autoplay: bool,
) -> Result<()> {
    if files.is_empty() {
        bail!("host mode needs at least one audio file");
    }

    let code = device
        .host_session(|_| false)
        .context("Failed to host session")?;

    let _advertiser = match SessionAdvertiser::for_session(&code, advertise_ip, server.addr.port())
    {
        Ok(advertiser) => Some(advertiser),
        Err(e) => {
            log::warn!("mDNS advertisement unavailable ({e}); share the address manually");
            None
        }
    };

    for path in &files {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "track".to_string());
        let title = path
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| name.clone());
        device.add_local_file(&name, &title, mime_for(path), Bytes::from(bytes));
        log::info!("Loaded {name}");
    }

    println!("Session code: {code}");
    println!(
        "Guests join with: quadio-server join {code} --channel <left|right|center|sub>  ({advertise_ip}:{})",
        server.addr.port()
    );

    if autoplay {
        device.play_track(0).await;
    }

    shutdown_signal().await;
    Ok(())
}

async fn run_guest(
    device: &Arc<Device>,
    server: &ws::WsServer,
    events: &Arc<EventBridge>,
    advertise_ip: IpAddr,
    code: &str,
    channel: ChannelMode,
) -> Result<()> {
    device.set_channel_mode(channel);

    let host_addr = resolve_code(code, Duration::from_secs(10))
        .await
        .context("Could not find that session on this network")?;
    log::info!("Session {code} resolved to {host_addr}");

    let link = ws::dial(device, host_addr, LinkKind::Control)
        .await
        .context("Could not reach the host")?;
    device.join_session(link);

    // Advertise our own listener so ASSIGN_DATA_SOURCE targets resolve and
    // the host can relay later guests through us.
    let _peer_advertiser =
        match SessionAdvertiser::for_peer(device.id(), advertise_ip, server.addr.port()) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                log::warn!("mDNS peer advertisement unavailable ({e})");
                None
            }
        };

    // React to relay reassignment: dial the named upstream with a
    // data-relay link while keeping the host control path open.
    let mut event_rx = events.subscribe();
    let relay_device = Arc::clone(device);
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if let EngineEvent::Peer(PeerEvent::DataSourceAssigned { target_id }) = event {
                match resolve_peer(&target_id, Duration::from_secs(10)).await {
                    Ok(addr) => match ws::dial(&relay_device, addr, LinkKind::DataRelay).await {
                        Ok(link) => relay_device.attach_upstream_data(link),
                        Err(e) => log::warn!("Relay dial to {target_id} failed: {e}"),
                    },
                    Err(e) => log::warn!("Could not resolve relay target {target_id}: {e}"),
                }
            }
        }
    });

    shutdown_signal().await;
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn resolve_advertise_ip(config: &ServerConfig) -> Result<IpAddr> {
    if let Some(ip) = config.advertise_ip {
        return Ok(ip);
    }
    local_ip_address::local_ip().context(
        "Failed to auto-detect local IP address. \
         Please specify QUADIO_ADVERTISE_IP or set advertise_ip in the config \
         to the address other devices can reach.",
    )
}

fn hostname_label() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

fn mime_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("ogg" | "oga") => "audio/ogg",
        Some("m4a" | "aac") => "audio/aac",
        _ => "application/octet-stream",
    }
}
