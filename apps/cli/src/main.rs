//! Resonate CLI - reference controller/player client.
//!
//! Discovers a server (or dials an explicit URL), runs the handshake as a
//! `controller`+`player`+`metadata` client, issues one transport command
//! and exits - or stays attached in `listen` mode, printing state updates
//! and counting audio frames.
//!
//! Exit codes: 0 normal, 1 protocol error, 2 discovery failure.

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::Notify;
use tokio::time::timeout;

use resonate_core::discovery::DiscoveryRecord;
use resonate_core::protocol::messages::{
    AudioFormat, ClientHello, Codec, ControllerCommand, ControllerCommandKind, DeviceInfo,
    GoodbyeReason, GroupUpdate, PlayerFormatRequest, PlayerSupport, Role, ServerState,
    StreamRequestFormat, StreamStart,
};
use resonate_core::protocol_constants::{PROTOCOL_VERSION, SERVICE_TYPE_SERVER};
use resonate_core::{ClientDelegate, ClientSession, CloseReason, Endpoint, TimedFrame};

/// Resonate CLI - control and monitor a Resonate server.
#[derive(Parser, Debug)]
#[command(name = "resonate-cli")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URL (e.g. ws://192.168.1.10:8927/resonate). Discovered via
    /// mDNS when omitted.
    #[arg(short, long, env = "RESONATE_SERVER")]
    server: Option<String>,

    /// Listener name announced to the server.
    #[arg(short, long, default_value = "Resonate CLI", env = "RESONATE_NAME")]
    name: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "warn", env = "RESONATE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List servers advertised on the local network.
    Discover,
    /// Start or resume playback in this listener's group.
    Play,
    /// Pause playback.
    Pause,
    /// Stop playback.
    Stop,
    /// Skip to the next track.
    Next,
    /// Return to the previous track.
    Previous,
    /// Set the group volume.
    Volume {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: u8,
    },
    /// Toggle or set group mute.
    Mute {
        /// "on" or "off"; toggles when omitted.
        #[arg(value_parser = parse_on_off)]
        state: Option<bool>,
    },
    /// Cycle this listener through available groups (join/create).
    Switch,
    /// Request a different stream format.
    RequestFormat {
        #[arg(long)]
        codec: Option<String>,
        #[arg(long)]
        sample_rate: Option<u32>,
        #[arg(long)]
        channels: Option<u8>,
        #[arg(long)]
        bit_depth: Option<u8>,
    },
    /// Stay connected and print state updates and stream statistics.
    Listen,
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected 'on' or 'off', got '{other}'")),
    }
}

/// How long to browse for servers before giving up.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(3);

/// How long to wait for the handshake to complete.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for command acknowledgements before exiting.
const SETTLE: Duration = Duration::from_millis(300);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    if matches!(args.command, Command::Discover) {
        return discover_and_print().await;
    }

    let url = match args.server.clone() {
        Some(url) => url,
        None => match first_server().await {
            Some(record) => record.ws_url(),
            None => {
                eprintln!("no Resonate server found on the local network");
                return Ok(ExitCode::from(2));
            }
        },
    };

    let delegate = Arc::new(CliDelegate::new(matches!(args.command, Command::Listen)));
    let session = ClientSession::connect(&url, hello(&args.name), Arc::clone(&delegate) as Arc<dyn ClientDelegate>);

    if timeout(CONNECT_TIMEOUT, delegate.connected.notified())
        .await
        .is_err()
    {
        eprintln!("handshake with {url} did not complete");
        session.disconnect();
        return Ok(ExitCode::from(1));
    }

    let result = match &args.command {
        Command::Discover => unreachable!("handled above"),
        Command::Play => transport(&session, ControllerCommandKind::Play),
        Command::Pause => transport(&session, ControllerCommandKind::Pause),
        Command::Stop => transport(&session, ControllerCommandKind::Stop),
        Command::Next => transport(&session, ControllerCommandKind::Next),
        Command::Previous => transport(&session, ControllerCommandKind::Previous),
        Command::Volume { level } => session.send_command(ControllerCommand {
            command: ControllerCommandKind::Volume,
            volume: Some(*level),
            mute: None,
        }),
        Command::Mute { state } => session.send_command(ControllerCommand {
            command: ControllerCommandKind::Mute,
            volume: None,
            mute: *state,
        }),
        Command::Switch => transport(&session, ControllerCommandKind::Switch),
        Command::RequestFormat {
            codec,
            sample_rate,
            channels,
            bit_depth,
        } => {
            let codec = match codec.as_deref() {
                Some("opus") => Some(Codec::Opus),
                Some("flac") => Some(Codec::Flac),
                Some("pcm") => Some(Codec::Pcm),
                Some(other) => {
                    eprintln!("unknown codec '{other}' (expected opus, flac or pcm)");
                    session.goodbye(GoodbyeReason::UserRequest);
                    return Ok(ExitCode::from(1));
                }
                None => None,
            };
            session.request_format(StreamRequestFormat {
                player: Some(PlayerFormatRequest {
                    codec,
                    channels: *channels,
                    sample_rate: *sample_rate,
                    bit_depth: *bit_depth,
                }),
                artwork: None,
            })
        }
        Command::Listen => {
            println!("listening; Ctrl+C to exit");
            tokio::signal::ctrl_c().await.ok();
            delegate.print_stats();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("command failed: {e}");
        session.goodbye(GoodbyeReason::UserRequest);
        return Ok(ExitCode::from(1));
    }

    tokio::time::sleep(SETTLE).await;
    session.goodbye(GoodbyeReason::UserRequest);
    Ok(ExitCode::SUCCESS)
}

fn transport(
    session: &ClientSession,
    command: ControllerCommandKind,
) -> resonate_core::ResonateResult<()> {
    session.send_command(ControllerCommand {
        command,
        volume: None,
        mute: None,
    })
}

fn hello(name: &str) -> ClientHello {
    ClientHello {
        client_id: format!("cli-{}", uuid_suffix()),
        name: name.to_string(),
        device_info: Some(DeviceInfo {
            product_name: Some("Resonate CLI".to_string()),
            manufacturer: None,
            software_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        version: PROTOCOL_VERSION,
        supported_roles: vec![Role::Controller, Role::Player, Role::Metadata],
        player_support: Some(PlayerSupport {
            support_formats: vec![AudioFormat {
                codec: Codec::Pcm,
                channels: 2,
                sample_rate: 48_000,
                bit_depth: 16,
            }],
            buffer_capacity: 262_144,
            supported_commands: vec![],
        }),
        artwork_support: None,
        visualizer_support: None,
    }
}

/// Host-qualified suffix keeping concurrent CLI invocations distinct.
fn uuid_suffix() -> String {
    let pid = std::process::id();
    let host = hostname_label();
    format!("{host}-{pid}")
}

fn hostname_label() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Delegate
// ─────────────────────────────────────────────────────────────────────────────

struct CliDelegate {
    verbose: bool,
    connected: Notify,
    audio_frames: AtomicU64,
    audio_bytes: AtomicU64,
}

impl CliDelegate {
    fn new(verbose: bool) -> Self {
        Self {
            verbose,
            connected: Notify::new(),
            audio_frames: AtomicU64::new(0),
            audio_bytes: AtomicU64::new(0),
        }
    }

    fn print_stats(&self) {
        println!(
            "received {} audio frame(s), {} byte(s)",
            self.audio_frames.load(Ordering::Relaxed),
            self.audio_bytes.load(Ordering::Relaxed)
        );
    }
}

impl ClientDelegate for CliDelegate {
    fn on_connected(&self, endpoint: &Arc<Endpoint>) {
        if let Some(hello) = endpoint.server_hello() {
            println!("connected to {} ({})", hello.name, hello.server_id);
        }
        // notify_one stores a permit, so a handshake that completes before
        // the main task starts waiting is not lost.
        self.connected.notify_one();
    }

    fn on_group_update(&self, update: &GroupUpdate) {
        if !self.verbose {
            return;
        }
        if let Some(state) = update.playback_state.value() {
            println!("playback: {state:?}");
        }
        if let Some(name) = update.group_name.value() {
            println!("group: {name}");
        }
    }

    fn on_server_state(&self, state: &ServerState) {
        if !self.verbose {
            return;
        }
        if let Some(controller) = &state.controller {
            println!(
                "volume: {}{}  commands: {:?}",
                controller.volume,
                if controller.muted { " (muted)" } else { "" },
                controller.supported_commands
            );
        }
        if let Some(metadata) = &state.metadata {
            if let Some(title) = metadata.title.value() {
                println!("title: {title}");
            }
            if let Some(artist) = metadata.artist.value() {
                println!("artist: {artist}");
            }
        }
    }

    fn on_stream_start(&self, start: &StreamStart) {
        if let Some(player) = &start.player {
            println!(
                "stream started: {:?} {}Hz {}ch {}bit",
                player.codec, player.sample_rate, player.channels, player.bit_depth
            );
        }
    }

    fn on_stream_end(&self) {
        if self.verbose {
            println!("stream ended");
        }
    }

    fn on_audio(&self, frame: TimedFrame) {
        self.audio_frames.fetch_add(1, Ordering::Relaxed);
        self.audio_bytes
            .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
    }

    fn on_disconnected(&self, reason: CloseReason, will_retry: bool) {
        if self.verbose {
            println!("disconnected ({reason}), retrying: {will_retry}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

async fn discover_and_print() -> anyhow::Result<ExitCode> {
    let servers = discover_servers().await?;
    if servers.is_empty() {
        eprintln!("no Resonate server found on the local network");
        return Ok(ExitCode::from(2));
    }
    for (name, record) in servers {
        println!("{name}\t{}", record.ws_url());
    }
    Ok(ExitCode::SUCCESS)
}

async fn first_server() -> Option<DiscoveryRecord> {
    discover_servers()
        .await
        .ok()?
        .into_iter()
        .map(|(_, record)| record)
        .next()
}

/// One-shot mDNS browse with a fixed deadline.
async fn discover_servers() -> anyhow::Result<Vec<(String, DiscoveryRecord)>> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(SERVICE_TYPE_SERVER)?;

    let mut found: Vec<(String, DiscoveryRecord)> = Vec::new();
    let deadline = tokio::time::Instant::now() + DISCOVER_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                if let Some(record) = DiscoveryRecord::from_resolved(&info) {
                    if !found.iter().any(|(_, r)| *r == record) {
                        found.push((info.fullname.clone(), record));
                    }
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }

    let _ = daemon.stop_browse(SERVICE_TYPE_SERVER);
    let _ = daemon.shutdown();
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}
