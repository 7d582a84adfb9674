//! Client-side protocol core: session driver for player, controller,
//! metadata, artwork and visualizer endpoints.
//!
//! A [`ClientSession`] dials a server URL through the reconnect driver,
//! runs the handshake, reports the initial `client/state`, keeps the clock
//! filter fed at the adaptive cadence, and routes inbound traffic to a
//! [`ClientDelegate`]. The delegate slot is copy-on-set: dispatch captures
//! the current snapshot and setters swap it atomically.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::clock::{now_micros, ClockFilter};
use crate::endpoint::reconnect::{
    Dialer, MonitoredObserver, ReconnectDriver, SessionFactory, WsDialer,
};
use crate::endpoint::transport::{BoxFrameSink, BoxFrameSource};
use crate::endpoint::{CloseReason, Endpoint, EndpointObserver};
use crate::error::ResonateResult;
use crate::events::{ClockEvent, EventEmitter, NoopEventEmitter};
use crate::protocol::messages::{
    ClientGoodbye, ClientHello, ClientState, ClientTime, ControllerCommand, GoodbyeReason,
    GroupUpdate, Message, PlayerCommandKind, PlayerState, PlayerSyncState, Role, ServerState,
    StreamClear, StreamRequestFormat, StreamStart, StreamUpdate,
};
use crate::protocol::{BinaryChannel, BinaryFrame};

/// A binary payload with its wire timestamp mapped onto the local clock.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    pub payload: Bytes,
    /// Presentation time in server-clock µs, as carried on the wire.
    pub server_time: i64,
    /// Presentation time converted to the local monotonic clock.
    pub local_deadline: i64,
}

/// Application callbacks for a client session. All methods run on the
/// endpoint's reader task and must not block.
pub trait ClientDelegate: Send + Sync {
    fn on_connected(&self, endpoint: &Arc<Endpoint>) {
        let _ = endpoint;
    }

    fn on_group_update(&self, update: &GroupUpdate) {
        let _ = update;
    }

    fn on_server_state(&self, state: &ServerState) {
        let _ = state;
    }

    fn on_stream_start(&self, start: &StreamStart) {
        let _ = start;
    }

    fn on_stream_update(&self, update: &StreamUpdate) {
        let _ = update;
    }

    fn on_stream_clear(&self, clear: &StreamClear) {
        let _ = clear;
    }

    fn on_stream_end(&self) {}

    fn on_audio(&self, frame: TimedFrame) {
        let _ = frame;
    }

    fn on_artwork(&self, channel: u8, frame: TimedFrame) {
        let _ = (channel, frame);
    }

    fn on_visualizer(&self, frame: TimedFrame) {
        let _ = frame;
    }

    fn on_disconnected(&self, reason: CloseReason, will_retry: bool) {
        let _ = (reason, will_retry);
    }
}

/// Local player state reported through `client/state`.
pub struct PlayerModel {
    volume: AtomicU8,
    muted: AtomicBool,
    diverged: AtomicBool,
}

impl PlayerModel {
    fn new() -> Self {
        Self {
            volume: AtomicU8::new(100),
            muted: AtomicBool::new(false),
            diverged: AtomicBool::new(false),
        }
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::SeqCst)
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(100), Ordering::SeqCst);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn to_state(&self) -> PlayerState {
        PlayerState {
            state: if self.diverged.load(Ordering::SeqCst) {
                PlayerSyncState::Error
            } else {
                PlayerSyncState::Synchronized
            },
            volume: self.volume(),
            muted: self.muted(),
        }
    }
}

/// Shared state behind a client session's endpoints.
struct ClientCore {
    hello: ClientHello,
    clock: Arc<ClockFilter>,
    player: PlayerModel,
    delegate: RwLock<Arc<dyn ClientDelegate>>,
    current: RwLock<Option<Arc<Endpoint>>>,
    emitter: Arc<dyn EventEmitter>,
}

impl ClientCore {
    fn delegate(&self) -> Arc<dyn ClientDelegate> {
        Arc::clone(&self.delegate.read())
    }

    fn is_player(&self) -> bool {
        self.hello.supported_roles.contains(&Role::Player)
    }

    fn report_player_state(&self, endpoint: &Arc<Endpoint>) {
        let _ = endpoint.send(&Message::ClientState(ClientState {
            player: Some(self.player.to_state()),
        }));
    }
}

impl ClientCore {
    fn on_message(&self, _endpoint: &Arc<Endpoint>, message: Message) {
        let delegate = self.delegate();
        match message {
            Message::GroupUpdate(update) => delegate.on_group_update(&update),
            Message::ServerState(state) => delegate.on_server_state(&state),
            Message::StreamStart(start) => delegate.on_stream_start(&start),
            Message::StreamUpdate(update) => delegate.on_stream_update(&update),
            Message::StreamClear(clear) => delegate.on_stream_clear(&clear),
            Message::StreamEnd(_) => delegate.on_stream_end(),
            Message::ServerCommand(command) => {
                if let Some(player) = command.player {
                    match player.command {
                        PlayerCommandKind::Volume => {
                            if let Some(volume) = player.volume {
                                self.player.set_volume(volume);
                            }
                            if let Some(mute) = player.mute {
                                self.player.set_muted(mute);
                            }
                        }
                        PlayerCommandKind::Mute => {
                            if let Some(mute) = player.mute {
                                self.player.set_muted(mute);
                            }
                            if let Some(volume) = player.volume {
                                self.player.set_volume(volume);
                            }
                        }
                    }
                    // The resulting state is echoed back, always.
                    if let Some(endpoint) = self.current.read().clone() {
                        self.report_player_state(&endpoint);
                    }
                }
            }
            other => {
                log::debug!("[Client] Unhandled {}", other.kind());
            }
        }
    }

    fn on_binary(&self, endpoint: &Arc<Endpoint>, frame: BinaryFrame) {
        let snapshot = endpoint.clock().snapshot();
        let timed = TimedFrame {
            local_deadline: snapshot.to_local(frame.timestamp),
            server_time: frame.timestamp,
            payload: frame.payload,
        };
        let delegate = self.delegate();
        match frame.channel {
            BinaryChannel::Player(_) => delegate.on_audio(timed),
            BinaryChannel::Artwork(channel) => delegate.on_artwork(channel, timed),
            BinaryChannel::Visualizer(_) => delegate.on_visualizer(timed),
        }
    }

    fn on_disconnected(&self, endpoint: &Arc<Endpoint>, reason: CloseReason, will_retry: bool) {
        let mut current = self.current.write();
        if current
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, endpoint))
        {
            *current = None;
        }
        drop(current);
        self.delegate().on_disconnected(reason, will_retry);
    }
}

impl ClientCore {
    /// Divergence watcher closure for the time-poll task: flips the
    /// reported sync state when the filter crosses the fatal threshold.
    fn player_watch(self: &Arc<Self>, endpoint: &Arc<Endpoint>) -> impl FnMut() + Send + 'static {
        let core = Arc::clone(self);
        let endpoint = Arc::clone(endpoint);
        let mut was_diverged = false;
        move || {
            let diverged = endpoint.clock().is_diverged();
            if diverged == was_diverged {
                return;
            }
            was_diverged = diverged;
            core.player.diverged.store(diverged, Ordering::SeqCst);
            if diverged {
                log::warn!("[Client] Clock filter diverged, reporting error state");
                if let Some(id) = endpoint.peer_id() {
                    core.emitter.emit_clock(ClockEvent::Diverged {
                        client_id: id.to_string(),
                    });
                }
            }
            if core.is_player() {
                core.report_player_state(&endpoint);
            }
        }
    }
}

// `on_established` needs `Arc<Self>` for the watcher; EndpointObserver
// hands out `&self`, so the factory stores the core as an Arc and the
// trait impl lives on the Arc-compatible wrapper below.
struct ClientObserver(Arc<ClientCore>);

impl EndpointObserver for ClientObserver {
    fn on_established(&self, endpoint: &Arc<Endpoint>) {
        let core = &self.0;
        *core.current.write() = Some(Arc::clone(endpoint));
        if core.is_player() {
            core.report_player_state(endpoint);
        }
        core.delegate().on_connected(endpoint);
        spawn_time_poll(Arc::clone(endpoint), core.player_watch(endpoint));
    }

    fn on_message(&self, endpoint: &Arc<Endpoint>, message: Message) {
        self.0.on_message(endpoint, message);
    }

    fn on_binary(&self, endpoint: &Arc<Endpoint>, frame: BinaryFrame) {
        self.0.on_binary(endpoint, frame);
    }

    fn on_disconnected(&self, endpoint: &Arc<Endpoint>, reason: CloseReason, will_retry: bool) {
        self.0.on_disconnected(endpoint, reason, will_retry);
    }
}

/// Sends `client/time` probes at the filter's adaptive cadence until the
/// endpoint leaves the established phase.
fn spawn_time_poll(endpoint: Arc<Endpoint>, mut watch: impl FnMut() + Send + 'static) {
    tokio::spawn(async move {
        loop {
            if !endpoint.is_established() {
                break;
            }
            let probe = Message::ClientTime(ClientTime {
                client_transmitted: now_micros(),
            });
            if endpoint.send(&probe).is_err() {
                break;
            }
            watch();
            tokio::time::sleep(endpoint.clock().poll_interval()).await;
        }
    });
}

struct ClientSessionFactory {
    core: Arc<ClientCore>,
}

impl SessionFactory for ClientSessionFactory {
    fn establish(
        &self,
        url: &str,
        sink: BoxFrameSink,
        source: BoxFrameSource,
        done: oneshot::Sender<(CloseReason, bool)>,
    ) -> Arc<Endpoint> {
        log::info!("[Client] Connecting to {}", url);
        let observer = MonitoredObserver::new(
            Arc::new(ClientObserver(Arc::clone(&self.core))) as Arc<dyn EndpointObserver>,
            done,
        );
        Endpoint::start_client(
            sink,
            source,
            self.core.hello.clone(),
            observer,
            Arc::clone(&self.core.clock),
        )
    }
}

/// A client-side connection to one server URL, with reconnect.
pub struct ClientSession {
    url: String,
    core: Arc<ClientCore>,
    driver: Arc<ReconnectDriver>,
}

impl ClientSession {
    /// Starts a session against `url` with the production dialer.
    pub fn connect(url: &str, hello: ClientHello, delegate: Arc<dyn ClientDelegate>) -> Self {
        Self::connect_with(url, hello, delegate, Arc::new(WsDialer))
    }

    /// Starts a session with a custom dialer (tests, loopback).
    pub fn connect_with(
        url: &str,
        hello: ClientHello,
        delegate: Arc<dyn ClientDelegate>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let core = Arc::new(ClientCore {
            hello,
            clock: Arc::new(ClockFilter::new()),
            player: PlayerModel::new(),
            delegate: RwLock::new(delegate),
            current: RwLock::new(None),
            emitter: Arc::new(NoopEventEmitter),
        });
        let factory = Arc::new(ClientSessionFactory {
            core: Arc::clone(&core),
        });
        let driver = Arc::new(ReconnectDriver::new(dialer, factory));
        driver.connect(url);
        Self {
            url: url.to_string(),
            core,
            driver,
        }
    }

    /// Swaps the delegate. In-flight dispatches finish on the old one.
    pub fn set_delegate(&self, delegate: Arc<dyn ClientDelegate>) {
        *self.core.delegate.write() = delegate;
    }

    pub fn player(&self) -> &PlayerModel {
        &self.core.player
    }

    /// The current established endpoint, if any.
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.core.current.read().clone()
    }

    /// Sends a message over the current endpoint.
    pub fn send(&self, message: &Message) -> ResonateResult<()> {
        match self.endpoint() {
            Some(endpoint) => endpoint.send(message),
            None => Err(crate::error::ResonateError::Closed),
        }
    }

    /// Submits a controller command.
    pub fn send_command(&self, command: ControllerCommand) -> ResonateResult<()> {
        self.send(&Message::ClientCommand(
            crate::protocol::messages::ClientCommand {
                controller: Some(command),
            },
        ))
    }

    /// Requests a stream format change.
    pub fn request_format(&self, request: StreamRequestFormat) -> ResonateResult<()> {
        self.send(&Message::StreamRequestFormat(request))
    }

    /// Reports the current player state (after a local volume change).
    pub fn report_state(&self) -> ResonateResult<()> {
        match self.endpoint() {
            Some(endpoint) => {
                self.core.report_player_state(&endpoint);
                Ok(())
            }
            None => Err(crate::error::ResonateError::Closed),
        }
    }

    /// Announces a graceful disconnect and stops reconnecting.
    pub fn goodbye(&self, reason: GoodbyeReason) {
        if let Some(endpoint) = self.endpoint() {
            let _ = endpoint.send(&Message::ClientGoodbye(ClientGoodbye { reason }));
            endpoint.close(CloseReason::Normal, false);
        }
        self.driver.disconnect(&self.url);
    }

    /// Drops the connection without a goodbye and stops reconnecting.
    pub fn disconnect(&self) {
        self.driver.disconnect(&self.url);
        if let Some(endpoint) = self.endpoint() {
            endpoint.close(CloseReason::Normal, false);
        }
    }
}
