//! Connection endpoint: one WebSocket peer with its reader and writer tasks.
//!
//! The endpoint owns the handshake state machine, the bounded outbound
//! queue, keepalive, and the ordered shutdown sequence. Application code
//! never touches the socket: outbound traffic goes through [`Endpoint::send`]
//! and inbound traffic arrives via the [`EndpointObserver`].
//!
//! Close is a compare-and-set transition: whatever the trigger (overflow,
//! read error, peer goodbye, an external call), exactly one caller wins the
//! transition and exactly one `on_disconnected` fires. The teardown itself
//! runs on a spawned task pinned to completion, so cancellation of the
//! closing caller cannot leave the endpoint half-closed.

pub mod reconnect;
pub mod transport;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{now_micros, ClockFilter};
use crate::error::{ResonateError, ResonateResult};
use crate::protocol::messages::{ClientHello, Message, Role, ServerHello, ServerTime};
use crate::protocol::{self, BinaryFrame};
use crate::protocol_constants::{
    CLOSE_DRAIN_DEADLINE, CODEC_ERROR_CLOSE_THRESHOLD, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL,
    HEARTBEAT_TIMEOUT, SEND_QUEUE_CAPACITY,
};

use transport::{BoxFrameSink, BoxFrameSource, WireFrame};

/// Which protocol role this endpoint plays, independent of which side
/// dialed the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// Handshake and shutdown phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Init = 0,
    /// Server side: awaiting `client/hello`.
    HelloWait = 1,
    /// Client side: `client/hello` queued, awaiting `server/hello`.
    HelloSent = 2,
    Established = 3,
    Draining = 4,
    Closed = 5,
    /// Closed with retry requested; the reconnect driver takes over.
    Failed = 6,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::HelloWait,
            2 => Self::HelloSent,
            3 => Self::Established,
            4 => Self::Draining,
            5 => Self::Closed,
            _ => Self::Failed,
        }
    }
}

/// Why an endpoint closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly local shutdown.
    Normal,
    /// Handshake violation or repeated undecodable traffic.
    ProtocolError,
    /// The bounded send queue overflowed.
    Overflow,
    /// Socket failure or missed keepalive.
    TransportError,
    /// Peer announced `client/goodbye`.
    PeerGoodbye,
    /// Peer closed the socket.
    PeerClosed,
    /// A newer connection presented the same `client_id`.
    DuplicateClient,
    /// Host is shutting down.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::ProtocolError => "protocol-error",
            Self::Overflow => "overflow",
            Self::TransportError => "transport-error",
            Self::PeerGoodbye => "peer-goodbye",
            Self::PeerClosed => "peer-closed",
            Self::DuplicateClient => "duplicate-client",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Inbound traffic and lifecycle callbacks.
///
/// Callbacks run on the endpoint's reader task (or the teardown task for
/// `on_disconnected`); they must not block. `accept_hello` must not send
/// anything: the endpoint guarantees `server/hello` is the first outbound
/// text frame by enqueueing it before any observer side effects run.
pub trait EndpointObserver: Send + Sync {
    /// Server side only: validate a `client/hello` and produce the reply.
    fn accept_hello(&self, hello: &ClientHello) -> ResonateResult<ServerHello> {
        let _ = hello;
        Err(ResonateError::WrongPhase("unexpected client/hello".into()))
    }

    /// Handshake completed. Anything enqueued here is ordered after the
    /// hello and before regular traffic read from the peer.
    fn on_established(&self, endpoint: &Arc<Endpoint>);

    /// A decoded post-handshake text message (time and goodbye messages
    /// are consumed by the endpoint itself).
    fn on_message(&self, endpoint: &Arc<Endpoint>, message: Message);

    /// A decoded binary frame during an active stream.
    fn on_binary(&self, endpoint: &Arc<Endpoint>, frame: BinaryFrame) {
        let _ = (endpoint, frame);
    }

    /// The endpoint closed. Fired exactly once, after both I/O tasks have
    /// exited and the socket is closed.
    fn on_disconnected(&self, endpoint: &Arc<Endpoint>, reason: CloseReason, will_retry: bool);
}

/// One connected WebSocket peer.
pub struct Endpoint {
    side: Side,
    phase: AtomicU8,
    out_tx: mpsc::Sender<WireFrame>,
    cancel_read: CancellationToken,
    cancel_write: CancellationToken,
    observer: Arc<dyn EndpointObserver>,
    clock: Arc<ClockFilter>,
    client_hello: OnceLock<ClientHello>,
    server_hello: OnceLock<ServerHello>,
    stream_active: AtomicBool,
    codec_errors: AtomicU32,
    last_rx: AtomicI64,
    /// True when a reconnect driver owns this connection: transport-level
    /// failures then request a retry.
    dial_driven: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Endpoint {
    fn new(
        side: Side,
        observer: Arc<dyn EndpointObserver>,
        clock: Arc<ClockFilter>,
        dial_driven: bool,
    ) -> (Arc<Self>, mpsc::Receiver<WireFrame>) {
        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let endpoint = Arc::new(Self {
            side,
            phase: AtomicU8::new(Phase::Init as u8),
            out_tx,
            cancel_read: CancellationToken::new(),
            cancel_write: CancellationToken::new(),
            observer,
            clock,
            client_hello: OnceLock::new(),
            server_hello: OnceLock::new(),
            stream_active: AtomicBool::new(false),
            codec_errors: AtomicU32::new(0),
            last_rx: AtomicI64::new(now_micros()),
            dial_driven,
            tasks: Mutex::new(Vec::new()),
        });
        (endpoint, out_rx)
    }

    /// Accepts an inbound connection: the local side is the protocol
    /// server and waits for `client/hello`.
    pub fn accept(
        sink: BoxFrameSink,
        source: BoxFrameSource,
        observer: Arc<dyn EndpointObserver>,
    ) -> Arc<Self> {
        let (endpoint, out_rx) =
            Self::new(Side::Server, observer, Arc::new(ClockFilter::new()), false);
        endpoint.phase.store(Phase::HelloWait as u8, Ordering::SeqCst);
        endpoint.spawn_io(sink, source, out_rx);
        endpoint
    }

    /// Accepts over a dialed transport (server-initiated flow): same
    /// protocol role as [`Endpoint::accept`], but transport failures
    /// request a reconnect.
    pub fn accept_dialed(
        sink: BoxFrameSink,
        source: BoxFrameSource,
        observer: Arc<dyn EndpointObserver>,
    ) -> Arc<Self> {
        let (endpoint, out_rx) =
            Self::new(Side::Server, observer, Arc::new(ClockFilter::new()), true);
        endpoint.phase.store(Phase::HelloWait as u8, Ordering::SeqCst);
        endpoint.spawn_io(sink, source, out_rx);
        endpoint
    }

    /// Starts a client endpoint over a connected transport: enqueues
    /// `client/hello` and waits for `server/hello`.
    pub fn start_client(
        sink: BoxFrameSink,
        source: BoxFrameSource,
        hello: ClientHello,
        observer: Arc<dyn EndpointObserver>,
        clock: Arc<ClockFilter>,
    ) -> Arc<Self> {
        clock.reset();
        let (endpoint, out_rx) = Self::new(Side::Client, observer, clock, true);
        let frame = WireFrame::Text(protocol::encode_text(&Message::ClientHello(hello)));
        // Queue is fresh; this cannot fail.
        let _ = endpoint.out_tx.try_send(frame);
        endpoint.phase.store(Phase::HelloSent as u8, Ordering::SeqCst);
        endpoint.spawn_io(sink, source, out_rx);
        endpoint
    }

    fn spawn_io(
        self: &Arc<Self>,
        sink: BoxFrameSink,
        source: BoxFrameSource,
        out_rx: mpsc::Receiver<WireFrame>,
    ) {
        let reader = tokio::spawn(read_loop(Arc::clone(self), source));
        let writer = tokio::spawn(write_loop(Arc::clone(self), sink, out_rx));
        // The deadline task self-terminates; it is not part of teardown.
        tokio::spawn(handshake_deadline(Arc::clone(self)));
        let mut tasks = self.tasks.lock();
        tasks.push(reader);
        tasks.push(writer);
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_established(&self) -> bool {
        self.phase() == Phase::Established
    }

    /// Which protocol role this endpoint plays locally.
    pub fn side(&self) -> Side {
        self.side
    }

    /// The peer's hello, once the handshake completed (server side).
    pub fn client_hello(&self) -> Option<&ClientHello> {
        self.client_hello.get()
    }

    /// The server's hello, once the handshake completed (client side).
    pub fn server_hello(&self) -> Option<&ServerHello> {
        self.server_hello.get()
    }

    /// Peer identifier: `client_id` on the server side, `server_id` on
    /// the client side.
    pub fn peer_id(&self) -> Option<&str> {
        match self.side {
            Side::Server => self.client_hello.get().map(|h| h.client_id.as_str()),
            Side::Client => self.server_hello.get().map(|h| h.server_id.as_str()),
        }
    }

    /// Roles the peer declared (server side).
    pub fn peer_roles(&self) -> &[Role] {
        self.client_hello
            .get()
            .map(|h| h.supported_roles.as_slice())
            .unwrap_or(&[])
    }

    pub fn peer_has_role(&self, role: Role) -> bool {
        self.peer_roles().contains(&role)
    }

    /// Clock filter attached to this endpoint.
    pub fn clock(&self) -> &Arc<ClockFilter> {
        &self.clock
    }

    /// Marks whether a stream is active for this endpoint; binary frames
    /// are only valid while it is.
    pub fn set_stream_active(&self, active: bool) {
        self.stream_active.store(active, Ordering::SeqCst);
    }

    pub fn stream_active(&self) -> bool {
        self.stream_active.load(Ordering::SeqCst)
    }

    /// Enqueues a text message.
    ///
    /// Queue overflow closes the endpoint with `overflow` per the shared
    /// resource discipline and reports [`ResonateError::BufferOverrun`].
    pub fn send(self: &Arc<Self>, message: &Message) -> ResonateResult<()> {
        if !matches!(self.phase(), Phase::Established) {
            return Err(ResonateError::Closed);
        }
        self.enqueue(WireFrame::Text(protocol::encode_text(message)))
    }

    /// Enqueues an encoded binary frame.
    pub fn send_binary(self: &Arc<Self>, frame: &BinaryFrame) -> ResonateResult<()> {
        if !matches!(self.phase(), Phase::Established) {
            return Err(ResonateError::Closed);
        }
        self.enqueue(WireFrame::Binary(frame.encode()))
    }

    fn enqueue(self: &Arc<Self>, frame: WireFrame) -> ResonateResult<()> {
        match self.out_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("[Endpoint] Send queue overflow, closing {:?}", self.peer_id());
                self.close(CloseReason::Overflow, true);
                Err(ResonateError::BufferOverrun)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ResonateError::Closed),
        }
    }

    /// Initiates the close protocol. Idempotent: concurrent callers
    /// observe identical effect and no duplicated callbacks.
    ///
    /// `retry` only has effect on endpoints driven by the reconnect
    /// driver; it is reported to the observer as `will_retry`.
    pub fn close(self: &Arc<Self>, reason: CloseReason, retry: bool) {
        loop {
            let current = self.phase.load(Ordering::SeqCst);
            if current == Phase::Draining as u8
                || current == Phase::Closed as u8
                || current == Phase::Failed as u8
            {
                return;
            }
            if self
                .phase
                .compare_exchange(
                    current,
                    Phase::Draining as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }

        log::info!(
            "[Endpoint] Closing {:?} (reason: {}, retry: {})",
            self.peer_id(),
            reason,
            retry
        );

        // Teardown is pinned to its own task so cancellation of the caller
        // cannot interrupt steps 2-5 of the close protocol.
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            endpoint.cancel_read.cancel();
            endpoint.cancel_write.cancel();

            let tasks: Vec<_> = endpoint.tasks.lock().drain(..).collect();
            for task in tasks {
                let _ = task.await;
            }

            endpoint
                .observer
                .on_disconnected(&endpoint, reason, retry);

            let terminal = if retry { Phase::Failed } else { Phase::Closed };
            endpoint.phase.store(terminal as u8, Ordering::SeqCst);
        });
    }

    /// Records inbound liveness.
    fn touch(&self) {
        self.last_rx.store(now_micros(), Ordering::Relaxed);
    }

    fn peer_is_silent(&self) -> bool {
        let idle = now_micros() - self.last_rx.load(Ordering::Relaxed);
        idle > HEARTBEAT_TIMEOUT.as_micros() as i64
    }

    fn handle_text(self: &Arc<Self>, text: &str, received_at: i64) {
        let message = match protocol::decode_text(text) {
            Ok(message) => {
                self.codec_errors.store(0, Ordering::Relaxed);
                message
            }
            Err(e) => {
                let errors = self.codec_errors.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "[Endpoint] Dropping undecodable text frame from {:?}: {}",
                    self.peer_id(),
                    e
                );
                if errors >= CODEC_ERROR_CLOSE_THRESHOLD {
                    self.close(CloseReason::ProtocolError, false);
                }
                return;
            }
        };

        if !self.is_established() {
            self.handle_handshake(message);
            return;
        }

        match message {
            Message::ClientHello(_) | Message::ServerHello(_) => {
                log::warn!(
                    "[Endpoint] Repeated hello from {:?} after handshake",
                    self.peer_id()
                );
                self.close(CloseReason::ProtocolError, false);
            }
            Message::ClientTime(t) if self.side == Side::Server => {
                let reply = Message::ServerTime(ServerTime {
                    client_transmitted: t.client_transmitted,
                    server_received: received_at,
                    server_transmitted: now_micros(),
                });
                let _ = self.send(&reply);
            }
            Message::ServerTime(t) if self.side == Side::Client => {
                self.clock.update(
                    t.client_transmitted,
                    t.server_received,
                    t.server_transmitted,
                    received_at,
                );
            }
            Message::ClientGoodbye(goodbye) if self.side == Side::Server => {
                log::info!(
                    "[Endpoint] {:?} said goodbye ({:?})",
                    self.peer_id(),
                    goodbye.reason
                );
                self.close(CloseReason::PeerGoodbye, false);
            }
            Message::StreamStart(_) if self.side == Side::Client => {
                self.set_stream_active(true);
                self.observer.on_message(self, message);
            }
            Message::StreamEnd(_) if self.side == Side::Client => {
                self.set_stream_active(false);
                self.observer.on_message(self, message);
            }
            other => self.observer.on_message(self, other),
        }
    }

    fn handle_handshake(self: &Arc<Self>, message: Message) {
        match (self.side, self.phase(), message) {
            (Side::Server, Phase::HelloWait, Message::ClientHello(hello)) => {
                let reply = match self.observer.accept_hello(&hello) {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::warn!(
                            "[Endpoint] Rejecting hello from {}: {}",
                            hello.client_id,
                            e
                        );
                        self.close(CloseReason::ProtocolError, false);
                        return;
                    }
                };
                // server/hello must be the first text frame the peer
                // observes: enqueue before any observer side effects.
                let frame =
                    WireFrame::Text(protocol::encode_text(&Message::ServerHello(reply.clone())));
                if self.out_tx.try_send(frame).is_err() {
                    self.close(CloseReason::Overflow, false);
                    return;
                }
                let _ = self.server_hello.set(reply);
                let _ = self.client_hello.set(hello);
                self.phase.store(Phase::Established as u8, Ordering::SeqCst);
                log::info!(
                    "[Endpoint] Established with client {:?} ({:?})",
                    self.peer_id(),
                    self.peer_roles()
                );
                self.observer.on_established(self);
            }
            (Side::Client, Phase::HelloSent, Message::ServerHello(hello)) => {
                log::info!(
                    "[Endpoint] Connected to server {} ({})",
                    hello.name,
                    hello.server_id
                );
                let _ = self.server_hello.set(hello);
                self.phase.store(Phase::Established as u8, Ordering::SeqCst);
                self.observer.on_established(self);
            }
            (_, phase, message) => {
                log::warn!(
                    "[Endpoint] {} not valid in phase {:?}, closing",
                    message.kind(),
                    phase
                );
                self.close(CloseReason::ProtocolError, false);
            }
        }
    }

    fn handle_binary(self: &Arc<Self>, data: bytes::Bytes) {
        if !self.is_established() {
            log::warn!("[Endpoint] Binary frame before handshake, closing");
            self.close(CloseReason::ProtocolError, false);
            return;
        }
        if !self.stream_active() {
            log::warn!(
                "[Endpoint] Dropping binary frame from {:?}: no active stream",
                self.peer_id()
            );
            return;
        }
        match BinaryFrame::decode(&data) {
            Ok(frame) => {
                self.codec_errors.store(0, Ordering::Relaxed);
                self.observer.on_binary(self, frame);
            }
            Err(e) => {
                let errors = self.codec_errors.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("[Endpoint] Dropping undecodable binary frame: {}", e);
                if errors >= CODEC_ERROR_CLOSE_THRESHOLD {
                    self.close(CloseReason::ProtocolError, false);
                }
            }
        }
    }
}

/// Reader task: decodes inbound frames and enforces liveness.
async fn read_loop(endpoint: Arc<Endpoint>, mut source: BoxFrameSource) {
    let mut liveness = tokio::time::interval(HEARTBEAT_INTERVAL);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let retry = endpoint.dial_driven;

    loop {
        tokio::select! {
            _ = endpoint.cancel_read.cancelled() => break,
            _ = liveness.tick() => {
                if endpoint.peer_is_silent() {
                    log::warn!(
                        "[Endpoint] Peer {:?} silent beyond keepalive deadline",
                        endpoint.peer_id()
                    );
                    endpoint.close(CloseReason::TransportError, retry);
                    break;
                }
            }
            frame = source.next() => {
                let received_at = now_micros();
                match frame {
                    Some(Ok(WireFrame::Text(text))) => {
                        endpoint.touch();
                        endpoint.handle_text(&text, received_at);
                    }
                    Some(Ok(WireFrame::Binary(data))) => {
                        endpoint.touch();
                        endpoint.handle_binary(data);
                    }
                    Some(Ok(WireFrame::Ping)) => {
                        endpoint.touch();
                        let _ = endpoint.out_tx.try_send(WireFrame::Pong);
                    }
                    Some(Ok(WireFrame::Pong)) => endpoint.touch(),
                    Some(Ok(WireFrame::Close)) => {
                        log::info!("[Endpoint] Peer {:?} closed connection", endpoint.peer_id());
                        endpoint.close(CloseReason::PeerClosed, retry);
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Endpoint] Read error from {:?}: {}", endpoint.peer_id(), e);
                        endpoint.close(CloseReason::TransportError, retry);
                        break;
                    }
                    None => {
                        endpoint.close(CloseReason::PeerClosed, retry);
                        break;
                    }
                }
            }
        }
    }
}

/// Writer task: drains the bounded queue and sends keepalive pings.
/// On cancellation it drains in-flight frames within the close deadline,
/// then closes the socket.
async fn write_loop(
    endpoint: Arc<Endpoint>,
    mut sink: BoxFrameSink,
    mut out_rx: mpsc::Receiver<WireFrame>,
) {
    let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let retry = endpoint.dial_driven;

    loop {
        tokio::select! {
            biased;
            _ = endpoint.cancel_write.cancelled() => {
                drain_queue(&mut sink, &mut out_rx).await;
                break;
            }
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            log::warn!(
                                "[Endpoint] Write error to {:?}: {}",
                                endpoint.peer_id(),
                                e
                            );
                            endpoint.close(CloseReason::TransportError, retry);
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if sink.send(WireFrame::Ping).await.is_err() {
                    endpoint.close(CloseReason::TransportError, retry);
                    break;
                }
            }
        }
    }

    sink.close().await;
}

/// Sends already-queued frames, bounded by the close deadline.
async fn drain_queue(sink: &mut BoxFrameSink, out_rx: &mut mpsc::Receiver<WireFrame>) {
    let deadline = tokio::time::Instant::now() + CLOSE_DRAIN_DEADLINE;
    while let Ok(frame) = out_rx.try_recv() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            log::debug!("[Endpoint] Close deadline reached with frames still queued");
            return;
        }
        if tokio::time::timeout(remaining, sink.send(frame))
            .await
            .map_or(true, |r| r.is_err())
        {
            return;
        }
    }
}

/// Closes the endpoint if the handshake has not completed in time.
async fn handshake_deadline(endpoint: Arc<Endpoint>) {
    tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
    if !matches!(
        endpoint.phase(),
        Phase::Established | Phase::Draining | Phase::Closed | Phase::Failed
    ) {
        log::warn!("[Endpoint] Handshake timeout");
        endpoint.close(CloseReason::ProtocolError, endpoint.dial_driven);
    }
}

#[cfg(test)]
mod tests {
    use super::transport::memory_pair;
    use super::*;
    use crate::protocol::messages::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    fn test_hello() -> ClientHello {
        ClientHello {
            client_id: "c1".into(),
            name: "Kitchen".into(),
            device_info: None,
            version: 1,
            supported_roles: vec![Role::Player],
            player_support: Some(PlayerSupport {
                support_formats: vec![AudioFormat {
                    codec: Codec::Pcm,
                    channels: 2,
                    sample_rate: 48_000,
                    bit_depth: 16,
                }],
                buffer_capacity: 262_144,
                supported_commands: vec![PlayerCommandKind::Volume, PlayerCommandKind::Mute],
            }),
            artwork_support: None,
            visualizer_support: None,
        }
    }

    /// Observer that records everything and counts disconnects.
    #[derive(Default)]
    struct TestObserver {
        established: AtomicUsize,
        disconnects: AtomicUsize,
        messages: PlMutex<Vec<Message>>,
    }

    impl EndpointObserver for TestObserver {
        fn accept_hello(&self, _hello: &ClientHello) -> ResonateResult<ServerHello> {
            Ok(ServerHello {
                server_id: "s1".into(),
                name: "Living Room Server".into(),
                version: 1,
            })
        }

        fn on_established(&self, _endpoint: &Arc<Endpoint>) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, _endpoint: &Arc<Endpoint>, message: Message) {
            self.messages.lock().push(message);
        }

        fn on_disconnected(&self, _endpoint: &Arc<Endpoint>, _reason: CloseReason, _retry: bool) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn recv_text(source: &mut BoxFrameSource) -> Message {
        loop {
            match source.next().await.unwrap().unwrap() {
                WireFrame::Text(text) => return protocol::decode_text(&text).unwrap(),
                WireFrame::Ping | WireFrame::Pong => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn server_hello_is_first_server_text_frame() {
        let ((peer_tx, peer_rx), (local_tx, local_rx)) = memory_pair();
        let mut peer_tx = peer_tx;
        let mut peer_rx = peer_rx;
        let observer = Arc::new(TestObserver::default());
        let endpoint = Endpoint::accept(local_tx, local_rx, observer.clone());

        peer_tx
            .send(WireFrame::Text(protocol::encode_text(
                &Message::ClientHello(test_hello()),
            )))
            .await
            .unwrap();

        let first = recv_text(&mut peer_rx).await;
        assert!(matches!(first, Message::ServerHello(_)));
        // Give the reader a turn to run the established callback.
        tokio::task::yield_now().await;
        assert_eq!(observer.established.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.peer_id(), Some("c1"));
        assert!(endpoint.peer_has_role(Role::Player));
    }

    #[tokio::test]
    async fn non_hello_before_handshake_closes_with_protocol_error() {
        let ((mut peer_tx, _peer_rx), (local_tx, local_rx)) = memory_pair();
        let observer = Arc::new(TestObserver::default());
        let endpoint = Endpoint::accept(local_tx, local_rx, observer.clone());

        peer_tx
            .send(WireFrame::Text(protocol::encode_text(
                &Message::ClientTime(ClientTime {
                    client_transmitted: 1,
                }),
            )))
            .await
            .unwrap();

        // Drive until teardown completes.
        for _ in 0..50 {
            if observer.disconnects.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn server_answers_client_time_with_stamps() {
        let ((mut peer_tx, mut peer_rx), (local_tx, local_rx)) = memory_pair();
        let observer = Arc::new(TestObserver::default());
        let _endpoint = Endpoint::accept(local_tx, local_rx, observer);

        peer_tx
            .send(WireFrame::Text(protocol::encode_text(
                &Message::ClientHello(test_hello()),
            )))
            .await
            .unwrap();
        let _hello = recv_text(&mut peer_rx).await;

        peer_tx
            .send(WireFrame::Text(protocol::encode_text(
                &Message::ClientTime(ClientTime {
                    client_transmitted: 777,
                }),
            )))
            .await
            .unwrap();

        let reply = recv_text(&mut peer_rx).await;
        let Message::ServerTime(t) = reply else {
            panic!("expected server/time, got {reply:?}");
        };
        assert_eq!(t.client_transmitted, 777);
        assert!(t.server_transmitted >= t.server_received);
    }

    #[tokio::test]
    async fn close_is_idempotent_under_concurrency() {
        let ((mut peer_tx, _peer_rx), (local_tx, local_rx)) = memory_pair();
        let observer = Arc::new(TestObserver::default());
        let endpoint = Endpoint::accept(local_tx, local_rx, observer.clone());

        peer_tx
            .send(WireFrame::Text(protocol::encode_text(
                &Message::ClientHello(test_hello()),
            )))
            .await
            .unwrap();
        for _ in 0..20 {
            if endpoint.is_established() {
                break;
            }
            tokio::task::yield_now().await;
        }

        // Disconnect storm: overflow-style close, transport-style close and
        // an external close racing from separate tasks.
        let mut joins = Vec::new();
        for reason in [
            CloseReason::Overflow,
            CloseReason::TransportError,
            CloseReason::Normal,
        ] {
            let endpoint = Arc::clone(&endpoint);
            joins.push(tokio::spawn(async move {
                endpoint.close(reason, false);
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        for _ in 0..100 {
            if endpoint.phase() == Phase::Closed {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.phase(), Phase::Closed);

        // A late close is a no-op.
        endpoint.close(CloseReason::Normal, false);
        tokio::task::yield_now().await;
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn binary_before_handshake_is_a_protocol_error() {
        let ((mut peer_tx, _peer_rx), (local_tx, local_rx)) = memory_pair();
        let observer = Arc::new(TestObserver::default());
        let endpoint = Endpoint::accept(local_tx, local_rx, observer.clone());

        peer_tx
            .send(WireFrame::Binary(bytes::Bytes::from_static(&[0u8; 16])))
            .await
            .unwrap();

        for _ in 0..50 {
            if observer.disconnects.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
        let _ = endpoint;
    }

    #[tokio::test]
    async fn client_side_runs_handshake_and_reports_established() {
        let ((server_tx, server_rx), (client_tx, client_rx)) = memory_pair();
        let mut server_tx = server_tx;
        let mut server_rx = server_rx;
        let observer = Arc::new(TestObserver::default());
        let endpoint = Endpoint::start_client(
            client_tx,
            client_rx,
            test_hello(),
            observer.clone(),
            Arc::new(ClockFilter::new()),
        );

        // Server sees client/hello first.
        let first = recv_text(&mut server_rx).await;
        assert!(matches!(first, Message::ClientHello(_)));

        server_tx
            .send(WireFrame::Text(protocol::encode_text(
                &Message::ServerHello(ServerHello {
                    server_id: "s1".into(),
                    name: "srv".into(),
                    version: 1,
                }),
            )))
            .await
            .unwrap();

        for _ in 0..50 {
            if endpoint.is_established() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(endpoint.is_established());
        assert_eq!(observer.established.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.peer_id(), Some("s1"));
    }
}
