//! Per-group stream controller task.
//!
//! Produces timestamped encoded frames for every member session, honoring
//! each member's buffer capacity and format preferences. One controller
//! task per active stream; the group engine drives it through a
//! [`StreamHandle`]. Presentation times are server-clock microseconds, so
//! no clock conversion happens here; clients map them through their own
//! clock filter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::clock::now_micros;
use crate::endpoint::Endpoint;
use crate::events::{EventEmitter, StreamEvent};
use crate::protocol::messages::{
    ArtworkChannelConfig, ArtworkFormatRequest, ArtworkSource, AudioFormat, Message,
    PlayerFormatRequest, Role, StreamArtworkStart, StreamClear, StreamEnd, StreamPlayerStart,
    StreamPlayerUpdate, StreamStart, StreamUpdate, StreamVisualizerStart,
};
use crate::protocol::{BinaryChannel, BinaryFrame, DeltaField};
use crate::protocol_constants::{
    ARTWORK_LEAD_MICROS, FORMAT_SWITCH_MIN_LEAD_MICROS, STREAM_MAX_LEAD_MICROS,
    STREAM_MIN_JITTER_MICROS, STREAM_START_LEAD_MICROS, STREAM_TICK,
};

use super::{byte_rate, AudioEncoder, AudioSource, EncoderFactory, VisualizerSource};

/// Maximum audio blocks produced per pacing tick; bounds catch-up bursts.
const MAX_BLOCKS_PER_TICK: usize = 32;

/// Visualizer feature frames per second advertised in `stream/start`.
const VISUALIZER_RATE: u32 = 50;

/// Everything a stream needs besides its members.
pub struct StreamConfig {
    /// Format the [`AudioSource`] delivers PCM in.
    pub source_format: AudioFormat,
    pub source: Box<dyn AudioSource>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub visualizer: Option<Box<dyn VisualizerSource>>,
}

enum Command {
    AddMember(Arc<Endpoint>),
    RemoveMember(String),
    RequestFormat(String, PlayerFormatRequest),
    ReconfigureArtwork(String, ArtworkFormatRequest),
    SetArtwork(ArtworkSource, Bytes),
    ClearArtwork(ArtworkSource),
    Pause,
    Resume,
    Clear,
    End,
}

/// Handle owned by the group engine; all methods are non-blocking.
#[derive(Clone)]
pub struct StreamHandle {
    pub stream_id: String,
    ctrl: mpsc::UnboundedSender<Command>,
}

impl StreamHandle {
    pub fn add_member(&self, endpoint: Arc<Endpoint>) {
        let _ = self.ctrl.send(Command::AddMember(endpoint));
    }

    pub fn remove_member(&self, client_id: &str) {
        let _ = self.ctrl.send(Command::RemoveMember(client_id.to_string()));
    }

    pub fn request_format(&self, client_id: &str, request: PlayerFormatRequest) {
        let _ = self
            .ctrl
            .send(Command::RequestFormat(client_id.to_string(), request));
    }

    pub fn reconfigure_artwork(&self, client_id: &str, request: ArtworkFormatRequest) {
        let _ = self
            .ctrl
            .send(Command::ReconfigureArtwork(client_id.to_string(), request));
    }

    pub fn set_artwork(&self, source: ArtworkSource, image: Bytes) {
        let _ = self.ctrl.send(Command::SetArtwork(source, image));
    }

    pub fn clear_artwork(&self, source: ArtworkSource) {
        let _ = self.ctrl.send(Command::ClearArtwork(source));
    }

    pub fn pause(&self) {
        let _ = self.ctrl.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.ctrl.send(Command::Resume);
    }

    pub fn clear(&self) {
        let _ = self.ctrl.send(Command::Clear);
    }

    /// Ends the stream: `stream/end` fans out and the task exits. Frames
    /// already queued on endpoint writers still flush.
    pub fn end(&self) {
        let _ = self.ctrl.send(Command::End);
    }
}

/// A format change armed for the next block boundary at or after
/// `switch_at`.
struct PendingFormat {
    format: AudioFormat,
    switch_at: i64,
    encoder: Box<dyn AudioEncoder>,
}

/// Audio half of a member session.
struct PlayerSession {
    format: AudioFormat,
    encoder: Box<dyn AudioEncoder>,
    pending_format: Option<PendingFormat>,
    capacity: u64,
    /// Capacity-derived send lead, µs.
    lead_us: i64,
    /// Encoded frames not yet handed to the endpoint writer.
    pending: VecDeque<(i64, Bytes)>,
    /// Sent frames whose presentation time has not passed: the
    /// buffered-bytes estimate.
    in_flight: VecDeque<(i64, u64)>,
    bytes_in_flight: u64,
    late_drops: u64,
}

impl PlayerSession {
    fn new(format: AudioFormat, encoder: Box<dyn AudioEncoder>, capacity: u64) -> Self {
        let lead_us = ((capacity.saturating_mul(1_000_000)) / byte_rate(&format).max(1)) as i64;
        Self {
            format,
            encoder,
            pending_format: None,
            capacity,
            lead_us: lead_us.min(STREAM_MAX_LEAD_MICROS),
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            bytes_in_flight: 0,
            late_drops: 0,
        }
    }
}

/// One member of the active stream.
struct StreamSession {
    endpoint: Arc<Endpoint>,
    client_id: String,
    player: Option<PlayerSession>,
    artwork_channels: Vec<ArtworkChannelConfig>,
    visualizer: bool,
}

/// The per-stream scheduler task state.
pub struct StreamController {
    stream_id: String,
    group_id: String,
    source: Box<dyn AudioSource>,
    source_format: AudioFormat,
    encoders: Arc<dyn EncoderFactory>,
    visualizer: Option<Box<dyn VisualizerSource>>,
    sessions: HashMap<String, StreamSession>,
    /// Server-clock µs of presentation time zero.
    basis_us: i64,
    /// Sample frames produced so far.
    cursor_frames: u64,
    block_frames: usize,
    playing: bool,
    artwork: HashMap<ArtworkSource, Bytes>,
    emitter: Arc<dyn EventEmitter>,
    on_ended: Box<dyn Fn() + Send + Sync>,
}

impl StreamController {
    /// Spawns the controller task and returns its handle.
    ///
    /// `on_ended` fires when the audio source is exhausted, so the owner
    /// can move the group to `stopped`.
    pub fn spawn(
        group_id: String,
        config: StreamConfig,
        emitter: Arc<dyn EventEmitter>,
        on_ended: Box<dyn Fn() + Send + Sync>,
    ) -> StreamHandle {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let block_frames = (config.source_format.sample_rate as usize
            * STREAM_TICK.as_millis() as usize)
            / 1000;

        let controller = Self {
            stream_id: stream_id.clone(),
            group_id: group_id.clone(),
            source: config.source,
            source_format: config.source_format,
            encoders: config.encoders,
            visualizer: config.visualizer,
            sessions: HashMap::new(),
            basis_us: now_micros() + STREAM_START_LEAD_MICROS,
            cursor_frames: 0,
            block_frames: block_frames.max(1),
            playing: true,
            artwork: HashMap::new(),
            emitter,
            on_ended,
        };

        log::info!("[Stream] Stream {} started for group {}", stream_id, group_id);
        controller
            .emitter
            .emit_stream(StreamEvent::Started {
                group_id,
                stream_id: stream_id.clone(),
            });
        tokio::spawn(controller.run(ctrl_rx));

        StreamHandle {
            stream_id,
            ctrl: ctrl_tx,
        }
    }

    async fn run(mut self, mut ctrl_rx: mpsc::UnboundedReceiver<Command>) {
        let mut tick = tokio::time::interval(STREAM_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                biased;

                command = ctrl_rx.recv() => {
                    match command {
                        None | Some(Command::End) => {
                            self.finish();
                            return;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }

                _ = tick.tick() => {
                    if self.playing && !self.produce() {
                        // Source exhausted.
                        self.finish();
                        (self.on_ended)();
                        return;
                    }
                    let now = now_micros();
                    for session in self.sessions.values_mut() {
                        if let Some(player) = session.player.as_mut() {
                            flush_player(&session.endpoint, player, now);
                        }
                    }
                }
            }
        }
    }

    fn cursor_us(&self) -> i64 {
        (self.cursor_frames.saturating_mul(1_000_000)
            / u64::from(self.source_format.sample_rate)) as i64
    }

    fn next_block_ts(&self) -> i64 {
        self.basis_us + self.cursor_us()
    }

    fn block_us(&self) -> i64 {
        (self.block_frames as u64 * 1_000_000 / u64::from(self.source_format.sample_rate)) as i64
    }

    /// Produces audio up to the production lead. Returns false when the
    /// source is exhausted.
    fn produce(&mut self) -> bool {
        let now = now_micros();
        let production_lead = self
            .sessions
            .values()
            .filter_map(|s| s.player.as_ref().map(|p| p.lead_us))
            .max()
            .unwrap_or(STREAM_START_LEAD_MICROS)
            .min(STREAM_MAX_LEAD_MICROS)
            .max(STREAM_START_LEAD_MICROS);

        let mut produced = 0;
        while self.next_block_ts() < now + production_lead && produced < MAX_BLOCKS_PER_TICK {
            let Some(pcm) = self.source.pull(self.block_frames) else {
                log::info!("[Stream] Source exhausted for stream {}", self.stream_id);
                return false;
            };
            let block_ts = self.next_block_ts();
            self.encode_block(&pcm, block_ts);
            self.cursor_frames += self.block_frames as u64;
            produced += 1;
        }
        true
    }

    /// Encodes one PCM block for every player session and fans out the
    /// visualizer features.
    fn encode_block(&mut self, pcm: &Bytes, block_ts: i64) {
        let mut failed: Vec<String> = Vec::new();

        for session in self.sessions.values_mut() {
            let Some(player) = session.player.as_mut() else {
                continue;
            };

            // Format switch happens exactly at a block boundary, so
            // presentation-time coverage has no gap or overlap.
            if let Some(pending) = player.pending_format.take() {
                if block_ts >= pending.switch_at {
                    log::info!(
                        "[Stream] {} switching to {:?} at {}µs",
                        session.client_id,
                        pending.format.codec,
                        pending.switch_at
                    );
                    player.format = pending.format;
                    player.encoder = pending.encoder;
                    self.emitter.emit_stream(StreamEvent::FormatChanged {
                        stream_id: self.stream_id.clone(),
                        client_id: session.client_id.clone(),
                    });
                } else {
                    player.pending_format = Some(pending);
                }
            }

            match player.encoder.encode(pcm) {
                Ok(payload) => player.pending.push_back((block_ts, payload)),
                Err(e) => {
                    log::warn!(
                        "[Stream] Encoder failed for {}: {}, ending its session",
                        session.client_id,
                        e
                    );
                    failed.push(session.client_id.clone());
                }
            }
        }

        for client_id in failed {
            self.end_session(&client_id);
        }

        if let Some(vis) = self.visualizer.as_mut() {
            if let Some(features) = vis.features(pcm, &self.source_format) {
                if let Ok(frame) = BinaryFrame::new(BinaryChannel::FEATURES, block_ts, features) {
                    for session in self.sessions.values() {
                        if session.visualizer {
                            let _ = session.endpoint.send_binary(&frame);
                        }
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddMember(endpoint) => self.add_member(endpoint),
            Command::RemoveMember(client_id) => {
                if let Some(session) = self.sessions.remove(&client_id) {
                    session.endpoint.set_stream_active(false);
                }
            }
            Command::RequestFormat(client_id, request) => {
                self.request_format(&client_id, &request)
            }
            Command::ReconfigureArtwork(client_id, request) => {
                self.reconfigure_artwork(&client_id, &request)
            }
            Command::SetArtwork(source, image) => self.set_artwork(source, image),
            Command::ClearArtwork(source) => self.clear_artwork(source),
            Command::Pause => {
                self.playing = false;
            }
            Command::Resume => {
                // Re-basis so the next block presents just ahead of now;
                // the sample cursor keeps counting.
                self.basis_us = now_micros() + STREAM_START_LEAD_MICROS - self.cursor_us();
                self.playing = true;
            }
            Command::Clear => self.clear_buffers(),
            Command::End => unreachable!("End is handled in the run loop"),
        }
    }

    /// Admits a member mid-stream: future-dated frames only, no catch-up.
    fn add_member(&mut self, endpoint: Arc<Endpoint>) {
        let Some(hello) = endpoint.client_hello().cloned() else {
            log::warn!("[Stream] Refusing member without completed handshake");
            return;
        };
        let roles: Vec<Role> = hello
            .supported_roles
            .iter()
            .copied()
            .filter(|r| r.is_streaming())
            .collect();
        if roles.is_empty() {
            return;
        }

        let mut start = StreamStart::default();
        let mut player = None;

        if roles.contains(&Role::Player) {
            if let Some(support) = hello.player_support.as_ref() {
                match self
                    .encoders
                    .negotiate(&self.source_format, &support.support_formats)
                {
                    Some(target) => match self.encoders.create(&self.source_format, &target) {
                        Ok(encoder) => {
                            start.player = Some(StreamPlayerStart {
                                codec: target.codec,
                                sample_rate: target.sample_rate,
                                channels: target.channels,
                                bit_depth: target.bit_depth,
                                codec_header: encoder.codec_header().map(|h| {
                                    base64::engine::general_purpose::STANDARD.encode(&h)
                                }),
                            });
                            player = Some(PlayerSession::new(
                                target,
                                encoder,
                                support.buffer_capacity,
                            ));
                        }
                        Err(e) => {
                            log::warn!(
                                "[Stream] No encoder for {} ({}): player role inert",
                                hello.client_id,
                                e
                            );
                        }
                    },
                    None => {
                        log::warn!(
                            "[Stream] No common format with {}: player role inert",
                            hello.client_id
                        );
                    }
                }
            }
        }

        let artwork_channels = if roles.contains(&Role::Artwork) {
            hello
                .artwork_support
                .as_ref()
                .map(|a| a.channels.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        if !artwork_channels.is_empty() {
            start.artwork = Some(StreamArtworkStart {
                channels: artwork_channels.clone(),
            });
        }

        let visualizer = roles.contains(&Role::Visualizer) && self.visualizer.is_some();
        if visualizer {
            start.visualizer = Some(StreamVisualizerStart {
                rate: VISUALIZER_RATE,
            });
        }

        endpoint.set_stream_active(true);
        let _ = endpoint.send(&Message::StreamStart(start));

        // Current artwork goes out immediately so late joiners render it.
        let now = now_micros();
        for (channel, config) in artwork_channels.iter().enumerate() {
            if let Some(image) = self.artwork.get(&config.source) {
                send_artwork(&endpoint, channel as u8, now, image.clone());
            }
        }

        log::info!(
            "[Stream] Member {} joined stream {} (player: {})",
            hello.client_id,
            self.stream_id,
            player.is_some()
        );
        self.sessions.insert(
            hello.client_id.clone(),
            StreamSession {
                endpoint,
                client_id: hello.client_id,
                player,
                artwork_channels,
                visualizer,
            },
        );
    }

    /// Arms a mid-stream format change at the next block boundary at or
    /// after `now + min_lead`.
    fn request_format(&mut self, client_id: &str, request: &PlayerFormatRequest) {
        let next_block = self.next_block_ts();
        let block_us = self.block_us();
        let basis = self.basis_us;

        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let Some(player) = session.player.as_mut() else {
            return;
        };

        let merged = request.merge_over(player.format);
        if merged == player.format {
            log::debug!("[Stream] {} requested the active format, suppressing", client_id);
            player.pending_format = None;
            return;
        }

        let encoder = match self.encoders.create(&self.source_format, &merged) {
            Ok(encoder) => encoder,
            Err(e) => {
                log::warn!(
                    "[Stream] Rejecting format request from {}: {}",
                    client_id,
                    e
                );
                return;
            }
        };

        let min_t = now_micros() + FORMAT_SWITCH_MIN_LEAD_MICROS;
        let switch_at = if next_block >= min_t {
            next_block
        } else {
            let blocks = (min_t - basis + block_us - 1) / block_us;
            basis + blocks * block_us
        };

        let update = StreamPlayerUpdate {
            codec: DeltaField::diff(Some(&player.format.codec), Some(&merged.codec)),
            sample_rate: DeltaField::diff(
                Some(&player.format.sample_rate),
                Some(&merged.sample_rate),
            ),
            channels: DeltaField::diff(Some(&player.format.channels), Some(&merged.channels)),
            bit_depth: DeltaField::diff(Some(&player.format.bit_depth), Some(&merged.bit_depth)),
            codec_header: match encoder.codec_header() {
                Some(h) => {
                    DeltaField::Value(base64::engine::general_purpose::STANDARD.encode(&h))
                }
                None => DeltaField::Absent,
            },
        };
        let _ = session.endpoint.send(&Message::StreamUpdate(StreamUpdate {
            player: Some(update),
        }));

        log::info!(
            "[Stream] {} format change armed: {:?} -> {:?} at {}µs",
            client_id,
            player.format.codec,
            merged.codec,
            switch_at
        );
        player.pending_format = Some(PendingFormat {
            format: merged,
            switch_at,
            encoder,
        });
    }

    /// Applies an artwork channel reconfiguration: absent fields keep the
    /// negotiated value, and the channel's current content is refreshed
    /// (or cleared when the new source is `none`).
    fn reconfigure_artwork(&mut self, client_id: &str, request: &ArtworkFormatRequest) {
        let artwork = &self.artwork;
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let Some(config) = session
            .artwork_channels
            .get_mut(usize::from(request.channel))
        else {
            log::warn!(
                "[Stream] {} reconfigured unknown artwork channel {}",
                client_id,
                request.channel
            );
            return;
        };
        if let Some(source) = request.source {
            config.source = source;
        }
        if let Some(format) = request.format {
            config.format = format;
        }
        if let Some(width) = request.media_width {
            config.media_width = width;
        }
        if let Some(height) = request.media_height {
            config.media_height = height;
        }

        let now = now_micros();
        match artwork.get(&config.source) {
            Some(image) if config.source != ArtworkSource::None => {
                send_artwork(&session.endpoint, request.channel, now, image.clone());
            }
            _ => send_artwork(&session.endpoint, request.channel, now, Bytes::new()),
        }
    }

    fn set_artwork(&mut self, source: ArtworkSource, image: Bytes) {
        if source == ArtworkSource::None {
            return;
        }
        self.artwork.insert(source, image.clone());
        let now = now_micros();
        for session in self.sessions.values() {
            for (channel, config) in session.artwork_channels.iter().enumerate() {
                if config.source == source {
                    send_artwork(&session.endpoint, channel as u8, now, image.clone());
                }
            }
        }
    }

    fn clear_artwork(&mut self, source: ArtworkSource) {
        if self.artwork.remove(&source).is_none() {
            return;
        }
        let now = now_micros();
        for session in self.sessions.values() {
            for (channel, config) in session.artwork_channels.iter().enumerate() {
                if config.source == source {
                    send_artwork(&session.endpoint, channel as u8, now, Bytes::new());
                }
            }
        }
    }

    /// Drops buffered frames on both ends and re-anchors presentation
    /// time just ahead of now.
    fn clear_buffers(&mut self) {
        let clear = Message::StreamClear(StreamClear { roles: None });
        for session in self.sessions.values_mut() {
            let _ = session.endpoint.send(&clear);
            if let Some(player) = session.player.as_mut() {
                player.pending.clear();
                player.in_flight.clear();
                player.bytes_in_flight = 0;
            }
        }
        self.basis_us = now_micros() + STREAM_START_LEAD_MICROS - self.cursor_us();
    }

    /// Ends one member's session without disconnecting it.
    fn end_session(&mut self, client_id: &str) {
        if let Some(session) = self.sessions.remove(client_id) {
            let _ = session.endpoint.send(&Message::StreamEnd(StreamEnd::default()));
            session.endpoint.set_stream_active(false);
        }
    }

    /// Ends the stream for every member and releases encoder state.
    fn finish(&mut self) {
        log::info!("[Stream] Stream {} ending", self.stream_id);
        let end = Message::StreamEnd(StreamEnd::default());
        for session in self.sessions.values() {
            let _ = session.endpoint.send(&end);
            session.endpoint.set_stream_active(false);
        }
        for session in self.sessions.values() {
            if let Some(player) = &session.player {
                if player.late_drops > 0 {
                    log::debug!(
                        "[Stream] {} dropped {} late frame(s) over the stream",
                        session.client_id,
                        player.late_drops
                    );
                }
            }
        }
        self.sessions.clear();
        self.emitter.emit_stream(StreamEvent::Ended {
            group_id: self.group_id.clone(),
            stream_id: self.stream_id.clone(),
        });
    }
}

/// Hands pending frames to the endpoint writer, honoring the capacity
/// estimate and the late-frame floor.
fn flush_player(endpoint: &Arc<Endpoint>, player: &mut PlayerSession, now: i64) {
    while let Some(&(ts, len)) = player.in_flight.front() {
        if ts > now {
            break;
        }
        player.in_flight.pop_front();
        player.bytes_in_flight = player.bytes_in_flight.saturating_sub(len);
    }

    loop {
        let (ts, len) = match player.pending.front() {
            Some((ts, payload)) => (*ts, payload.len() as u64),
            None => break,
        };
        if ts - now < STREAM_MIN_JITTER_MICROS {
            // Too late to be useful on the other end.
            player.pending.pop_front();
            player.late_drops += 1;
            continue;
        }
        if ts - now > player.lead_us {
            break;
        }
        if player.bytes_in_flight + len > player.capacity {
            break;
        }
        let Some((ts, payload)) = player.pending.pop_front() else {
            break;
        };
        match BinaryFrame::new(BinaryChannel::AUDIO, ts, payload) {
            Ok(frame) => {
                if endpoint.send_binary(&frame).is_err() {
                    return;
                }
                player.in_flight.push_back((ts, len));
                player.bytes_in_flight += len;
            }
            Err(e) => {
                log::warn!("[Stream] Skipping unencodable frame: {}", e);
            }
        }
    }
}

fn send_artwork(endpoint: &Arc<Endpoint>, channel: u8, now: i64, image: Bytes) {
    let Ok(channel) = BinaryChannel::artwork(channel) else {
        return;
    };
    if let Ok(frame) = BinaryFrame::new(channel, now + ARTWORK_LEAD_MICROS, image) {
        let _ = endpoint.send_binary(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::transport::{memory_pair, BoxFrameSink, BoxFrameSource, WireFrame};
    use crate::endpoint::EndpointObserver;
    use crate::error::ResonateResult;
    use crate::events::NoopEventEmitter;
    use crate::protocol::messages::{
        ClientHello, Codec, ImageFormat, PlayerCommandKind, PlayerSupport, ServerHello,
    };
    use crate::protocol::{self, CodecError};
    use crate::stream::{AudioSource, EncoderFactory};
    use std::time::Duration;
    use tokio::time::timeout;

    struct SilenceSource;

    impl AudioSource for SilenceSource {
        fn pull(&mut self, frames: usize) -> Option<Bytes> {
            Some(Bytes::from(vec![0u8; frames * 4]))
        }
    }

    struct Passthrough(AudioFormat);

    impl super::super::AudioEncoder for Passthrough {
        fn format(&self) -> AudioFormat {
            self.0
        }

        fn codec_header(&self) -> Option<Bytes> {
            None
        }

        fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, super::super::EncoderError> {
            Ok(Bytes::copy_from_slice(pcm))
        }
    }

    struct PcmFactory;

    impl EncoderFactory for PcmFactory {
        fn negotiate(
            &self,
            source: &AudioFormat,
            supported: &[AudioFormat],
        ) -> Option<AudioFormat> {
            supported.iter().find(|f| **f == *source).copied()
        }

        fn create(
            &self,
            _source: &AudioFormat,
            target: &AudioFormat,
        ) -> Result<Box<dyn super::super::AudioEncoder>, super::super::EncoderError> {
            Ok(Box::new(Passthrough(*target)))
        }
    }

    struct Acceptor;

    impl EndpointObserver for Acceptor {
        fn accept_hello(&self, _hello: &ClientHello) -> ResonateResult<ServerHello> {
            Ok(ServerHello {
                server_id: "s1".into(),
                name: "test".into(),
                version: 1,
            })
        }

        fn on_established(&self, _endpoint: &Arc<Endpoint>) {}
        fn on_message(&self, _endpoint: &Arc<Endpoint>, _message: Message) {}
        fn on_disconnected(
            &self,
            _endpoint: &Arc<Endpoint>,
            _reason: crate::endpoint::CloseReason,
            _retry: bool,
        ) {
        }
    }

    fn pcm() -> AudioFormat {
        AudioFormat {
            codec: Codec::Pcm,
            channels: 2,
            sample_rate: 48_000,
            bit_depth: 16,
        }
    }

    fn spawn_controller() -> StreamHandle {
        StreamController::spawn(
            "g1".into(),
            StreamConfig {
                source_format: pcm(),
                source: Box::new(SilenceSource),
                encoders: Arc::new(PcmFactory),
                visualizer: None,
            },
            Arc::new(NoopEventEmitter),
            Box::new(|| {}),
        )
    }

    /// Handshakes a member endpoint over an in-memory transport.
    async fn established_member(
        hello: ClientHello,
    ) -> (Arc<Endpoint>, BoxFrameSink, BoxFrameSource) {
        let ((mut peer_tx, peer_rx), (local_tx, local_rx)) = memory_pair();
        let endpoint = Endpoint::accept(local_tx, local_rx, Arc::new(Acceptor));
        peer_tx
            .send(WireFrame::Text(protocol::encode_text(
                &Message::ClientHello(hello),
            )))
            .await
            .unwrap();
        let mut peer_rx = peer_rx;
        // Consume the server/hello.
        loop {
            match peer_rx.next().await.unwrap().unwrap() {
                WireFrame::Text(_) => break,
                _ => continue,
            }
        }
        (endpoint, peer_tx, peer_rx)
    }

    fn artwork_hello() -> ClientHello {
        ClientHello {
            client_id: "art1".into(),
            name: "Frame".into(),
            device_info: None,
            version: 1,
            supported_roles: vec![Role::Artwork],
            player_support: None,
            artwork_support: Some(crate::protocol::messages::ArtworkSupport {
                channels: vec![ArtworkChannelConfig {
                    source: ArtworkSource::Album,
                    format: ImageFormat::Jpeg,
                    media_width: 300,
                    media_height: 300,
                }],
            }),
            visualizer_support: None,
        }
    }

    fn player_hello() -> ClientHello {
        ClientHello {
            client_id: "p1".into(),
            name: "Speaker".into(),
            device_info: None,
            version: 1,
            supported_roles: vec![Role::Player],
            player_support: Some(PlayerSupport {
                support_formats: vec![pcm()],
                buffer_capacity: 262_144,
                supported_commands: vec![PlayerCommandKind::Volume],
            }),
            artwork_support: None,
            visualizer_support: None,
        }
    }

    async fn next_text(rx: &mut BoxFrameSource) -> Message {
        loop {
            match timeout(Duration::from_secs(5), rx.next())
                .await
                .expect("timed out")
                .unwrap()
                .unwrap()
            {
                WireFrame::Text(text) => return protocol::decode_text(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn next_binary(rx: &mut BoxFrameSource) -> Result<BinaryFrame, CodecError> {
        loop {
            match timeout(Duration::from_secs(5), rx.next())
                .await
                .expect("timed out")
                .unwrap()
                .unwrap()
            {
                WireFrame::Binary(data) => return BinaryFrame::decode(&data),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn player_member_receives_stream_start_and_audio() {
        let handle = spawn_controller();
        let (endpoint, _tx, mut rx) = established_member(player_hello()).await;
        handle.add_member(Arc::clone(&endpoint));

        let start = next_text(&mut rx).await;
        let Message::StreamStart(start) = start else {
            panic!("expected stream/start, got {start:?}");
        };
        let player = start.player.expect("player block present");
        assert_eq!(player.codec, Codec::Pcm);
        assert_eq!(player.sample_rate, 48_000);
        assert!(endpoint.stream_active());

        let frame = next_binary(&mut rx).await.unwrap();
        assert_eq!(frame.channel, BinaryChannel::AUDIO);
        assert!(frame.timestamp > 0);

        handle.end();
        let end = next_text(&mut rx).await;
        assert!(matches!(end, Message::StreamEnd(_)));
    }

    #[tokio::test]
    async fn artwork_set_publishes_and_clear_sends_empty_payload() {
        let handle = spawn_controller();
        let (endpoint, _tx, mut rx) = established_member(artwork_hello()).await;
        handle.add_member(Arc::clone(&endpoint));

        let start = next_text(&mut rx).await;
        let Message::StreamStart(start) = start else {
            panic!("expected stream/start, got {start:?}");
        };
        assert!(start.artwork.is_some());
        assert!(start.player.is_none(), "no player block without the role");

        handle.set_artwork(ArtworkSource::Album, Bytes::from_static(b"jpegbytes"));
        let frame = next_binary(&mut rx).await.unwrap();
        assert_eq!(frame.channel, BinaryChannel::Artwork(0));
        assert_eq!(frame.payload.as_ref(), b"jpegbytes");

        handle.clear_artwork(ArtworkSource::Album);
        let clear = next_binary(&mut rx).await.unwrap();
        assert_eq!(clear.channel, BinaryChannel::Artwork(0));
        assert!(clear.is_artwork_clear());

        handle.end();
    }

    #[tokio::test]
    async fn late_joiner_receives_current_artwork() {
        let handle = spawn_controller();
        handle.set_artwork(ArtworkSource::Album, Bytes::from_static(b"cover"));
        // Give the controller a turn to store the artwork.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (endpoint, _tx, mut rx) = established_member(artwork_hello()).await;
        handle.add_member(Arc::clone(&endpoint));

        let _start = next_text(&mut rx).await;
        let frame = next_binary(&mut rx).await.unwrap();
        assert_eq!(frame.payload.as_ref(), b"cover");

        handle.end();
    }

    #[tokio::test]
    async fn clear_notifies_members_and_reanchors_time() {
        let handle = spawn_controller();
        let (endpoint, _tx, mut rx) = established_member(player_hello()).await;
        handle.add_member(Arc::clone(&endpoint));

        let _start = next_text(&mut rx).await;
        let _first = next_binary(&mut rx).await.unwrap();

        handle.clear();
        let clear = next_text(&mut rx).await;
        assert!(matches!(clear, Message::StreamClear(_)));

        handle.end();
    }
}
