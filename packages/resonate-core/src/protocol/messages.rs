//! Text message envelope and payload definitions.
//!
//! Every text frame is `{ "type": <string>, "payload": <object|absent> }`.
//! The envelope is modelled as an adjacently tagged enum; payload-less types
//! (`stream/end`) are normalized by the codec in [`super`] so both the
//! absent and the empty-object spellings decode.

use serde::{Deserialize, Serialize};

use super::delta::DeltaField;

/// Top-level protocol message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// Client handshake opener. Only message a client may send pre-handshake.
    #[serde(rename = "client/hello")]
    ClientHello(ClientHello),

    /// Server handshake reply. Always the first server-origin text frame.
    #[serde(rename = "server/hello")]
    ServerHello(ServerHello),

    /// Clock-sync probe from the client.
    #[serde(rename = "client/time")]
    ClientTime(ClientTime),

    /// Clock-sync reply carrying the server receive/transmit stamps.
    #[serde(rename = "server/time")]
    ServerTime(ServerTime),

    /// Client role-state report (player volume, mute, sync state).
    #[serde(rename = "client/state")]
    ClientState(ClientState),

    /// Server role-state fan-out (metadata, controller). Delta-merged.
    #[serde(rename = "server/state")]
    ServerState(ServerState),

    /// Controller command from a client.
    #[serde(rename = "client/command")]
    ClientCommand(ClientCommand),

    /// Player command from the server (volume/mute only).
    #[serde(rename = "server/command")]
    ServerCommand(ServerCommand),

    /// Stream opener with per-role configuration.
    #[serde(rename = "stream/start")]
    StreamStart(StreamStart),

    /// Mid-stream format change. Delta-merged.
    #[serde(rename = "stream/update")]
    StreamUpdate(StreamUpdate),

    /// Stream terminator. Carries no payload.
    #[serde(rename = "stream/end")]
    StreamEnd(StreamEnd),

    /// Instructs members to drop buffered frames without ending the stream.
    #[serde(rename = "stream/clear")]
    StreamClear(StreamClear),

    /// Client request for a different stream format.
    #[serde(rename = "stream/request-format")]
    StreamRequestFormat(StreamRequestFormat),

    /// Group context and playback state. Delta-merged.
    #[serde(rename = "group/update")]
    GroupUpdate(GroupUpdate),

    /// Graceful disconnect notice from the client.
    #[serde(rename = "client/goodbye")]
    ClientGoodbye(ClientGoodbye),
}

impl Message {
    /// The wire `type` string of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientHello(_) => "client/hello",
            Self::ServerHello(_) => "server/hello",
            Self::ClientTime(_) => "client/time",
            Self::ServerTime(_) => "server/time",
            Self::ClientState(_) => "client/state",
            Self::ServerState(_) => "server/state",
            Self::ClientCommand(_) => "client/command",
            Self::ServerCommand(_) => "server/command",
            Self::StreamStart(_) => "stream/start",
            Self::StreamUpdate(_) => "stream/update",
            Self::StreamEnd(_) => "stream/end",
            Self::StreamClear(_) => "stream/clear",
            Self::StreamRequestFormat(_) => "stream/request-format",
            Self::GroupUpdate(_) => "group/update",
            Self::ClientGoodbye(_) => "client/goodbye",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Roles and formats
// ─────────────────────────────────────────────────────────────────────────────

/// Declared capability of an endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Player,
    Controller,
    Metadata,
    Artwork,
    Visualizer,
}

impl Role {
    /// Roles that receive `stream/*` traffic and binary frames.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Player | Self::Artwork | Self::Visualizer)
    }
}

/// Audio codec identifier. Codec implementations are external; the core
/// only routes and negotiates these tags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Opus,
    Flac,
    Pcm,
}

/// One audio format a player supports, or the format of an active stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: Codec,
    pub channels: u8,
    pub sample_rate: u32,
    pub bit_depth: u8,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

/// `client/hello` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientHello {
    pub client_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    pub version: u32,
    pub supported_roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_support: Option<PlayerSupport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_support: Option<ArtworkSupport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualizer_support: Option<VisualizerSupport>,
}

/// Optional device metadata in `client/hello`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

/// Player capability block in `client/hello`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerSupport {
    pub support_formats: Vec<AudioFormat>,
    /// Client-side buffer capacity in bytes.
    pub buffer_capacity: u64,
    /// Commands the server may issue via `server/command.player`.
    pub supported_commands: Vec<PlayerCommandKind>,
}

/// Artwork capability block in `client/hello`. One entry per channel,
/// length 1..=4.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtworkSupport {
    pub channels: Vec<ArtworkChannelConfig>,
}

/// Negotiated configuration of one artwork channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtworkChannelConfig {
    pub source: ArtworkSource,
    pub format: ImageFormat,
    pub media_width: u32,
    pub media_height: u32,
}

/// What an artwork channel displays. `none` renders the channel inert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtworkSource {
    Album,
    Artist,
    None,
}

/// Image container for an artwork channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Bmp,
}

/// Visualizer capability block in `client/hello`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisualizerSupport {
    /// Client-side buffer capacity in bytes.
    pub buffer_capacity: u64,
}

/// `server/hello` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerHello {
    pub server_id: String,
    pub name: String,
    pub version: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Time synchronization
// ─────────────────────────────────────────────────────────────────────────────

/// `client/time` payload. All stamps are monotonic microseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientTime {
    pub client_transmitted: i64,
}

/// `server/time` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerTime {
    pub client_transmitted: i64,
    pub server_received: i64,
    pub server_transmitted: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// State reports
// ─────────────────────────────────────────────────────────────────────────────

/// `client/state` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerState>,
}

/// Player block of `client/state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    pub state: PlayerSyncState,
    pub volume: u8,
    pub muted: bool,
}

/// Whether the player considers itself clock-synchronized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlayerSyncState {
    Synchronized,
    Error,
}

/// `server/state` payload. Role-gated: the metadata block goes to
/// `metadata` members, the controller block to `controller` members.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerState>,
}

/// Track metadata fan-out. All fields except `timestamp` are delta-merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataState {
    /// Server-clock µs the progress fields are relative to.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub title: DeltaField<String>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub artist: DeltaField<String>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub album_artist: DeltaField<String>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub album: DeltaField<String>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub artwork_url: DeltaField<String>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub year: DeltaField<u32>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub track: DeltaField<String>,
    /// Track position in µs at `timestamp`.
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub position: DeltaField<i64>,
    /// Track duration in µs.
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub duration: DeltaField<i64>,
    /// 1.0 = realtime, 0.0 = paused.
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub playback_speed: DeltaField<f64>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub repeat: DeltaField<RepeatMode>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub shuffle: DeltaField<bool>,
}

/// Repeat mode reported through metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    Off,
    One,
    All,
}

/// Controller block of `server/state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerState {
    pub supported_commands: Vec<ControllerCommandKind>,
    /// Aggregate group volume, 0..=100.
    pub volume: u8,
    pub muted: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// `client/command` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerCommand>,
}

/// Controller block of `client/command`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerCommand {
    pub command: ControllerCommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

/// Commands a controller may submit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ControllerCommandKind {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Volume,
    Mute,
    RepeatOff,
    RepeatOne,
    RepeatAll,
    Shuffle,
    Unshuffle,
    Switch,
}

/// `server/command` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerCommand>,
}

/// Player block of `server/command`. The server only issues commands the
/// client declared in `supported_commands`; the client echoes the result
/// via `client/state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerCommand {
    pub command: PlayerCommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

/// Commands the server may issue to a player.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlayerCommandKind {
    Volume,
    Mute,
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream control
// ─────────────────────────────────────────────────────────────────────────────

/// `stream/start` payload. Blocks are present only for roles the member
/// declared.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamStart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<StreamPlayerStart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<StreamArtworkStart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualizer: Option<StreamVisualizerStart>,
}

/// Player block of `stream/start`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamPlayerStart {
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    /// Codec-specific initialization blob, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_header: Option<String>,
}

/// Artwork block of `stream/start`: the negotiated channel table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamArtworkStart {
    pub channels: Vec<ArtworkChannelConfig>,
}

/// Visualizer block of `stream/start`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamVisualizerStart {
    /// Feature frames per second the server will target.
    pub rate: u32,
}

/// `stream/update` payload: the delta between the previous and the next
/// active format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<StreamPlayerUpdate>,
}

/// Player block of `stream/update`. Absent fields keep their prior value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamPlayerUpdate {
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub codec: DeltaField<Codec>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub sample_rate: DeltaField<u32>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub channels: DeltaField<u8>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub bit_depth: DeltaField<u8>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub codec_header: DeltaField<String>,
}

impl StreamPlayerUpdate {
    /// True when no field carries a change.
    pub fn is_noop(&self) -> bool {
        self.codec.is_absent()
            && self.sample_rate.is_absent()
            && self.channels.is_absent()
            && self.bit_depth.is_absent()
            && self.codec_header.is_absent()
    }
}

/// `stream/end` payload: none. Decoded from absent or empty objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamEnd {}

/// `stream/clear` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamClear {
    /// Roles whose buffers should be dropped; absent means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<Role>>,
}

/// `stream/request-format` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamRequestFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerFormatRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<ArtworkFormatRequest>,
}

/// Player block of `stream/request-format`. Absent fields keep the
/// current stream value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerFormatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<Codec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u8>,
}

impl PlayerFormatRequest {
    /// Merges this request over an active format; absent fields retain.
    pub fn merge_over(&self, current: AudioFormat) -> AudioFormat {
        AudioFormat {
            codec: self.codec.unwrap_or(current.codec),
            channels: self.channels.unwrap_or(current.channels),
            sample_rate: self.sample_rate.unwrap_or(current.sample_rate),
            bit_depth: self.bit_depth.unwrap_or(current.bit_depth),
        }
    }
}

/// Artwork block of `stream/request-format`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtworkFormatRequest {
    pub channel: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ArtworkSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_height: Option<u32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Group
// ─────────────────────────────────────────────────────────────────────────────

/// `group/update` payload. All fields delta-merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupUpdate {
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub playback_state: DeltaField<PlaybackState>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub group_id: DeltaField<String>,
    #[serde(default, skip_serializing_if = "DeltaField::is_absent")]
    pub group_name: DeltaField<String>,
}

/// Group playback state. Three-valued; `stopped` is never collapsed into
/// `paused` when reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// `client/goodbye` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientGoodbye {
    pub reason: GoodbyeReason,
}

/// Why a client is disconnecting gracefully.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoodbyeReason {
    AnotherServer,
    Shutdown,
    Restart,
    UserRequest,
}
