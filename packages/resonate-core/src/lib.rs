//! Resonate Core - the protocol engine for Resonate multi-room audio.
//!
//! This crate provides the engine shared by server and client endpoints of
//! the Resonate protocol: the connection lifecycle, the clock-sync filter,
//! the per-client stream scheduler and the group state machine. It is used
//! by the headless reference server and the reference CLI client.
//!
//! # Architecture
//!
//! - [`protocol`]: text and binary wire codecs, delta-merge semantics
//! - [`endpoint`]: one WebSocket peer with its reader/writer tasks,
//!   handshake state machine and reconnect driver
//! - [`clock`]: offset/drift estimation between peer monotonic clocks
//! - [`group`]: membership, playback state, volume aggregation, fan-out
//! - [`stream`]: timestamped frame production per member session
//! - [`discovery`]: mDNS advertisement and browse-to-connect glue
//! - [`server`] / [`client`]: the two endpoint roles wired together
//! - [`events`]: domain event emission for embedding hosts
//!
//! # Abstraction Traits
//!
//! External collaborators plug in through traits: codecs via
//! [`stream::EncoderFactory`], raw audio via [`stream::AudioSource`],
//! application capabilities via [`group::MediaController`], transports via
//! [`endpoint::transport::FrameSink`]/[`endpoint::transport::FrameSource`],
//! and host integration via [`events::EventEmitter`].

#![warn(clippy::all)]

pub mod api;
pub mod client;
pub mod clock;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod group;
pub mod protocol;
pub mod protocol_constants;
pub mod registry;
pub mod server;
pub mod stream;

// Re-export commonly used types at the crate root
pub use client::{ClientDelegate, ClientSession, PlayerModel, TimedFrame};
pub use clock::{now_micros, ClockFilter, ClockSnapshot};
pub use discovery::{DiscoveryRecord, MdnsAdvertiser};
pub use endpoint::reconnect::{ReconnectDriver, WsDialer};
pub use endpoint::{CloseReason, Endpoint, EndpointObserver, Phase};
pub use error::{ResonateError, ResonateResult};
pub use events::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};
pub use group::{GroupEngine, MediaController, MetadataSnapshot, StreamFactory};
pub use protocol::messages::{AudioFormat, Codec, Message, PlaybackState, Role};
pub use protocol::{BinaryChannel, BinaryFrame, DeltaField};
pub use registry::ConnectionRegistry;
pub use server::{ResonateServer, ServerIdentity, ServerSessionFactory};
pub use stream::{AudioEncoder, AudioSource, EncoderFactory, StreamConfig};
