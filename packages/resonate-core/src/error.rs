//! Centralized error types for the Resonate core library.
//!
//! Module-level error enums (`CodecError`, `TransportError`, `EncoderError`)
//! are defined next to the code that produces them; this module provides the
//! crate-wide [`ResonateError`] with machine-readable codes and the `From`
//! conversions between layers.

use thiserror::Error;

pub use crate::endpoint::transport::TransportError;
pub use crate::protocol::CodecError;
pub use crate::stream::EncoderError;

/// Application-wide error type for the Resonate protocol engine.
#[derive(Debug, Error)]
pub enum ResonateError {
    /// A wire frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A text `type` or binary type byte was not recognized.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// A message arrived in a handshake phase that forbids it.
    #[error("Message not valid in current phase: {0}")]
    WrongPhase(String),

    /// A message targeted a role the peer did not declare.
    #[error("Message targets undeclared role: {0}")]
    WrongRole(String),

    /// A payload field was outside its permitted range.
    #[error("Payload out of range: {0}")]
    PayloadRange(String),

    /// The endpoint's bounded send queue overflowed.
    #[error("Send queue overflow")]
    BufferOverrun,

    /// The underlying socket failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The clock filter covariance exceeded the fatal threshold.
    #[error("Clock estimate diverged")]
    ClockDivergence,

    /// An audio encoder failed.
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// The endpoint is closed or closing; no further sends are accepted.
    #[error("Endpoint closed")]
    Closed,

    /// Discovery layer failure (mDNS daemon, browse, or registration).
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Addressed group does not exist.
    #[error("Group not found: {0}")]
    GroupNotFound(String),
}

impl ResonateError {
    /// Returns a machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::WrongPhase(_) => "wrong_phase",
            Self::WrongRole(_) => "wrong_role",
            Self::PayloadRange(_) => "payload_range",
            Self::BufferOverrun => "buffer_overrun",
            Self::Transport(_) => "transport_error",
            Self::ClockDivergence => "clock_divergence",
            Self::Encoder(_) => "encoder_error",
            Self::Closed => "endpoint_closed",
            Self::Discovery(_) => "discovery_failed",
            Self::GroupNotFound(_) => "group_not_found",
        }
    }

    /// Whether this error terminates the endpoint it occurred on.
    ///
    /// Recoverable errors are logged and localized; only transport and
    /// handshake-level errors tear a connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WrongPhase(_) | Self::BufferOverrun | Self::Transport(_)
        )
    }
}

impl From<CodecError> for ResonateError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedFrame(m) => Self::MalformedFrame(m),
            CodecError::UnknownMessageType(m) => Self::UnknownMessageType(m),
            CodecError::PayloadRange(m) => Self::PayloadRange(m),
        }
    }
}

impl From<TransportError> for ResonateError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<EncoderError> for ResonateError {
    fn from(err: EncoderError) -> Self {
        Self::Encoder(err.to_string())
    }
}

/// Convenient Result alias for crate-wide operations.
pub type ResonateResult<T> = Result<T, ResonateError>;
