//! Event emitter abstraction for decoupling the engine from its host.
//!
//! The engine emits domain events through the [`EventEmitter`] trait rather
//! than concrete channels, so hosts (headless server, desktop shell, tests)
//! choose their own delivery.

use crate::endpoint::CloseReason;
use crate::protocol::messages::{PlaybackState, Role};

/// Endpoint lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// Handshake completed; the peer is established.
    Connected {
        client_id: String,
        name: String,
        roles: Vec<Role>,
    },
    /// The endpoint closed. Fired exactly once per connection.
    Disconnected {
        client_id: Option<String>,
        reason: CloseReason,
        will_retry: bool,
    },
}

/// Group state events.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    Created {
        group_id: String,
    },
    Disposed {
        group_id: String,
    },
    MemberJoined {
        group_id: String,
        client_id: String,
    },
    MemberLeft {
        group_id: String,
        client_id: String,
    },
    PlaybackChanged {
        group_id: String,
        state: PlaybackState,
    },
    VolumeChanged {
        group_id: String,
        volume: u8,
        muted: bool,
    },
}

/// Stream lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Started {
        group_id: String,
        stream_id: String,
    },
    Ended {
        group_id: String,
        stream_id: String,
    },
    FormatChanged {
        stream_id: String,
        client_id: String,
    },
}

/// Clock filter events.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    /// Covariance crossed the fatal threshold.
    Diverged { client_id: String },
}

/// Trait for emitting domain events without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    fn emit_endpoint(&self, event: EndpointEvent);
    fn emit_group(&self, event: GroupEvent);
    fn emit_stream(&self, event: StreamEvent);
    fn emit_clock(&self, event: ClockEvent);
}

/// No-op emitter for hosts that only consume wire traffic.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_endpoint(&self, _event: EndpointEvent) {}
    fn emit_group(&self, _event: GroupEvent) {}
    fn emit_stream(&self, _event: StreamEvent) {}
    fn emit_clock(&self, _event: ClockEvent) {}
}

/// Logs all events at debug level. Useful in development.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_endpoint(&self, event: EndpointEvent) {
        log::debug!("[Event] endpoint: {:?}", event);
    }

    fn emit_group(&self, event: GroupEvent) {
        log::debug!("[Event] group: {:?}", event);
    }

    fn emit_stream(&self, event: StreamEvent) {
        log::debug!("[Event] stream: {:?}", event);
    }

    fn emit_clock(&self, event: ClockEvent) {
        log::debug!("[Event] clock: {:?}", event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Test emitter that records group events.
    #[derive(Default)]
    struct RecordingEmitter {
        group: Mutex<Vec<GroupEvent>>,
    }

    impl EventEmitter for RecordingEmitter {
        fn emit_endpoint(&self, _event: EndpointEvent) {}

        fn emit_group(&self, event: GroupEvent) {
            self.group.lock().push(event);
        }

        fn emit_stream(&self, _event: StreamEvent) {}

        fn emit_clock(&self, _event: ClockEvent) {}
    }

    #[test]
    fn recording_emitter_captures_events() {
        let emitter = RecordingEmitter::default();
        emitter.emit_group(GroupEvent::Created {
            group_id: "g1".into(),
        });
        emitter.emit_group(GroupEvent::PlaybackChanged {
            group_id: "g1".into(),
            state: PlaybackState::Playing,
        });
        let events = emitter.group.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            GroupEvent::PlaybackChanged {
                group_id: "g1".into(),
                state: PlaybackState::Playing,
            }
        );
    }
}
