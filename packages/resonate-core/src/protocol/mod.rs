//! Protocol codec: text envelopes, binary frames and delta semantics.

pub mod binary;
pub mod delta;
pub mod messages;

use serde_json::Value;
use thiserror::Error;

pub use binary::{BinaryChannel, BinaryFrame};
pub use delta::DeltaField;
pub use messages::Message;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame too short, or text that is not valid JSON.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Unrecognized `type` string or binary type byte.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A field value outside its permitted range.
    #[error("payload out of range: {0}")]
    PayloadRange(String),
}

/// Decodes a text frame into a [`Message`].
///
/// A missing `payload` key is normalized to an empty object first, so
/// payload-less types (`stream/end`) decode from both spellings.
pub fn decode_text(text: &str) -> Result<Message, CodecError> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

    let obj = value
        .as_object_mut()
        .ok_or_else(|| CodecError::MalformedFrame("top level is not an object".into()))?;
    if !obj.contains_key("payload") {
        obj.insert("payload".into(), Value::Object(Default::default()));
    }

    serde_json::from_value(value).map_err(|e| {
        let text = e.to_string();
        if text.contains("unknown variant") {
            CodecError::UnknownMessageType(text)
        } else {
            CodecError::MalformedFrame(text)
        }
    })
}

/// Encodes a [`Message`] into a text frame.
///
/// `stream/end` is emitted without a payload object (decoders accept both;
/// absent is preferred on encode).
pub fn encode_text(message: &Message) -> String {
    let mut value = serde_json::to_value(message)
        .unwrap_or_else(|e| unreachable!("message serialization cannot fail: {e}"));
    if matches!(message, Message::StreamEnd(_)) {
        if let Some(obj) = value.as_object_mut() {
            obj.remove("payload");
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::messages::*;
    use super::*;

    #[test]
    fn decodes_reference_client_hello() {
        let text = r#"{"type":"client/hello","payload":{"client_id":"c1","name":"Kitchen","version":1,"supported_roles":["player"],"player_support":{"support_formats":[{"codec":"pcm","channels":2,"sample_rate":48000,"bit_depth":16}],"buffer_capacity":262144,"supported_commands":["volume","mute"]}}}"#;
        let msg = decode_text(text).unwrap();
        let Message::ClientHello(hello) = msg else {
            panic!("expected client/hello, got {msg:?}");
        };
        assert_eq!(hello.client_id, "c1");
        assert_eq!(hello.name, "Kitchen");
        assert_eq!(hello.supported_roles, vec![Role::Player]);
        let player = hello.player_support.unwrap();
        assert_eq!(player.buffer_capacity, 262_144);
        assert_eq!(
            player.support_formats[0],
            AudioFormat {
                codec: Codec::Pcm,
                channels: 2,
                sample_rate: 48_000,
                bit_depth: 16,
            }
        );
        assert_eq!(
            player.supported_commands,
            vec![PlayerCommandKind::Volume, PlayerCommandKind::Mute]
        );
    }

    #[test]
    fn server_hello_round_trips() {
        let msg = Message::ServerHello(ServerHello {
            server_id: "s1".into(),
            name: "Living Room Server".into(),
            version: 1,
        });
        let text = encode_text(&msg);
        assert!(text.contains(r#""type":"server/hello""#));
        assert_eq!(decode_text(&text).unwrap(), msg);
    }

    #[test]
    fn stream_end_accepts_absent_and_empty_payload() {
        for text in [
            r#"{"type":"stream/end"}"#,
            r#"{"type":"stream/end","payload":{}}"#,
        ] {
            assert_eq!(
                decode_text(text).unwrap(),
                Message::StreamEnd(StreamEnd::default())
            );
        }
    }

    #[test]
    fn stream_end_encodes_without_payload() {
        let text = encode_text(&Message::StreamEnd(StreamEnd::default()));
        assert_eq!(text, r#"{"type":"stream/end"}"#);
    }

    #[test]
    fn unknown_type_is_distinguished_from_malformed() {
        assert!(matches!(
            decode_text(r#"{"type":"client/quux","payload":{}}"#),
            Err(CodecError::UnknownMessageType(_))
        ));
        assert!(matches!(
            decode_text("not json"),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn group_update_preserves_delta_trichotomy() {
        let update: Message = decode_text(
            r#"{"type":"group/update","payload":{"playback_state":"stopped","group_name":null}}"#,
        )
        .unwrap();
        let Message::GroupUpdate(update) = update else {
            panic!("expected group/update");
        };
        assert_eq!(
            update.playback_state,
            DeltaField::Value(PlaybackState::Stopped)
        );
        assert_eq!(update.group_id, DeltaField::Absent);
        assert_eq!(update.group_name, DeltaField::Null);
    }

    #[test]
    fn stream_update_emits_only_changed_fields() {
        let update = Message::StreamUpdate(StreamUpdate {
            player: Some(StreamPlayerUpdate {
                codec: DeltaField::Value(Codec::Opus),
                ..Default::default()
            }),
        });
        let text = encode_text(&update);
        assert!(text.contains(r#""codec":"opus""#));
        assert!(!text.contains("sample_rate"));
    }
}
