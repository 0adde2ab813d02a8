use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{MessageRecord, Submission};

/// Generic notice sent back when a submission cannot be accepted.
pub const SUBMISSION_FAILED: &str = "Failed to send message";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingNotice {
    #[serde(default)]
    pub sender: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorNotice {
    pub message: String,
}

impl ErrorNotice {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Events a client may send. Every frame is `{"event": .., "data": ..}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Message(Submission),
    Typing(TypingNotice),
    StopTyping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Full relay contents, sent once to each new connection.
    Messages(Vec<MessageRecord>),
    Message(MessageRecord),
    Typing(TypingNotice),
    StopTyping,
    Error(ErrorNotice),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a valid event envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed message submission: {0}")]
    Submission(#[source] serde_json::Error),
    #[error("malformed typing notice: {0}")]
    Typing(#[source] serde_json::Error),
    #[error("unsupported event '{0}'")]
    UnknownEvent(String),
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// The notice reported to the connection that sent the bad frame.
    pub fn notice(&self) -> ErrorNotice {
        match self {
            ProtocolError::UnknownEvent(name) => {
                ErrorNotice::new(format!("Unsupported event '{name}'"))
            }
            _ => ErrorNotice::new(SUBMISSION_FAILED),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

pub fn decode_client_event(frame: &str) -> Result<ClientEvent, ProtocolError> {
    let Envelope { event, data } = serde_json::from_str(frame).map_err(ProtocolError::Envelope)?;

    match event.as_str() {
        "message" => serde_json::from_value(data)
            .map(ClientEvent::Message)
            .map_err(ProtocolError::Submission),
        // Typing notices are relayed as-is; an absent payload is tolerated.
        "typing" if data.is_null() => Ok(ClientEvent::Typing(TypingNotice::default())),
        "typing" => serde_json::from_value(data)
            .map(ClientEvent::Typing)
            .map_err(ProtocolError::Typing),
        "stop-typing" => Ok(ClientEvent::StopTyping),
        _ => Err(ProtocolError::UnknownEvent(event)),
    }
}

pub fn decode_server_event(frame: &str) -> Result<ServerEvent, ProtocolError> {
    serde_json::from_str(frame).map_err(ProtocolError::Envelope)
}

pub fn encode<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(ProtocolError::Encode)
}

/// A server event encoded once and shared by every connection it is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    pub fn encode(event: &ServerEvent) -> Result<Self, ProtocolError> {
        encode(event).map(|text| Self(text.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn decode(&self) -> Result<ServerEvent, ProtocolError> {
        decode_server_event(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::record::{MessageId, Payload};

    #[test]
    fn decodes_browser_message_frame() {
        let frame = json!({
            "event": "message",
            "data": { "text": "hello", "sender": "alice", "type": "text" }
        })
        .to_string();

        let event = decode_client_event(&frame).expect("decode message");
        assert_eq!(event, ClientEvent::Message(Submission::text("alice", "hello")));
    }

    #[test]
    fn decodes_typing_with_and_without_payload() {
        let with_sender = r#"{"event":"typing","data":{"sender":"bob"}}"#;
        assert_eq!(
            decode_client_event(with_sender).expect("typing"),
            ClientEvent::Typing(TypingNotice {
                sender: "bob".into()
            })
        );

        let bare = r#"{"event":"typing"}"#;
        assert_eq!(
            decode_client_event(bare).expect("bare typing"),
            ClientEvent::Typing(TypingNotice::default())
        );

        let stop = r#"{"event":"stop-typing"}"#;
        assert_eq!(
            decode_client_event(stop).expect("stop typing"),
            ClientEvent::StopTyping
        );
    }

    #[test]
    fn malformed_submission_maps_to_generic_notice() {
        let frame = r#"{"event":"message","data":{"sender":"eve","type":"audio"}}"#;
        let err = decode_client_event(frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Submission(_)));
        assert_eq!(err.notice(), ErrorNotice::new(SUBMISSION_FAILED));

        let err = decode_client_event("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Envelope(_)));
        assert_eq!(err.notice().message, SUBMISSION_FAILED);
    }

    #[test]
    fn unknown_event_is_named_in_notice() {
        let err = decode_client_event(r#"{"event":"join-room","data":"lobby"}"#).unwrap_err();
        assert_eq!(err.notice().message, "Unsupported event 'join-room'");
    }

    #[test]
    fn client_events_encode_as_envelopes() {
        let encoded = encode(&ClientEvent::StopTyping).expect("encode");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&encoded).unwrap(),
            json!({ "event": "stop-typing" })
        );

        let encoded = encode(&ClientEvent::Message(Submission::text("a", "b"))).expect("encode");
        assert_eq!(decode_client_event(&encoded).expect("decode"), ClientEvent::Message(Submission::text("a", "b")));
    }

    #[test]
    fn frame_carries_server_event() {
        let record = MessageRecord::new(
            MessageId::from("id-1".to_string()),
            Submission::text("alice", "hi"),
            chrono::Utc::now(),
        );
        let frame = Frame::encode(&ServerEvent::Messages(vec![record])).expect("frame");

        let value: serde_json::Value = serde_json::from_str(frame.as_str()).expect("json");
        assert_eq!(value["event"], "messages");
        assert_eq!(value["data"][0]["id"], "id-1");
        assert_eq!(value["data"][0]["type"], "text");

        match frame.decode().expect("decode frame") {
            ServerEvent::Messages(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(
                    records[0].payload,
                    Payload::Text {
                        text: "hi".into()
                    }
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
