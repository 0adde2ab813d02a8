//! Message records exchanged between peers.
//!
//! A [`Submission`] is what a client sends; the relay turns it into an
//! immutable [`MessageRecord`] by stamping an id and a creation time. Both
//! serialize to the flat JSON shape browsers already speak:
//!
//! ```json
//! {"id":"V1StGXR8_Z5jdHi6","sender":"alice","timestamp":"2024-05-01T12:00:00.000Z","type":"text","text":"hi"}
//! ```

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

const ID_LENGTH: usize = 16;

/// Opaque record identifier, unique per record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(ID_LENGTH))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Audio => "audio",
        };
        f.write_str(name)
    }
}

/// Exactly one payload per record. The `type` tag names the field that
/// carries the content, so a submission tagged `image` must carry `image`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Text { text: String },
    /// Image encoded as a data URI.
    Image { image: String },
    /// Audio clip encoded as a data URI.
    Audio { audio: String },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Text { .. } => MessageKind::Text,
            Payload::Image { .. } => MessageKind::Image,
            Payload::Audio { .. } => MessageKind::Audio,
        }
    }

    /// Size of the carried content in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text { text } => text.len(),
            Payload::Image { image } => image.len(),
            Payload::Audio { audio } => audio.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message as submitted by a client, before the relay stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub sender: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Submission {
    pub fn text(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            payload: Payload::Text { text: text.into() },
        }
    }

    pub fn image(sender: impl Into<String>, data_uri: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            payload: Payload::Image {
                image: data_uri.into(),
            },
        }
    }

    pub fn audio(sender: impl Into<String>, data_uri: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            payload: Payload::Audio {
                audio: data_uri.into(),
            },
        }
    }
}

/// An immutable message held by the relay and broadcast to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl MessageRecord {
    pub fn new(id: MessageId, submission: Submission, timestamp: DateTime<Utc>) -> Self {
        let Submission { sender, payload } = submission;
        Self {
            id,
            sender,
            timestamp,
            payload,
        }
    }

    /// Stamps a submission with a fresh id and the current time, truncated
    /// to the millisecond precision the wire format carries.
    pub fn stamp(submission: Submission) -> Self {
        Self::new(MessageId::generate(), submission, Utc::now().trunc_subsecs(3))
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix, the format
/// browsers produce with `Date.prototype.toISOString`.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}
