use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    domain::{ChatMessageId, MessageKind, UserId},
    time::PlaybackTime,
};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("unknown payload event {0:?}")]
    UnknownEvent(String),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

const KNOWN_EVENTS: [&str; 4] = [
    "message-created",
    "message-deleted",
    "image-created",
    "image-deleted",
];

/// Event payloads exchanged over a room's pub/sub channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ChatPayload {
    MessageCreated(MessageCreatedPayload),
    MessageDeleted(DeletedPayload),
    ImageCreated(ImageCreatedPayload),
    ImageDeleted(DeletedPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderFields {
    pub sender_id: UserId,
    pub sender_nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_date_time: Option<PlaybackTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCreatedPayload {
    pub id: ChatMessageId,
    pub message: String,
    #[serde(flatten)]
    pub sender: SenderFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub content_filter: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCreatedPayload {
    pub id: ChatMessageId,
    pub image_url: String,
    pub image_width: u32,
    pub image_height: u32,
    #[serde(flatten)]
    pub sender: SenderFields,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub content_filter: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedPayload {
    pub id: ChatMessageId,
}

impl ChatPayload {
    pub fn decode(raw: &Value) -> Result<Self, PayloadError> {
        let object = raw.as_object().ok_or(PayloadError::NotAnObject)?;
        if let Some(event) = object.get("event").and_then(Value::as_str) {
            if !KNOWN_EVENTS.contains(&event) {
                return Err(PayloadError::UnknownEvent(event.to_string()));
            }
        }
        Ok(Self::deserialize(raw)?)
    }

    pub fn encode(&self) -> Result<Value, PayloadError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn deleted(kind: MessageKind, id: ChatMessageId) -> Self {
        match kind {
            MessageKind::Text => Self::MessageDeleted(DeletedPayload { id }),
            MessageKind::Image => Self::ImageDeleted(DeletedPayload { id }),
        }
    }

    pub fn created_id(&self) -> Option<&ChatMessageId> {
        match self {
            Self::MessageCreated(payload) => Some(&payload.id),
            Self::ImageCreated(payload) => Some(&payload.id),
            Self::MessageDeleted(_) | Self::ImageDeleted(_) => None,
        }
    }

    pub fn deleted_id(&self) -> Option<&ChatMessageId> {
        match self {
            Self::MessageDeleted(payload) | Self::ImageDeleted(payload) => Some(&payload.id),
            Self::MessageCreated(_) | Self::ImageCreated(_) => None,
        }
    }

    pub fn filter_reasons(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::MessageCreated(payload) => Some(&payload.content_filter),
            Self::ImageCreated(payload) => Some(&payload.content_filter),
            Self::MessageDeleted(_) | Self::ImageDeleted(_) => None,
        }
    }

    /// True when the payload carries a server-side filter reason the room
    /// has chosen to hide.
    pub fn is_filtered_by(&self, active_filters: &BTreeSet<String>) -> bool {
        self.filter_reasons()
            .is_some_and(|reasons| !reasons.is_disjoint(active_filters))
    }
}
