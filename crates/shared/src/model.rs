use std::{
    collections::BTreeSet,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{ActionId, ChannelMessageId, ChatMessageId, ImageSize, MessageKind, RoomId, UserId},
    protocol::{ChatPayload, SenderFields},
    time::{PlaybackTime, TimeToken},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: UserId,
    pub is_local_user: bool,
    pub nickname: String,
    pub is_active: bool,
}

impl ChatUser {
    pub fn new(id: impl AsRef<str>, nickname: impl Into<String>, is_local_user: bool) -> Self {
        Self {
            id: UserId::new(id),
            is_local_user,
            nickname: nickname.into(),
            is_active: true,
        }
    }
}

impl PartialEq for ChatUser {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChatUser {}

impl Hash for ChatUser {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Identity of a message across its lifetime.
///
/// Locally fabricated messages start `Pending` and move to `Confirmed` once,
/// when the transport acknowledges them. Messages received from the channel
/// are `Confirmed` from the start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageIdentity {
    Pending {
        local: ChatMessageId,
    },
    Confirmed {
        id: ChatMessageId,
        channel_id: ChannelMessageId,
    },
}

impl MessageIdentity {
    pub fn id(&self) -> &ChatMessageId {
        match self {
            Self::Pending { local } => local,
            Self::Confirmed { id, .. } => id,
        }
    }

    pub fn channel_id(&self) -> Option<&ChannelMessageId> {
        match self {
            Self::Pending { .. } => None,
            Self::Confirmed { channel_id, .. } => Some(channel_id),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Moves a pending identity to confirmed. Returns false without changing
    /// anything when the identity is already confirmed; a second confirmation
    /// never rebinds the transport id.
    pub fn confirm(&mut self, channel_id: ChannelMessageId) -> bool {
        match self {
            Self::Pending { local } => {
                *self = Self::Confirmed {
                    id: local.clone(),
                    channel_id,
                };
                true
            }
            Self::Confirmed { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionVote {
    pub vote_id: ActionId,
    pub reaction_kind: String,
    pub is_mine: bool,
}

/// Votes on one message, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionVotes {
    votes: Vec<ReactionVote>,
}

impl ReactionVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a vote unless one with the same id is already present.
    pub fn push(&mut self, vote: ReactionVote) -> bool {
        if self.votes.iter().any(|v| v.vote_id == vote.vote_id) {
            return false;
        }
        self.votes.push(vote);
        true
    }

    pub fn remove(&mut self, vote_id: &ActionId) -> Option<ReactionVote> {
        let index = self.votes.iter().position(|v| &v.vote_id == vote_id)?;
        Some(self.votes.remove(index))
    }

    pub fn my_vote(&self) -> Option<&ReactionVote> {
        self.votes.iter().find(|v| v.is_mine)
    }

    pub fn count_for(&self, reaction_kind: &str) -> usize {
        self.votes
            .iter()
            .filter(|v| v.reaction_kind == reaction_kind)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReactionVote> {
        self.votes.iter()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// One chat message as shown to observers. Equality and hashing use the
/// message id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub identity: MessageIdentity,
    pub kind: MessageKind,
    pub room_id: RoomId,
    pub channel_name: String,
    pub text: String,
    pub sender: ChatUser,
    pub video_timestamp: Option<PlaybackTime>,
    pub reactions: ReactionVotes,
    pub created_at: TimeToken,
    pub sender_image_url: Option<String>,
    pub attachment_image_url: Option<String>,
    pub attachment_size: Option<ImageSize>,
    pub filtered_text: Option<String>,
    pub filter_reasons: BTreeSet<String>,
}

/// Where a message lives; shared by every message of one room session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomScope<'a> {
    pub room_id: &'a RoomId,
    pub channel_name: &'a str,
    pub local_user_id: &'a UserId,
}

impl ChatMessage {
    /// Builds a message from a decoded creation payload. Returns `None` for
    /// deletion payloads.
    pub fn from_created_payload(
        payload: &ChatPayload,
        channel_id: ChannelMessageId,
        created_at: TimeToken,
        scope: &RoomScope<'_>,
    ) -> Option<Self> {
        let (id, kind, text, sender, filtered_text, reasons, image) = match payload {
            ChatPayload::MessageCreated(p) => (
                &p.id,
                MessageKind::Text,
                p.message.clone(),
                &p.sender,
                p.filtered_message.clone(),
                &p.content_filter,
                None,
            ),
            ChatPayload::ImageCreated(p) => (
                &p.id,
                MessageKind::Image,
                String::new(),
                &p.sender,
                None,
                &p.content_filter,
                Some((
                    p.image_url.clone(),
                    ImageSize {
                        width: p.image_width,
                        height: p.image_height,
                    },
                )),
            ),
            ChatPayload::MessageDeleted(_) | ChatPayload::ImageDeleted(_) => return None,
        };

        let (attachment_image_url, attachment_size) = match image {
            Some((url, size)) => (Some(url), Some(size)),
            None => (None, None),
        };

        Some(Self {
            identity: MessageIdentity::Confirmed {
                id: id.clone(),
                channel_id,
            },
            kind,
            room_id: scope.room_id.clone(),
            channel_name: scope.channel_name.to_string(),
            text,
            sender: sender_user(sender, scope.local_user_id),
            video_timestamp: sender.program_date_time,
            reactions: ReactionVotes::new(),
            created_at,
            sender_image_url: sender.sender_image_url.clone(),
            attachment_image_url,
            attachment_size,
            filtered_text,
            filter_reasons: reasons.clone(),
        })
    }

    pub fn id(&self) -> &ChatMessageId {
        self.identity.id()
    }

    pub fn channel_message_id(&self) -> Option<&ChannelMessageId> {
        self.identity.channel_id()
    }

    pub fn is_pending(&self) -> bool {
        self.identity.is_pending()
    }

    pub fn display_text(&self) -> &str {
        self.filtered_text.as_deref().unwrap_or(&self.text)
    }
}

fn sender_user(fields: &SenderFields, local_user_id: &UserId) -> ChatUser {
    ChatUser {
        is_local_user: &fields.sender_id == local_user_id,
        id: fields.sender_id.clone(),
        nickname: fields.sender_nickname.clone(),
        is_active: true,
    }
}

impl PartialEq for ChatMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ChatMessage {}

impl Hash for ChatMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}
