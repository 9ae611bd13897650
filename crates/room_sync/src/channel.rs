use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{ActionId, ChannelMessageId, UserId},
    error::ChannelError,
    time::TimeToken,
};
use tokio::sync::broadcast;

/// Action type used for reaction votes on the transport.
pub const REACTION_ACTION_TYPE: &str = "reaction";

/// A message action (reaction vote) attached to a channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAction {
    pub action_id: ActionId,
    pub target: ChannelMessageId,
    pub action_type: String,
    pub value: String,
    pub sender_id: UserId,
}

/// One raw message as stored or delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PageEntry {
    pub channel_message_id: ChannelMessageId,
    pub created_at: TimeToken,
    pub payload: Value,
    pub actions: Vec<MessageAction>,
}

/// Bounded batch of history entries, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub oldest_token: Option<TimeToken>,
    pub newest_token: Option<TimeToken>,
    pub entries: Vec<PageEntry>,
}

impl Page {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Oldest token among the raw entries, falling back to the page bound the
    /// transport reported.
    pub fn oldest_entry_token(&self) -> Option<TimeToken> {
        self.entries
            .iter()
            .map(|entry| entry.created_at)
            .min()
            .or(self.oldest_token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    MessageCreated(PageEntry),
    ActionCreated(MessageAction),
    ActionDeleted(MessageAction),
}

/// Pub/sub channel backing one chat room.
///
/// Connection management, retries and timeouts belong to the implementation.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    async fn publish(&self, payload: Value) -> Result<ChannelMessageId, ChannelError>;
    async fn send_action(
        &self,
        action_type: &str,
        value: &str,
        target: &ChannelMessageId,
    ) -> Result<MessageAction, ChannelError>;
    async fn remove_action(
        &self,
        target: &ChannelMessageId,
        action_id: &ActionId,
    ) -> Result<(), ChannelError>;
    /// Fetches up to `limit` entries strictly older than `older_than`, or the
    /// newest entries when no cursor is given.
    async fn fetch_history(
        &self,
        older_than: Option<TimeToken>,
        limit: u32,
    ) -> Result<Page, ChannelError>;
    /// Fetches up to `limit` entries created at or after `since`.
    async fn fetch_since(&self, since: TimeToken, limit: u32) -> Result<Page, ChannelError>;
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;
}
