use std::collections::VecDeque;

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{ActionId, ChannelMessageId, ChatMessageId, UserId},
    error::{ChannelError, ChannelErrorCode},
    protocol::{ChatPayload, MessageCreatedPayload, PayloadError, SenderFields},
    time::{PlaybackTime, TimeToken},
};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::channel::{Channel, ChannelEvent, MessageAction, Page, PageEntry};

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct LoopbackState {
    entries: Vec<PageEntry>,
    last_token: Option<TimeToken>,
    next_id: u64,
    failures: VecDeque<ChannelErrorCode>,
}

impl LoopbackState {
    fn next_token(&mut self) -> TimeToken {
        let now = TimeToken::now();
        let token = match self.last_token {
            Some(last) if now <= last => TimeToken::new(last.ticks() + 1),
            _ => now,
        };
        self.last_token = Some(token);
        token
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn take_failure(&mut self, operation: &str) -> Result<(), ChannelError> {
        match self.failures.pop_front() {
            Some(code) => Err(ChannelError::new(
                code,
                format!("injected {operation} failure"),
            )),
            None => Ok(()),
        }
    }

    fn entry_mut(&mut self, target: &ChannelMessageId) -> Option<&mut PageEntry> {
        self.entries
            .iter_mut()
            .find(|entry| &entry.channel_message_id == target)
    }
}

/// In-process channel that stores every published payload and echoes it to
/// subscribers, in the same shape a hosted pub/sub transport would.
///
/// Tokens are strictly increasing, so history pagination behaves like the
/// real thing. Used by the tools binary and by integration tests.
pub struct LoopbackChannel {
    name: String,
    user_id: UserId,
    state: Mutex<LoopbackState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl LoopbackChannel {
    /// A channel whose actions are attributed to `user_id`.
    pub fn new(name: impl Into<String>, user_id: UserId) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            name: name.into(),
            user_id,
            state: Mutex::new(LoopbackState::default()),
            events,
        }
    }

    /// Makes the next request of any kind fail with `code`.
    pub async fn fail_next(&self, code: ChannelErrorCode) {
        self.state.lock().await.failures.push_back(code);
    }

    /// Stores and broadcasts a payload as if another client had published it.
    pub async fn inject(&self, payload: Value) -> PageEntry {
        let entry = {
            let mut state = self.state.lock().await;
            let entry = PageEntry {
                channel_message_id: ChannelMessageId::new(state.next_id("msg")),
                created_at: state.next_token(),
                payload,
                actions: Vec::new(),
            };
            state.entries.push(entry.clone());
            entry
        };
        debug!(
            channel = %self.name,
            channel_message_id = %entry.channel_message_id,
            created_at = %entry.created_at,
            "loopback: stored message"
        );
        self.broadcast(ChannelEvent::MessageCreated(entry.clone()));
        entry
    }

    /// Publishes a text message authored by another user.
    pub async fn publish_as(
        &self,
        sender_id: UserId,
        nickname: &str,
        text: &str,
        program_date_time: Option<PlaybackTime>,
    ) -> Result<PageEntry, PayloadError> {
        let payload = ChatPayload::MessageCreated(MessageCreatedPayload {
            id: ChatMessageId::generate(),
            message: text.to_string(),
            sender: SenderFields {
                sender_id,
                sender_nickname: nickname.to_string(),
                sender_image_url: None,
                program_date_time,
            },
            filtered_message: None,
            content_filter: Default::default(),
        });
        Ok(self.inject(payload.encode()?).await)
    }

    /// Adds an action on behalf of `sender_id`.
    pub async fn inject_action(
        &self,
        sender_id: UserId,
        action_type: &str,
        value: &str,
        target: &ChannelMessageId,
    ) -> Result<MessageAction, ChannelError> {
        let action = {
            let mut state = self.state.lock().await;
            let action = MessageAction {
                action_id: ActionId::new(state.next_id("act")),
                target: target.clone(),
                action_type: action_type.to_string(),
                value: value.to_string(),
                sender_id,
            };
            let entry = state
                .entry_mut(target)
                .ok_or_else(|| ChannelError::not_found(format!("no message {target}")))?;
            entry.actions.push(action.clone());
            action
        };
        self.broadcast(ChannelEvent::ActionCreated(action.clone()));
        Ok(action)
    }

    pub async fn entries(&self) -> Vec<PageEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    fn broadcast(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            debug!(channel = %self.name, "loopback: no subscribers for event");
        }
    }

    fn page_of(entries: Vec<PageEntry>) -> Result<Page, ChannelError> {
        if entries.is_empty() {
            return Err(ChannelError::not_found("no stored messages in range"));
        }
        Ok(Page {
            oldest_token: entries.first().map(|entry| entry.created_at),
            newest_token: entries.last().map(|entry| entry.created_at),
            entries,
        })
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: Value) -> Result<ChannelMessageId, ChannelError> {
        self.state.lock().await.take_failure("publish")?;
        Ok(self.inject(payload).await.channel_message_id)
    }

    async fn send_action(
        &self,
        action_type: &str,
        value: &str,
        target: &ChannelMessageId,
    ) -> Result<MessageAction, ChannelError> {
        self.state.lock().await.take_failure("send_action")?;
        self.inject_action(self.user_id.clone(), action_type, value, target)
            .await
    }

    async fn remove_action(
        &self,
        target: &ChannelMessageId,
        action_id: &ActionId,
    ) -> Result<(), ChannelError> {
        let removed = {
            let mut state = self.state.lock().await;
            state.take_failure("remove_action")?;
            let entry = state
                .entry_mut(target)
                .ok_or_else(|| ChannelError::not_found(format!("no message {target}")))?;
            let index = entry
                .actions
                .iter()
                .position(|action| &action.action_id == action_id)
                .ok_or_else(|| ChannelError::not_found(format!("no action {action_id}")))?;
            entry.actions.remove(index)
        };
        self.broadcast(ChannelEvent::ActionDeleted(removed));
        Ok(())
    }

    async fn fetch_history(
        &self,
        older_than: Option<TimeToken>,
        limit: u32,
    ) -> Result<Page, ChannelError> {
        let mut state = self.state.lock().await;
        state.take_failure("fetch_history")?;
        let older: Vec<&PageEntry> = state
            .entries
            .iter()
            .filter(|entry| older_than.map_or(true, |cursor| entry.created_at < cursor))
            .collect();
        let skip = older.len().saturating_sub(limit as usize);
        Self::page_of(older.into_iter().skip(skip).cloned().collect())
    }

    async fn fetch_since(&self, since: TimeToken, limit: u32) -> Result<Page, ChannelError> {
        let mut state = self.state.lock().await;
        state.take_failure("fetch_since")?;
        let newer = state
            .entries
            .iter()
            .filter(|entry| entry.created_at >= since)
            .take(limit as usize)
            .cloned()
            .collect();
        Self::page_of(newer)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
