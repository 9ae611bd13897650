use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use shared::{
    domain::{ActionId, ChannelMessageId, ChatMessageId, ImageSize, MessageKind},
    model::{ChatMessage, MessageIdentity, ReactionVotes, RoomScope},
    protocol::{ChatPayload, ImageCreatedPayload, MessageCreatedPayload, SenderFields},
    time::{PlaybackTime, TimeToken},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::{Channel, ChannelEvent, MessageAction, Page, PageEntry, REACTION_ACTION_TYPE},
    config::RoomConfig,
    error::{RoomError, RoomResult},
    history::{process_page, vote_from_action, ProcessedPage},
    observer::{ObserverHandle, ObserverRegistry, RoomObserver},
    services::{ImageUploader, MessageReport, MissingImageUploader, Reporter},
};

#[derive(Default)]
struct RoomState {
    /// Visible messages. History merges keep ascending `created_at`; live
    /// messages are appended in arrival order.
    messages: Vec<ChatMessage>,
    deleted: HashSet<ChatMessageId>,
    mocked: HashSet<ChatMessageId>,
    channel_ids: HashMap<ChatMessageId, ChannelMessageId>,
    chat_ids: HashMap<ChannelMessageId, ChatMessageId>,
    oldest_loaded: Option<TimeToken>,
}

impl RoomState {
    fn position(&self, id: &ChatMessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == id)
    }

    fn message(&self, id: &ChatMessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id() == id)
    }

    fn message_mut(&mut self, id: &ChatMessageId) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id() == id)
    }

    fn message_for_channel_id_mut(
        &mut self,
        channel_id: &ChannelMessageId,
    ) -> Option<&mut ChatMessage> {
        let id = self.chat_ids.get(channel_id)?.clone();
        self.message_mut(&id)
    }

    fn record_mapping(&mut self, id: ChatMessageId, channel_id: ChannelMessageId) {
        self.chat_ids.insert(channel_id.clone(), id.clone());
        self.channel_ids.insert(id, channel_id);
    }

    fn forget(&mut self, id: &ChatMessageId) {
        if let Some(channel_id) = self.channel_ids.remove(id) {
            self.chat_ids.remove(&channel_id);
        }
    }

    fn remove_rows(&mut self, id: &ChatMessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id() != id);
        self.messages.len() != before
    }

    /// Drops id mappings for rows that are no longer visible.
    fn retain_visible_mappings(&mut self) {
        let visible: HashSet<ChatMessageId> =
            self.messages.iter().map(|m| m.id().clone()).collect();
        self.channel_ids.retain(|id, _| visible.contains(id));
        self.chat_ids.retain(|_, id| visible.contains(id));
    }

    fn record_page_mappings(&mut self, messages: &[ChatMessage]) {
        for message in messages {
            if let Some(channel_id) = message.channel_message_id() {
                self.record_mapping(message.id().clone(), channel_id.clone());
            }
        }
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.deleted.clear();
        self.mocked.clear();
        self.channel_ids.clear();
        self.chat_ids.clear();
        self.oldest_loaded = None;
    }
}

/// Local view of one chat room kept consistent with its pub/sub channel.
///
/// Channel events are applied one at a time in delivery order by a listener
/// task started on connect. State changes made by commands become visible
/// through that same event path, except the optimistic row of an image send.
pub struct ChatRoom {
    config: RoomConfig,
    channel: Arc<dyn Channel>,
    uploader: Arc<dyn ImageUploader>,
    reporter: Option<Arc<dyn Reporter>>,
    inner: Mutex<RoomState>,
    observers: ObserverRegistry,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl ChatRoom {
    /// Connects to `channel` and starts listening. Must be called from within
    /// a tokio runtime.
    pub fn connect(config: RoomConfig, channel: Arc<dyn Channel>) -> Arc<Self> {
        Self::connect_with_services(config, channel, Arc::new(MissingImageUploader), None)
    }

    pub fn connect_with_services(
        config: RoomConfig,
        channel: Arc<dyn Channel>,
        uploader: Arc<dyn ImageUploader>,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> Arc<Self> {
        let events = channel.subscribe_events();
        let room = Arc::new(Self {
            config,
            channel,
            uploader,
            reporter,
            inner: Mutex::new(RoomState::default()),
            observers: ObserverRegistry::new(),
            listener: std::sync::Mutex::new(None),
            connected: AtomicBool::new(true),
        });

        let task = Self::spawn_event_listener(Arc::downgrade(&room), events);
        *room.listener_slot() = Some(task);

        info!(
            room_id = %room.config.room_id,
            channel = %room.config.channel_name,
            "room: connected"
        );
        room
    }

    fn spawn_event_listener(
        weak: Weak<Self>,
        mut events: broadcast::Receiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let received = events.recv().await;
                let Some(room) = weak.upgrade() else {
                    break;
                };
                match received {
                    Ok(event) => room.handle_channel_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            room_id = %room.config.room_id,
                            skipped,
                            "room: channel event stream lagged"
                        );
                        room.observers
                            .notify(|o| o.on_error(&RoomError::EventStreamLagged(skipped)));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if room.is_connected() {
                            warn!(
                                room_id = %room.config.room_id,
                                "room: channel event stream closed"
                            );
                            room.observers
                                .notify(|o| o.on_error(&RoomError::EventStreamClosed));
                        }
                        break;
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn add_observer(&self, observer: Arc<dyn RoomObserver>) -> ObserverHandle {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.observers.remove(handle)
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn message(&self, id: &ChatMessageId) -> Option<ChatMessage> {
        self.inner.lock().await.message(id).cloned()
    }

    pub async fn oldest_loaded_token(&self) -> Option<TimeToken> {
        self.inner.lock().await.oldest_loaded
    }

    pub async fn channel_message_id(&self, id: &ChatMessageId) -> Option<ChannelMessageId> {
        self.inner.lock().await.channel_ids.get(id).cloned()
    }

    pub async fn chat_message_id(&self, channel_id: &ChannelMessageId) -> Option<ChatMessageId> {
        self.inner.lock().await.chat_ids.get(channel_id).cloned()
    }

    /// Publishes a text message. The row appears once the channel delivers
    /// the matching `message-created` event.
    pub async fn send_message(
        &self,
        text: &str,
        video_timestamp: Option<PlaybackTime>,
    ) -> RoomResult<ChatMessageId> {
        self.ensure_connected()?;
        let id = ChatMessageId::generate();
        let payload = ChatPayload::MessageCreated(MessageCreatedPayload {
            id: id.clone(),
            message: text.to_string(),
            sender: self.sender_fields(video_timestamp),
            filtered_message: None,
            content_filter: Default::default(),
        });

        let channel_id = self.channel.publish(payload.encode()?).await?;
        debug!(
            room_id = %self.config.room_id,
            message_id = %id,
            channel_message_id = %channel_id,
            "room: text message published"
        );
        self.inner.lock().await.record_mapping(id.clone(), channel_id);
        Ok(id)
    }

    /// Sends an image. A pending row is shown immediately and confirmed in
    /// place once upload and publish succeed; on failure the row is retracted.
    pub async fn send_image(
        &self,
        image: Vec<u8>,
        size: ImageSize,
        video_timestamp: Option<PlaybackTime>,
    ) -> RoomResult<ChatMessageId> {
        self.ensure_connected()?;
        let id = ChatMessageId::generate();
        let mock = ChatMessage {
            identity: MessageIdentity::Pending { local: id.clone() },
            kind: MessageKind::Image,
            room_id: self.config.room_id.clone(),
            channel_name: self.config.channel_name.clone(),
            text: String::new(),
            sender: self.config.local_user.clone(),
            video_timestamp,
            reactions: ReactionVotes::new(),
            created_at: TimeToken::now(),
            sender_image_url: self.config.sender_image_url.clone(),
            attachment_image_url: None,
            attachment_size: Some(size),
            filtered_text: None,
            filter_reasons: Default::default(),
        };

        {
            let mut guard = self.inner.lock().await;
            guard.mocked.insert(id.clone());
            guard.messages.push(mock.clone());
        }
        self.observers.notify(|o| o.on_new_message(&mock));

        match self.confirm_image(&id, image, size, video_timestamp).await {
            Ok(()) => Ok(id),
            Err(err) => {
                error!(
                    room_id = %self.config.room_id,
                    message_id = %id,
                    "room: image send failed; retracting pending row: {err}"
                );
                self.retract_mock(&id).await;
                Err(err)
            }
        }
    }

    async fn confirm_image(
        &self,
        id: &ChatMessageId,
        image: Vec<u8>,
        size: ImageSize,
        video_timestamp: Option<PlaybackTime>,
    ) -> RoomResult<()> {
        let uploaded = self
            .uploader
            .upload(image)
            .await
            .map_err(|err| RoomError::Upload(err.to_string()))?;

        let payload = ChatPayload::ImageCreated(ImageCreatedPayload {
            id: id.clone(),
            image_url: uploaded.url.clone(),
            image_width: size.width,
            image_height: size.height,
            sender: self.sender_fields(video_timestamp),
            content_filter: Default::default(),
        });
        let channel_id = self.channel.publish(payload.encode()?).await?;

        let mut guard = self.inner.lock().await;
        guard.record_mapping(id.clone(), channel_id.clone());
        if let Some(row) = guard.message_mut(id) {
            row.identity.confirm(channel_id);
            row.attachment_image_url = Some(uploaded.url);
        }
        Ok(())
    }

    async fn retract_mock(&self, id: &ChatMessageId) {
        let removed = {
            let mut guard = self.inner.lock().await;
            guard.mocked.remove(id);
            guard.forget(id);
            guard.remove_rows(id)
        };
        if removed {
            self.observers.notify(|o| o.on_message_deleted(id));
        }
    }

    /// Publishes a deletion event. The row disappears when the event is
    /// observed on the channel.
    pub async fn delete_message(&self, id: &ChatMessageId) -> RoomResult<()> {
        self.ensure_connected()?;
        let kind = {
            let guard = self.inner.lock().await;
            guard
                .message(id)
                .map(|m| m.kind)
                .ok_or_else(|| RoomError::MessageNotFound(id.clone()))?
        };
        let payload = ChatPayload::deleted(kind, id.clone());
        self.channel.publish(payload.encode()?).await?;
        Ok(())
    }

    /// Adds a reaction vote, first removing `previous` on the channel when
    /// given so the two votes are never counted together.
    pub async fn send_reaction(
        &self,
        message_id: &ChatMessageId,
        reaction_kind: &str,
        previous: Option<&ActionId>,
    ) -> RoomResult<ActionId> {
        self.ensure_connected()?;
        let target = self.require_channel_id(message_id).await?;
        if let Some(previous) = previous {
            self.channel.remove_action(&target, previous).await?;
        }
        let action = self
            .channel
            .send_action(REACTION_ACTION_TYPE, reaction_kind, &target)
            .await?;
        Ok(action.action_id)
    }

    pub async fn remove_reaction(
        &self,
        message_id: &ChatMessageId,
        vote_id: &ActionId,
    ) -> RoomResult<()> {
        self.ensure_connected()?;
        let target = self.require_channel_id(message_id).await?;
        self.channel.remove_action(&target, vote_id).await?;
        Ok(())
    }

    async fn require_channel_id(&self, id: &ChatMessageId) -> RoomResult<ChannelMessageId> {
        let guard = self.inner.lock().await;
        if let Some(channel_id) = guard.channel_ids.get(id) {
            return Ok(channel_id.clone());
        }
        match guard.message(id) {
            Some(message) => match message.channel_message_id() {
                Some(channel_id) => Ok(channel_id.clone()),
                None => Err(RoomError::UnconfirmedMessage(id.clone())),
            },
            None => Err(RoomError::MessageNotFound(id.clone())),
        }
    }

    /// Replaces the visible list with the newest page of history.
    pub async fn load_initial_history(&self) -> RoomResult<Vec<ChatMessage>> {
        self.ensure_connected()?;
        let page = self.fetch_history_page(None).await?;
        let processed = self.process(&page);

        let loaded = {
            let mut guard = self.inner.lock().await;
            let page_messages = Self::absorb_page(&mut guard, processed);
            let mut pending: Vec<ChatMessage> = std::mem::take(&mut guard.messages)
                .into_iter()
                .filter(|m| guard.mocked.contains(m.id()))
                .collect();

            // A pending row whose echo is already in the page is confirmed in
            // place and not announced again.
            let mut visible = Vec::with_capacity(page_messages.len() + pending.len());
            let mut loaded = Vec::with_capacity(page_messages.len());
            for message in page_messages {
                match pending.iter().position(|row| row.id() == message.id()) {
                    Some(index) => {
                        guard.mocked.remove(message.id());
                        let mut row = pending.remove(index);
                        adopt_echo(&mut row, message);
                        debug!(
                            room_id = %self.config.room_id,
                            message_id = %row.id(),
                            "room: reconciled pending message from history"
                        );
                        visible.push(row);
                    }
                    None => {
                        visible.push(message.clone());
                        loaded.push(message);
                    }
                }
            }
            visible.extend(pending);

            guard.messages = visible;
            guard.retain_visible_mappings();
            let rows = guard.messages.clone();
            guard.record_page_mappings(&rows);
            guard.oldest_loaded = page.oldest_entry_token();
            loaded
        };

        info!(
            room_id = %self.config.room_id,
            loaded = loaded.len(),
            "room: initial history loaded"
        );
        self.observers.notify(|o| o.on_message_history(&loaded));
        Ok(loaded)
    }

    /// Loads messages strictly older than the current cursor and prepends
    /// them. Returns an empty batch when nothing has been loaded yet.
    pub async fn load_previous_history(&self) -> RoomResult<Vec<ChatMessage>> {
        self.ensure_connected()?;
        let Some(cursor) = self.inner.lock().await.oldest_loaded else {
            debug!(
                room_id = %self.config.room_id,
                "room: no history cursor yet; nothing older to load"
            );
            return Ok(Vec::new());
        };

        let page = self.fetch_history_page(Some(cursor)).await?;
        let processed = self.process(&page);

        let loaded = {
            let mut guard = self.inner.lock().await;
            let loaded: Vec<ChatMessage> = Self::absorb_page(&mut guard, processed)
                .into_iter()
                .filter(|m| guard.position(m.id()).is_none())
                .collect();
            let mut merged = loaded.clone();
            merged.append(&mut guard.messages);
            guard.messages = merged;
            guard.record_page_mappings(&loaded);
            if let Some(oldest) = page.oldest_entry_token() {
                guard.oldest_loaded = Some(oldest.min(cursor));
            }
            loaded
        };

        info!(
            room_id = %self.config.room_id,
            loaded = loaded.len(),
            "room: previous history loaded"
        );
        self.observers.notify(|o| o.on_message_history(&loaded));
        Ok(loaded)
    }

    /// Counts messages published at or after `since`, excluding deleted and
    /// filtered ones.
    pub async fn message_count_since(&self, since: TimeToken) -> RoomResult<usize> {
        self.ensure_connected()?;
        let page = match self
            .channel
            .fetch_since(since, self.config.settings.since_limit())
            .await
        {
            Ok(page) => page,
            Err(err) if err.is_not_found() => Page::empty(),
            Err(err) => return Err(err.into()),
        };
        let processed = self.process(&page);
        let guard = self.inner.lock().await;
        Ok(processed
            .messages
            .iter()
            .filter(|m| !guard.deleted.contains(m.id()))
            .count())
    }

    pub async fn report_message(&self, id: &ChatMessageId) -> RoomResult<()> {
        self.ensure_connected()?;
        let message = self
            .message(id)
            .await
            .ok_or_else(|| RoomError::MessageNotFound(id.clone()))?;
        let reporter = self.reporter.as_ref().ok_or(RoomError::ReporterUnavailable)?;

        let content = message
            .attachment_image_url
            .clone()
            .unwrap_or_else(|| message.text.clone());
        reporter
            .report(MessageReport {
                room_id: self.config.room_id.clone(),
                reporter_nickname: self.config.local_user.nickname.clone(),
                message_id: id.clone(),
                content,
            })
            .await
            .map_err(|err| RoomError::Report(err.to_string()))?;

        info!(room_id = %self.config.room_id, message_id = %id, "room: message reported");
        Ok(())
    }

    /// Stops listening to the channel, drops all observers and clears state.
    /// Later commands fail with [`RoomError::Disconnected`].
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.listener_slot().take() {
            task.abort();
        }
        self.observers.clear();
        self.inner.lock().await.clear();
        info!(room_id = %self.config.room_id, "room: disconnected");
    }

    pub(crate) async fn handle_channel_event(&self, event: ChannelEvent) {
        if !self.is_connected() {
            return;
        }
        match event {
            ChannelEvent::MessageCreated(entry) => self.apply_message_event(entry).await,
            ChannelEvent::ActionCreated(action) => self.apply_action_created(action).await,
            ChannelEvent::ActionDeleted(action) => self.apply_action_deleted(action).await,
        }
    }

    async fn apply_message_event(&self, entry: PageEntry) {
        let payload = match ChatPayload::decode(&entry.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    room_id = %self.config.room_id,
                    channel_message_id = %entry.channel_message_id,
                    "room: dropping undecodable channel event: {err}"
                );
                return;
            }
        };

        if let Some(id) = payload.deleted_id() {
            self.apply_deletion(id.clone()).await;
            return;
        }

        let scope = self.scope();
        let Some(message) = ChatMessage::from_created_payload(
            &payload,
            entry.channel_message_id.clone(),
            entry.created_at,
            &scope,
        ) else {
            return;
        };
        let id = message.id().clone();

        {
            let mut guard = self.inner.lock().await;
            if guard.mocked.remove(&id) {
                guard.record_mapping(id.clone(), entry.channel_message_id.clone());
                if let Some(row) = guard.message_mut(&id) {
                    adopt_echo(row, message);
                }
                debug!(
                    room_id = %self.config.room_id,
                    message_id = %id,
                    "room: reconciled pending message"
                );
                return;
            }
            if guard.deleted.contains(&id) {
                debug!(
                    room_id = %self.config.room_id,
                    message_id = %id,
                    "room: suppressing deleted message"
                );
                return;
            }
            if payload.is_filtered_by(&self.config.settings.content_filters) {
                debug!(
                    room_id = %self.config.room_id,
                    message_id = %id,
                    "room: suppressing filtered message"
                );
                return;
            }
            if guard.position(&id).is_some() {
                debug!(
                    room_id = %self.config.room_id,
                    message_id = %id,
                    "room: ignoring duplicate message"
                );
                return;
            }
            guard.record_mapping(id.clone(), entry.channel_message_id.clone());
            guard.messages.push(message.clone());
        }

        self.observers.notify(|o| o.on_new_message(&message));
    }

    async fn apply_deletion(&self, id: ChatMessageId) {
        {
            let mut guard = self.inner.lock().await;
            if !guard.deleted.insert(id.clone()) {
                return;
            }
            guard.mocked.remove(&id);
            guard.remove_rows(&id);
            guard.forget(&id);
        }
        debug!(room_id = %self.config.room_id, message_id = %id, "room: message deleted");
        self.observers.notify(|o| o.on_message_deleted(&id));
    }

    async fn apply_action_created(&self, action: MessageAction) {
        let Some(vote) = vote_from_action(&action, &self.config.local_user.id) else {
            debug!(action_type = %action.action_type, "room: ignoring non-reaction action");
            return;
        };
        let updated = {
            let mut guard = self.inner.lock().await;
            let Some(message) = guard.message_for_channel_id_mut(&action.target) else {
                warn!(
                    room_id = %self.config.room_id,
                    action_id = %action.action_id,
                    target = %action.target,
                    "room: reaction target not loaded; dropping"
                );
                return;
            };
            if !message.reactions.push(vote) {
                return;
            }
            message.clone()
        };
        self.observers.notify(|o| o.on_message_updated(&updated));
    }

    async fn apply_action_deleted(&self, action: MessageAction) {
        let updated = {
            let mut guard = self.inner.lock().await;
            let Some(message) = guard.message_for_channel_id_mut(&action.target) else {
                warn!(
                    room_id = %self.config.room_id,
                    action_id = %action.action_id,
                    target = %action.target,
                    "room: reaction removal target not loaded; dropping"
                );
                return;
            };
            if message.reactions.remove(&action.action_id).is_none() {
                return;
            }
            message.clone()
        };
        self.observers.notify(|o| o.on_message_updated(&updated));
    }

    /// Drops page messages the room already knows as deleted and remembers
    /// the page's own deletions.
    fn absorb_page(state: &mut RoomState, processed: ProcessedPage) -> Vec<ChatMessage> {
        let ProcessedPage { messages, deleted } = processed;
        state.deleted.extend(deleted);
        messages
            .into_iter()
            .filter(|m| !state.deleted.contains(m.id()))
            .collect()
    }

    async fn fetch_history_page(&self, older_than: Option<TimeToken>) -> RoomResult<Page> {
        match self
            .channel
            .fetch_history(older_than, self.config.settings.history_limit())
            .await
        {
            Ok(page) => Ok(page),
            Err(err) if err.is_not_found() => {
                debug!(room_id = %self.config.room_id, "room: channel has no history");
                Ok(Page::empty())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn process(&self, page: &Page) -> ProcessedPage {
        process_page(
            &page.entries,
            &self.config.settings.content_filters,
            &self.scope(),
        )
    }

    fn scope(&self) -> RoomScope<'_> {
        RoomScope {
            room_id: &self.config.room_id,
            channel_name: &self.config.channel_name,
            local_user_id: &self.config.local_user.id,
        }
    }

    fn sender_fields(&self, video_timestamp: Option<PlaybackTime>) -> SenderFields {
        SenderFields {
            sender_id: self.config.local_user.id.clone(),
            sender_nickname: self.config.local_user.nickname.clone(),
            sender_image_url: self.config.sender_image_url.clone(),
            program_date_time: video_timestamp,
        }
    }

    fn ensure_connected(&self) -> RoomResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RoomError::Disconnected)
        }
    }

    fn listener_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Confirms a pending row with the data of its channel echo.
fn adopt_echo(row: &mut ChatMessage, echo: ChatMessage) {
    if let Some(channel_id) = echo.channel_message_id() {
        row.identity.confirm(channel_id.clone());
    }
    row.attachment_image_url = echo.attachment_image_url;
    row.attachment_size = echo.attachment_size.or(row.attachment_size);
    row.created_at = echo.created_at;
    row.filter_reasons = echo.filter_reasons;
}

impl Drop for ChatRoom {
    fn drop(&mut self) {
        if let Some(task) = self.listener_slot().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/room_tests.rs"]
mod tests;
