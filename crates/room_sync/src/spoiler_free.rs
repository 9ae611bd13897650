use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use shared::{domain::ChatMessageId, model::ChatMessage, time::PlaybackTime};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{
    error::RoomError,
    observer::{ObserverHandle, ObserverRegistry, RoomObserver},
    room::ChatRoom,
};

/// Current position of the synchronized playback, or `None` when no sync is
/// active.
pub trait PlaybackClock: Send + Sync {
    fn current_position(&self) -> Option<PlaybackTime>;
}

impl<F> PlaybackClock for F
where
    F: Fn() -> Option<PlaybackTime> + Send + Sync,
{
    fn current_position(&self) -> Option<PlaybackTime> {
        self()
    }
}

#[derive(Default)]
struct QueueState {
    visible: Vec<ChatMessage>,
    queue: VecDeque<ChatMessage>,
    torn_down: bool,
}

impl QueueState {
    fn is_visible(&self, id: &ChatMessageId) -> bool {
        self.visible.iter().any(|visible| visible.id() == id)
    }

    fn enqueue(&mut self, message: ChatMessage) -> bool {
        if self.is_visible(message.id())
            || self.queue.iter().any(|queued| queued.id() == message.id())
        {
            return false;
        }
        self.queue.push_back(message);
        true
    }

    /// Marks `message` as released. Returns `false` when it was already
    /// released; a queued copy is dropped either way.
    fn release(&mut self, message: &ChatMessage) -> bool {
        self.queue.retain(|queued| queued.id() != message.id());
        !self.is_visible(message.id())
    }
}

struct DelayCore {
    clock: Arc<dyn PlaybackClock>,
    state: Mutex<QueueState>,
    observers: ObserverRegistry,
}

impl DelayCore {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_due(message: &ChatMessage, now: Option<PlaybackTime>) -> bool {
        match (message.video_timestamp, now) {
            (None, _) | (_, None) => true,
            (Some(stamp), Some(now)) => stamp <= now,
        }
    }

    /// Releases the head of the queue if it is due. Only the head is
    /// examined, so release order is enqueue order.
    fn drain_once(&self) -> bool {
        let released = {
            let mut state = self.state();
            if state.torn_down {
                return false;
            }
            let now = self.clock.current_position();
            let due = state
                .queue
                .front()
                .is_some_and(|head| Self::is_due(head, now));
            if !due {
                return false;
            }
            let Some(head) = state.queue.pop_front() else {
                return false;
            };
            state.visible.push(head.clone());
            head
        };
        debug!(message_id = %released.id(), "spoiler_free: releasing queued message");
        self.observers.notify(|o| o.on_new_message(&released));
        true
    }
}

impl RoomObserver for DelayCore {
    fn on_new_message(&self, message: &ChatMessage) {
        let release = {
            let mut state = self.state();
            if state.torn_down {
                return;
            }
            let now = self.clock.current_position();
            if message.sender.is_local_user || Self::is_due(message, now) {
                let fresh = state.release(message);
                if fresh {
                    state.visible.push(message.clone());
                }
                fresh
            } else {
                if state.enqueue(message.clone()) {
                    debug!(message_id = %message.id(), "spoiler_free: holding message");
                }
                false
            }
        };
        if release {
            self.observers.notify(|o| o.on_new_message(message));
        }
    }

    fn on_message_history(&self, messages: &[ChatMessage]) {
        let released = {
            let mut state = self.state();
            if state.torn_down {
                return;
            }
            let now = self.clock.current_position();
            let (due, held): (Vec<ChatMessage>, Vec<ChatMessage>) = messages
                .iter()
                .cloned()
                .partition(|message| Self::is_due(message, now));
            let mut released: Vec<ChatMessage> = Vec::with_capacity(due.len());
            for message in due {
                let repeated = released.iter().any(|r| r.id() == message.id());
                if state.release(&message) && !repeated {
                    released.push(message);
                }
            }
            let mut visible = released.clone();
            visible.append(&mut state.visible);
            state.visible = visible;
            for message in held {
                state.enqueue(message);
            }
            released
        };
        self.observers.notify(|o| o.on_message_history(&released));
    }

    fn on_message_updated(&self, message: &ChatMessage) {
        let forward = {
            let mut state = self.state();
            if state.torn_down {
                return;
            }
            for queued in state.queue.iter_mut().filter(|q| q.id() == message.id()) {
                *queued = message.clone();
            }
            match state.visible.iter_mut().find(|v| v.id() == message.id()) {
                Some(row) => {
                    *row = message.clone();
                    true
                }
                None => false,
            }
        };
        if forward {
            self.observers.notify(|o| o.on_message_updated(message));
        }
    }

    fn on_message_deleted(&self, id: &ChatMessageId) {
        {
            let mut state = self.state();
            if state.torn_down {
                return;
            }
            state.queue.retain(|queued| queued.id() != id);
            state.visible.retain(|visible| visible.id() != id);
        }
        self.observers.notify(|o| o.on_message_deleted(id));
    }

    fn on_error(&self, error: &RoomError) {
        if self.state().torn_down {
            return;
        }
        self.observers.notify(|o| o.on_error(error));
    }
}

/// Delays delivery of a room's messages until the playback clock reaches the
/// time they were authored at.
///
/// Messages from the local user, messages without a playback timestamp and
/// anything arriving while the clock is unknown pass straight through. Held
/// messages are released strictly in the order they were queued.
pub struct SpoilerFreeRoom {
    room: Arc<ChatRoom>,
    core: Arc<DelayCore>,
    relay_handle: ObserverHandle,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl SpoilerFreeRoom {
    /// Wraps `room` and starts the drain loop at the room's configured
    /// interval. Must be called from within a tokio runtime.
    pub fn new(room: Arc<ChatRoom>, clock: Arc<dyn PlaybackClock>) -> Self {
        let interval = room.config().settings.drain_interval;
        Self::with_interval(room, clock, interval)
    }

    pub fn with_interval(
        room: Arc<ChatRoom>,
        clock: Arc<dyn PlaybackClock>,
        interval: Duration,
    ) -> Self {
        let core = Arc::new(DelayCore {
            clock,
            state: Mutex::new(QueueState::default()),
            observers: ObserverRegistry::new(),
        });
        let relay_handle = room.add_observer(Arc::clone(&core) as Arc<dyn RoomObserver>);
        let task = spawn_drain_loop(Arc::downgrade(&core), interval);

        info!(
            room_id = %room.config().room_id,
            interval_ms = interval.as_millis() as u64,
            "spoiler_free: drain loop started"
        );

        Self {
            room,
            core,
            relay_handle,
            drain_task: Mutex::new(Some(task)),
        }
    }

    /// The wrapped room, for issuing commands.
    pub fn room(&self) -> &Arc<ChatRoom> {
        &self.room
    }

    pub fn add_observer(&self, observer: Arc<dyn RoomObserver>) -> ObserverHandle {
        self.core.observers.add(observer)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.core.observers.remove(handle)
    }

    /// Messages released so far, history first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.core.state().visible.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.core.state().queue.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.state().torn_down
    }

    /// Stops the drain loop and detaches from the room. No further
    /// notifications are delivered afterwards.
    pub fn shutdown(&self) {
        {
            let mut state = self.core.state();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state.queue.clear();
        }
        self.abort_drain_task();
        self.room.remove_observer(self.relay_handle);
        self.core.observers.clear();
        info!(room_id = %self.room.config().room_id, "spoiler_free: shut down");
    }

    #[cfg(test)]
    pub(crate) fn drain_once(&self) -> bool {
        self.core.drain_once()
    }

    fn abort_drain_task(&self) {
        let task = self
            .drain_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for SpoilerFreeRoom {
    fn drop(&mut self) {
        self.core.state().torn_down = true;
        self.abort_drain_task();
        self.room.remove_observer(self.relay_handle);
    }
}

fn spawn_drain_loop(core: Weak<DelayCore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(core) = core.upgrade() else {
                break;
            };
            core.drain_once();
        }
    })
}

#[cfg(test)]
#[path = "tests/spoiler_free_tests.rs"]
mod tests;
