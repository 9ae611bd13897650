use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use shared::{domain::ChatMessageId, model::ChatMessage};

use crate::error::RoomError;

/// Receives room notifications. Callbacks run synchronously on the task that
/// produced them and must not block.
pub trait RoomObserver: Send + Sync {
    fn on_new_message(&self, _message: &ChatMessage) {}
    fn on_message_history(&self, _messages: &[ChatMessage]) {}
    fn on_message_updated(&self, _message: &ChatMessage) {}
    fn on_message_deleted(&self, _id: &ChatMessageId) {}
    fn on_error(&self, _error: &RoomError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

type Entry = (ObserverHandle, Arc<dyn RoomObserver>);

/// Observers invoked in registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    entries: Mutex<Vec<Entry>>,
    next_handle: AtomicU64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn RoomObserver>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries().push((handle, observer));
        handle
    }

    pub fn remove(&self, handle: ObserverHandle) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(h, _)| *h != handle);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Calls `f` for every observer. The registry lock is released first so
    /// an observer may add or remove observers from inside a callback.
    pub fn notify(&self, f: impl Fn(&dyn RoomObserver)) {
        let snapshot: Vec<Arc<dyn RoomObserver>> = self
            .entries()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in snapshot {
            f(observer.as_ref());
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
