use super::*;
use std::collections::BTreeSet;

use serde_json::json;
use shared::{
    domain::{ChannelMessageId, MessageKind, RoomId, UserId},
    model::{ChatUser, MessageIdentity, ReactionVote, ReactionVotes},
    time::TimeToken,
};

use crate::{
    channel::{ChannelEvent, PageEntry},
    config::RoomConfig,
    loopback::LoopbackChannel,
};

const BASE_MS: i64 = 1_700_000_000_000;

#[derive(Default)]
struct ManualClock {
    position: Mutex<Option<PlaybackTime>>,
}

impl ManualClock {
    fn starting_at(offset_ms: i64) -> Arc<Self> {
        let clock = Arc::new(Self::default());
        clock.set(Some(offset_ms));
        clock
    }

    fn set(&self, offset_ms: Option<i64>) {
        *self.position.lock().expect("clock") = offset_ms.map(at);
    }
}

impl PlaybackClock for ManualClock {
    fn current_position(&self) -> Option<PlaybackTime> {
        *self.position.lock().expect("clock")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    New(String),
    History(Vec<String>),
    Updated(String),
    Deleted(String),
}

#[derive(Default)]
struct Collector {
    seen: Mutex<Vec<Seen>>,
}

impl Collector {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().expect("seen").clone()
    }
}

impl RoomObserver for Collector {
    fn on_new_message(&self, message: &ChatMessage) {
        self.seen
            .lock()
            .expect("seen")
            .push(Seen::New(message.id().to_string()));
    }

    fn on_message_history(&self, messages: &[ChatMessage]) {
        self.seen.lock().expect("seen").push(Seen::History(
            messages.iter().map(|m| m.id().to_string()).collect(),
        ));
    }

    fn on_message_updated(&self, message: &ChatMessage) {
        self.seen
            .lock()
            .expect("seen")
            .push(Seen::Updated(message.id().to_string()));
    }

    fn on_message_deleted(&self, id: &ChatMessageId) {
        self.seen
            .lock()
            .expect("seen")
            .push(Seen::Deleted(id.to_string()));
    }
}

fn at(offset_ms: i64) -> PlaybackTime {
    PlaybackTime::from_timestamp_millis(BASE_MS + offset_ms).expect("playback time")
}

fn message(id: &str, stamp_ms: Option<i64>, local: bool) -> ChatMessage {
    let sender = if local {
        ChatUser::new("me", "Me", true)
    } else {
        ChatUser::new("other", "Other", false)
    };
    ChatMessage {
        identity: MessageIdentity::Confirmed {
            id: ChatMessageId::new(id),
            channel_id: ChannelMessageId::new(format!("c-{id}")),
        },
        kind: MessageKind::Text,
        room_id: RoomId::new("room-1"),
        channel_name: "chan-1".into(),
        text: format!("text {id}"),
        sender,
        video_timestamp: stamp_ms.map(at),
        reactions: ReactionVotes::new(),
        created_at: TimeToken::new(1),
        sender_image_url: None,
        attachment_image_url: None,
        attachment_size: None,
        filtered_text: None,
        filter_reasons: BTreeSet::new(),
    }
}

fn ids(messages: &[ChatMessage]) -> Vec<String> {
    messages.iter().map(|m| m.id().to_string()).collect()
}

fn room() -> Arc<ChatRoom> {
    let channel = Arc::new(LoopbackChannel::new("chan-1", UserId::new("me")));
    ChatRoom::connect(
        RoomConfig::new(
            RoomId::new("room-1"),
            "chan-1",
            ChatUser::new("me", "Me", true),
        ),
        channel,
    )
}

fn wrap(clock: Arc<ManualClock>) -> (SpoilerFreeRoom, Arc<Collector>) {
    let delayed = SpoilerFreeRoom::with_interval(room(), clock, Duration::from_secs(3600));
    let collector = Arc::new(Collector::default());
    delayed.add_observer(Arc::clone(&collector) as Arc<dyn RoomObserver>);
    (delayed, collector)
}

#[tokio::test]
async fn holds_future_messages_and_releases_head_first() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(Arc::clone(&clock));

    delayed.core.on_new_message(&message("later", Some(10_000), false));
    delayed.core.on_new_message(&message("sooner", Some(5_000), false));
    assert_eq!(delayed.queued_len(), 2);
    assert!(collector.seen().is_empty());

    clock.set(Some(6_000));
    assert!(!delayed.drain_once(), "head is not due yet");

    clock.set(Some(10_000));
    assert!(delayed.drain_once());
    assert!(delayed.drain_once());
    assert!(!delayed.drain_once());

    assert_eq!(
        collector.seen(),
        vec![Seen::New("later".into()), Seen::New("sooner".into())]
    );
    assert_eq!(ids(&delayed.messages()), vec!["later", "sooner"]);
}

#[tokio::test]
async fn local_untimed_and_unsynced_messages_pass_straight_through() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(Arc::clone(&clock));

    delayed.core.on_new_message(&message("mine", Some(60_000), true));
    delayed.core.on_new_message(&message("untimed", None, false));
    clock.set(None);
    delayed.core.on_new_message(&message("unsynced", Some(60_000), false));

    assert_eq!(delayed.queued_len(), 0);
    assert_eq!(
        collector.seen(),
        vec![
            Seen::New("mine".into()),
            Seen::New("untimed".into()),
            Seen::New("unsynced".into()),
        ]
    );
}

#[tokio::test]
async fn queued_messages_drain_freely_once_sync_stops() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(Arc::clone(&clock));

    delayed.core.on_new_message(&message("held", Some(60_000), false));
    clock.set(None);

    assert!(delayed.drain_once());
    assert_eq!(collector.seen(), vec![Seen::New("held".into())]);
}

#[tokio::test]
async fn history_is_split_and_released_part_is_prepended() {
    let clock = ManualClock::starting_at(1_000);
    let (delayed, collector) = wrap(Arc::clone(&clock));
    delayed.core.on_new_message(&message("live", None, false));

    delayed.core.on_message_history(&[
        message("old", Some(500), false),
        message("future", Some(2_000), false),
        message("plain", None, false),
    ]);

    assert_eq!(ids(&delayed.messages()), vec!["old", "plain", "live"]);
    assert_eq!(delayed.queued_len(), 1);
    assert_eq!(
        collector.seen()[1],
        Seen::History(vec!["old".into(), "plain".into()])
    );
}

#[tokio::test]
async fn repeated_holds_of_the_same_message_queue_once() {
    let clock = ManualClock::starting_at(0);
    let (delayed, _collector) = wrap(clock);
    let held = message("dup", Some(9_000), false);

    delayed.core.on_new_message(&held);
    delayed.core.on_message_history(std::slice::from_ref(&held));

    assert_eq!(delayed.queued_len(), 1);
}

#[tokio::test]
async fn held_message_released_through_history_is_not_drained_again() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(Arc::clone(&clock));
    let held = message("held", Some(5_000), false);
    delayed.core.on_new_message(&held);
    assert_eq!(delayed.queued_len(), 1);

    clock.set(Some(6_000));
    delayed.core.on_message_history(std::slice::from_ref(&held));
    delayed.core.on_message_history(std::slice::from_ref(&held));

    assert_eq!(delayed.queued_len(), 0);
    assert!(!delayed.drain_once());
    assert_eq!(ids(&delayed.messages()), vec!["held"]);
    assert_eq!(
        collector.seen(),
        vec![Seen::History(vec!["held".into()]), Seen::History(Vec::new())]
    );
}

#[tokio::test]
async fn due_redelivery_of_a_queued_message_releases_it_once() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(Arc::clone(&clock));
    let held = message("held", Some(5_000), false);
    delayed.core.on_new_message(&held);

    clock.set(Some(5_000));
    delayed.core.on_new_message(&held);
    delayed.core.on_new_message(&held);

    assert_eq!(delayed.queued_len(), 0);
    assert!(!delayed.drain_once());
    assert_eq!(ids(&delayed.messages()), vec!["held"]);
    assert_eq!(collector.seen(), vec![Seen::New("held".into())]);
}

#[tokio::test]
async fn released_messages_are_not_queued_again() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(Arc::clone(&clock));
    let held = message("held", Some(5_000), false);
    delayed.core.on_new_message(&held);
    clock.set(Some(5_000));
    assert!(delayed.drain_once());

    clock.set(Some(0));
    delayed.core.on_new_message(&held);
    delayed.core.on_message_history(std::slice::from_ref(&held));

    assert_eq!(delayed.queued_len(), 0);
    assert_eq!(ids(&delayed.messages()), vec!["held"]);
    assert_eq!(
        collector.seen(),
        vec![Seen::New("held".into()), Seen::History(Vec::new())]
    );
}

#[tokio::test]
async fn deletions_drop_queued_and_visible_rows() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(clock);
    delayed.core.on_new_message(&message("held", Some(9_000), false));
    delayed.core.on_new_message(&message("shown", None, false));

    delayed.core.on_message_deleted(&ChatMessageId::new("held"));
    delayed.core.on_message_deleted(&ChatMessageId::new("shown"));

    assert_eq!(delayed.queued_len(), 0);
    assert!(delayed.messages().is_empty());
    assert_eq!(
        collector.seen(),
        vec![
            Seen::New("shown".into()),
            Seen::Deleted("held".into()),
            Seen::Deleted("shown".into()),
        ]
    );
}

#[tokio::test]
async fn updates_to_held_messages_wait_for_release() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(Arc::clone(&clock));
    let mut held = message("held", Some(9_000), false);
    delayed.core.on_new_message(&held);

    held.reactions.push(ReactionVote {
        vote_id: shared::domain::ActionId::new("v1"),
        reaction_kind: "like".into(),
        is_mine: false,
    });
    delayed.core.on_message_updated(&held);
    assert!(collector.seen().is_empty());

    clock.set(Some(9_000));
    assert!(delayed.drain_once());
    let visible = delayed.messages();
    assert_eq!(visible[0].reactions.count_for("like"), 1);

    delayed.core.on_message_updated(&held);
    assert_eq!(
        collector.seen(),
        vec![Seen::New("held".into()), Seen::Updated("held".into())]
    );
}

#[tokio::test]
async fn relays_room_events_until_shutdown() {
    let clock = ManualClock::starting_at(0);
    let (delayed, collector) = wrap(clock);
    let entry = |n: i64, id: &str| PageEntry {
        channel_message_id: ChannelMessageId::new(format!("c-{n}")),
        created_at: TimeToken::new(n),
        payload: json!({
            "event": "message-created",
            "payload": {
                "id": id,
                "message": "hi",
                "sender_id": "other",
                "sender_nickname": "Other",
            }
        }),
        actions: Vec::new(),
    };

    delayed
        .room()
        .handle_channel_event(ChannelEvent::MessageCreated(entry(1, "before")))
        .await;
    delayed.shutdown();
    delayed.shutdown();
    delayed
        .room()
        .handle_channel_event(ChannelEvent::MessageCreated(entry(2, "after")))
        .await;

    assert!(delayed.is_shut_down());
    assert!(!delayed.drain_once());
    assert_eq!(collector.seen(), vec![Seen::New("before".into())]);
    assert_eq!(delayed.room().messages().await.len(), 2);
}

#[tokio::test]
async fn drain_loop_releases_messages_as_playback_advances() {
    let clock = ManualClock::starting_at(0);
    let delayed = SpoilerFreeRoom::with_interval(
        room(),
        Arc::clone(&clock) as Arc<dyn PlaybackClock>,
        Duration::from_millis(5),
    );
    let collector = Arc::new(Collector::default());
    delayed.add_observer(Arc::clone(&collector) as Arc<dyn RoomObserver>);

    delayed.core.on_new_message(&message("held", Some(1_000), false));
    clock.set(Some(1_000));

    for _ in 0..200 {
        if delayed.queued_len() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(delayed.queued_len(), 0);
    assert_eq!(collector.seen(), vec![Seen::New("held".into())]);
}

#[test]
fn closures_work_as_clocks() {
    let fixed = at(42);
    let clock: Arc<dyn PlaybackClock> = Arc::new(move || Some(fixed));
    assert_eq!(clock.current_position(), Some(fixed));
}
