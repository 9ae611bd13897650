use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use room_sync::{
    Channel, ChatRoom, ImageUploader, LoopbackChannel, PlaybackClock, RoomConfig, RoomObserver,
    RoomSettings, SpoilerFreeRoom, UploadedImage,
};
use shared::{
    domain::{ChatMessageId, ImageSize, RoomId, UserId},
    model::{ChatMessage, ChatUser},
    time::PlaybackTime,
};

const BASE_MS: i64 = 1_700_000_000_000;

#[derive(Default)]
struct Inbox {
    new: Mutex<Vec<ChatMessageId>>,
    updated: Mutex<Vec<ChatMessageId>>,
}

impl Inbox {
    fn new_ids(&self) -> Vec<ChatMessageId> {
        self.new.lock().expect("inbox").clone()
    }

    fn updated_count(&self) -> usize {
        self.updated.lock().expect("inbox").len()
    }
}

impl RoomObserver for Inbox {
    fn on_new_message(&self, message: &ChatMessage) {
        self.new.lock().expect("inbox").push(message.id().clone());
    }

    fn on_message_updated(&self, message: &ChatMessage) {
        self.updated.lock().expect("inbox").push(message.id().clone());
    }
}

struct FakeUploader;

#[async_trait]
impl ImageUploader for FakeUploader {
    async fn upload(&self, image: Vec<u8>) -> Result<UploadedImage> {
        Ok(UploadedImage {
            url: format!("https://cdn.test/{}.png", image.len()),
        })
    }
}

fn config(user: &str, settings: RoomSettings) -> RoomConfig {
    RoomConfig::new(
        RoomId::new("watch-party"),
        "watch-party-chat",
        ChatUser::new(user, user, true),
    )
    .with_settings(settings)
}

fn playback(offset_ms: i64) -> PlaybackTime {
    PlaybackTime::from_timestamp_millis(BASE_MS + offset_ms).expect("playback time")
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn pages_backwards_through_the_whole_channel() {
    let channel = Arc::new(LoopbackChannel::new("watch-party-chat", UserId::new("me")));
    for n in 0..7 {
        channel
            .publish_as(UserId::new("friend"), "Friend", &format!("line {n}"), None)
            .await
            .expect("seed");
    }
    let settings = RoomSettings {
        history_page_size: 3,
        ..RoomSettings::default()
    };
    let room = ChatRoom::connect(config("me", settings), channel.clone());

    let newest = room.load_initial_history().await.expect("initial");
    let middle = room.load_previous_history().await.expect("middle");
    let oldest = room.load_previous_history().await.expect("oldest");
    let cursor = room.oldest_loaded_token().await;
    let beyond = room.load_previous_history().await.expect("beyond");

    assert_eq!(
        (newest.len(), middle.len(), oldest.len(), beyond.len()),
        (3, 3, 1, 0)
    );
    assert_eq!(room.oldest_loaded_token().await, cursor);
    let texts: Vec<String> = room.messages().await.into_iter().map(|m| m.text).collect();
    let expected: Vec<String> = (0..7).map(|n| format!("line {n}")).collect();
    assert_eq!(texts, expected);
}

#[tokio::test]
async fn two_rooms_on_one_channel_see_each_others_messages_and_deletions() {
    let channel = Arc::new(LoopbackChannel::new("watch-party-chat", UserId::new("me")));
    let sender = ChatRoom::connect(config("me", RoomSettings::default()), channel.clone());
    let receiver = ChatRoom::connect(config("friend", RoomSettings::default()), channel.clone());
    let inbox = Arc::new(Inbox::default());
    receiver.add_observer(inbox.clone() as Arc<dyn RoomObserver>);

    let sent = sender.send_message("did you see that?", None).await.expect("send");
    assert!(eventually(|| inbox.new_ids() == vec![sent.clone()]).await);

    let received = receiver.message(&sent).await.expect("received row");
    assert!(!received.sender.is_local_user);
    assert_eq!(received.sender.id, UserId::new("me"));

    assert!(wait_for_row(&sender, &sent, true).await);
    sender.delete_message(&sent).await.expect("delete");
    assert!(wait_for_row(&receiver, &sent, false).await);
    assert!(wait_for_row(&sender, &sent, false).await);
}

async fn wait_for_row(room: &ChatRoom, id: &ChatMessageId, present: bool) -> bool {
    for _ in 0..200 {
        if room.message(id).await.is_some() == present {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn changing_a_reaction_leaves_exactly_one_local_vote() {
    let channel = Arc::new(LoopbackChannel::new("watch-party-chat", UserId::new("me")));
    let seeded = channel
        .publish_as(UserId::new("friend"), "Friend", "goal!", None)
        .await
        .expect("seed");
    let room = ChatRoom::connect(config("me", RoomSettings::default()), channel.clone());
    let inbox = Arc::new(Inbox::default());
    room.add_observer(inbox.clone() as Arc<dyn RoomObserver>);
    let loaded = room.load_initial_history().await.expect("history");
    let target = loaded[0].id().clone();
    assert_eq!(loaded[0].channel_message_id(), Some(&seeded.channel_message_id));

    let first = room.send_reaction(&target, "like", None).await.expect("like");
    assert!(eventually(|| inbox.updated_count() == 1).await);
    room.send_reaction(&target, "love", Some(&first))
        .await
        .expect("love");
    assert!(eventually(|| inbox.updated_count() == 3).await);

    let row = room.message(&target).await.expect("row");
    let mine: Vec<&str> = row
        .reactions
        .iter()
        .filter(|vote| vote.is_mine)
        .map(|vote| vote.reaction_kind.as_str())
        .collect();
    assert_eq!(mine, vec!["love"]);
}

#[tokio::test]
async fn image_send_delivers_a_single_row_after_the_echo() {
    let channel = Arc::new(LoopbackChannel::new("watch-party-chat", UserId::new("me")));
    let room = ChatRoom::connect_with_services(
        config("me", RoomSettings::default()),
        channel.clone() as Arc<dyn Channel>,
        Arc::new(FakeUploader),
        None,
    );
    let inbox = Arc::new(Inbox::default());
    room.add_observer(inbox.clone() as Arc<dyn RoomObserver>);

    let sent = room
        .send_image(
            vec![0; 16],
            ImageSize {
                width: 320,
                height: 240,
            },
            None,
        )
        .await
        .expect("send image");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rows = room.messages().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id(), &sent);
    assert_eq!(
        rows[0].attachment_image_url.as_deref(),
        Some("https://cdn.test/16.png")
    );
    assert_eq!(inbox.new_ids(), vec![sent.clone()]);
    let channel_id = room.channel_message_id(&sent).await.expect("mapped");
    assert_eq!(room.chat_message_id(&channel_id).await, Some(sent));
}

struct SharedClock(Arc<AtomicI64>);

impl PlaybackClock for SharedClock {
    fn current_position(&self) -> Option<PlaybackTime> {
        PlaybackTime::from_timestamp_millis(BASE_MS + self.0.load(Ordering::SeqCst))
    }
}

#[tokio::test]
async fn spoiler_free_room_releases_messages_when_playback_catches_up() {
    let channel = Arc::new(LoopbackChannel::new("watch-party-chat", UserId::new("me")));
    let room = ChatRoom::connect(config("me", RoomSettings::default()), channel.clone());
    let position = Arc::new(AtomicI64::new(0));
    let delayed = SpoilerFreeRoom::with_interval(
        room,
        Arc::new(SharedClock(position.clone())),
        Duration::from_millis(5),
    );
    let inbox = Arc::new(Inbox::default());
    delayed.add_observer(inbox.clone() as Arc<dyn RoomObserver>);

    let ahead = channel
        .publish_as(UserId::new("friend"), "Friend", "spoiler", Some(playback(30_000)))
        .await
        .expect("publish ahead");
    channel
        .publish_as(UserId::new("friend"), "Friend", "no stamp", None)
        .await
        .expect("publish untimed");

    assert!(eventually(|| inbox.new_ids().len() == 1).await);
    assert_eq!(delayed.queued_len(), 1);

    position.store(30_000, Ordering::SeqCst);
    assert!(eventually(|| inbox.new_ids().len() == 2).await);
    assert_eq!(delayed.queued_len(), 0);

    let released = delayed.messages();
    let spoiler = released.last().expect("released row");
    assert_eq!(spoiler.text, "spoiler");
    assert_eq!(spoiler.channel_message_id(), Some(&ahead.channel_message_id));

    delayed.shutdown();
    channel
        .publish_as(UserId::new("friend"), "Friend", "after shutdown", None)
        .await
        .expect("publish late");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(inbox.new_ids().len(), 2);
}
