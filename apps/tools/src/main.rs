use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use room_sync::{
    load_settings_from, ChatRoom, LoopbackChannel, PlaybackClock, RoomConfig, RoomError,
    RoomObserver, RoomSettings, SpoilerFreeRoom,
};
use shared::{
    domain::{ChatMessageId, RoomId, UserId},
    model::{ChatMessage, ChatUser},
    time::PlaybackTime,
};
use tracing::info;

const PLAYBACK_START_MS: i64 = 1_700_000_000_000;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "room.toml")]
    settings: PathBuf,
    #[arg(long, default_value = "demo-room")]
    room: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Holds messages stamped ahead of playback and prints them as the clock
    /// catches up.
    Simulate {
        #[arg(long, default_value_t = 5)]
        messages: u32,
        #[arg(long, default_value_t = 1_000)]
        lead_ms: i64,
        #[arg(long, default_value = "friend")]
        nickname: String,
    },
    /// Seeds a channel and pages backwards through its history.
    History {
        #[arg(long, default_value_t = 25)]
        messages: u32,
        #[arg(long, default_value_t = 10)]
        page: u32,
    },
}

struct PrintingObserver;

impl RoomObserver for PrintingObserver {
    fn on_new_message(&self, message: &ChatMessage) {
        let at = message
            .video_timestamp
            .map(|t| format!("+{}ms", t.timestamp_millis() - PLAYBACK_START_MS))
            .unwrap_or_else(|| "-".into());
        println!(
            "delivered {} [{at}] {}: {}",
            message.id(),
            message.sender.nickname,
            message.display_text()
        );
    }

    fn on_message_deleted(&self, id: &ChatMessageId) {
        println!("deleted {id}");
    }

    fn on_error(&self, error: &RoomError) {
        eprintln!("room error: {error}");
    }
}

struct ManualClock {
    offset_ms: AtomicI64,
}

impl ManualClock {
    fn advance(&self, by_ms: i64) -> i64 {
        self.offset_ms.fetch_add(by_ms, Ordering::SeqCst) + by_ms
    }
}

impl PlaybackClock for ManualClock {
    fn current_position(&self) -> Option<PlaybackTime> {
        PlaybackTime::from_timestamp_millis(
            PLAYBACK_START_MS + self.offset_ms.load(Ordering::SeqCst),
        )
    }
}

fn playback_at(offset_ms: i64) -> Result<PlaybackTime> {
    PlaybackTime::from_timestamp_millis(PLAYBACK_START_MS + offset_ms)
        .ok_or_else(|| anyhow!("playback offset {offset_ms}ms is out of range"))
}

fn room_config(room: &str, settings: RoomSettings) -> RoomConfig {
    RoomConfig::new(RoomId::new(room), room, ChatUser::new("me", "Me", true))
        .with_settings(settings)
}

async fn simulate(
    room_name: &str,
    settings: RoomSettings,
    messages: u32,
    lead_ms: i64,
    nickname: &str,
) -> Result<()> {
    let lead_ms = lead_ms.max(1);
    let tick = settings.drain_interval;
    let channel = Arc::new(LoopbackChannel::new(room_name, UserId::new("me")));
    let room = ChatRoom::connect(room_config(room_name, settings), channel.clone());
    let clock = Arc::new(ManualClock {
        offset_ms: AtomicI64::new(0),
    });
    let delayed = SpoilerFreeRoom::new(room.clone(), clock.clone());
    delayed.add_observer(Arc::new(PrintingObserver));

    let friend = UserId::new(nickname);
    for n in 1..=i64::from(messages) {
        channel
            .publish_as(
                friend.clone(),
                nickname,
                &format!("message {n}"),
                Some(playback_at(n * lead_ms)?),
            )
            .await?;
    }
    tokio::time::sleep(tick).await;
    info!(queued = delayed.queued_len(), "simulate: messages seeded");

    while delayed.queued_len() > 0 {
        let now = clock.advance(lead_ms);
        println!("playback at +{now}ms");
        tokio::time::sleep(tick * 2).await;
    }

    delayed.shutdown();
    room.disconnect().await;
    Ok(())
}

async fn history(
    room_name: &str,
    mut settings: RoomSettings,
    messages: u32,
    page: u32,
) -> Result<()> {
    settings.history_page_size = page;
    let channel = Arc::new(LoopbackChannel::new(room_name, UserId::new("me")));
    let author = UserId::new("archivist");
    for n in 1..=messages {
        channel
            .publish_as(author.clone(), "Archivist", &format!("entry {n}"), None)
            .await?;
    }

    let room = ChatRoom::connect(room_config(room_name, settings), channel);
    let mut batch = room.load_initial_history().await?;
    let mut index = 1;
    while !batch.is_empty() {
        let texts: Vec<&str> = batch.iter().map(|m| m.text.as_str()).collect();
        println!("page {index}: {}", texts.join(", "));
        batch = room.load_previous_history().await?;
        index += 1;
    }
    println!("loaded {} messages", room.messages().await.len());

    room.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let settings = load_settings_from(&cli.settings);

    match cli.command {
        Command::Simulate {
            messages,
            lead_ms,
            nickname,
        } => simulate(&cli.room, settings, messages, lead_ms, &nickname).await?,
        Command::History { messages, page } => {
            history(&cli.room, settings, messages, page).await?
        }
    }

    Ok(())
}
