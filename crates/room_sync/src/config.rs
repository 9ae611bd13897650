use std::{collections::BTreeSet, collections::HashMap, fs, path::Path, time::Duration};

use shared::{domain::RoomId, model::ChatUser};

/// Page size bounds accepted by the channel's history API.
pub const MIN_PAGE_SIZE: u32 = 1;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSettings {
    pub history_page_size: u32,
    pub since_page_size: u32,
    pub drain_interval: Duration,
    /// Server-side filter reasons whose messages are hidden in this room.
    pub content_filters: BTreeSet<String>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            history_page_size: 50,
            since_page_size: MAX_PAGE_SIZE,
            drain_interval: Duration::from_millis(200),
            content_filters: BTreeSet::new(),
        }
    }
}

impl RoomSettings {
    pub fn history_limit(&self) -> u32 {
        self.history_page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }

    pub fn since_limit(&self) -> u32 {
        self.since_page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

/// Identity of one connected room session.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub room_id: RoomId,
    pub channel_name: String,
    pub local_user: ChatUser,
    pub sender_image_url: Option<String>,
    pub settings: RoomSettings,
}

impl RoomConfig {
    pub fn new(room_id: RoomId, channel_name: impl Into<String>, local_user: ChatUser) -> Self {
        Self {
            room_id,
            channel_name: channel_name.into(),
            local_user,
            sender_image_url: None,
            settings: RoomSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RoomSettings) -> Self {
        self.settings = settings;
        self
    }
}

pub fn load_settings() -> RoomSettings {
    load_settings_from("room.toml")
}

pub fn load_settings_from(path: impl AsRef<Path>) -> RoomSettings {
    let mut settings = RoomSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_overrides(&mut settings, |key| file_cfg.get(key).cloned());
        }
    }

    if let Ok(v) = std::env::var("ROOM_HISTORY_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }
    apply_overrides(&mut settings, |key| {
        std::env::var(format!("APP__{}", key.to_ascii_uppercase())).ok()
    });

    settings
}

fn apply_overrides(settings: &mut RoomSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("history_page_size") {
        if let Ok(parsed) = v.trim().parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }
    if let Some(v) = lookup("since_page_size") {
        if let Ok(parsed) = v.trim().parse::<u32>() {
            settings.since_page_size = parsed;
        }
    }
    if let Some(v) = lookup("drain_interval_ms") {
        if let Ok(parsed) = v.trim().parse::<u64>() {
            settings.drain_interval = Duration::from_millis(parsed.max(1));
        }
    }
    if let Some(v) = lookup("content_filters") {
        settings.content_filters = parse_filter_list(&v);
    }
}

fn parse_filter_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .map(str::to_string)
        .collect()
}
