//! Client-side chat room synchronization over a pub/sub channel, with an
//! optional spoiler-free delivery mode that holds messages back until a
//! playback clock catches up with them.

pub mod channel;
pub mod config;
pub mod error;
pub mod history;
pub mod loopback;
pub mod observer;
pub mod room;
pub mod services;
pub mod spoiler_free;

pub use channel::{Channel, ChannelEvent, MessageAction, Page, PageEntry};
pub use config::{load_settings, load_settings_from, RoomConfig, RoomSettings};
pub use error::{RoomError, RoomResult};
pub use loopback::LoopbackChannel;
pub use observer::{ObserverHandle, RoomObserver};
pub use room::ChatRoom;
pub use services::{ImageUploader, MessageReport, MissingImageUploader, Reporter, UploadedImage};
pub use spoiler_free::{PlaybackClock, SpoilerFreeRoom};
