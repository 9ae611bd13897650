use shared::{domain::ChatMessageId, error::ChannelError, protocol::PayloadError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("channel request failed: {0}")]
    Transport(#[from] ChannelError),
    #[error("image upload failed: {0}")]
    Upload(String),
    #[error("message report failed: {0}")]
    Report(String),
    #[error("invalid chat payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("message {0} not found in room")]
    MessageNotFound(ChatMessageId),
    #[error("no message reporter configured")]
    ReporterUnavailable,
    #[error("message {0} has not been confirmed by the channel yet")]
    UnconfirmedMessage(ChatMessageId),
    #[error("room is disconnected")]
    Disconnected,
    #[error("channel event stream lagged; {0} events skipped")]
    EventStreamLagged(u64),
    #[error("channel event stream closed")]
    EventStreamClosed,
}

pub type RoomResult<T> = std::result::Result<T, RoomError>;
