use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelErrorCode {
    Unauthorized,
    Forbidden,
    /// The channel has no stored messages for the requested range.
    NotFound,
    Validation,
    RateLimited,
    Network,
    Internal,
}

/// Failure reported by the pub/sub transport for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ChannelError {
    pub code: ChannelErrorCode,
    pub message: String,
}

impl ChannelError {
    pub fn new(code: ChannelErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ChannelErrorCode::NotFound, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ChannelErrorCode::NotFound
    }
}
