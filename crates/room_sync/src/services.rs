use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{ChatMessageId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub url: String,
}

#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload(&self, image: Vec<u8>) -> Result<UploadedImage>;
}

pub struct MissingImageUploader;

#[async_trait]
impl ImageUploader for MissingImageUploader {
    async fn upload(&self, image: Vec<u8>) -> Result<UploadedImage> {
        Err(anyhow!(
            "image uploader is unavailable; dropping {} bytes",
            image.len()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReport {
    pub room_id: RoomId,
    pub reporter_nickname: String,
    pub message_id: ChatMessageId,
    /// Image URL for image messages, otherwise the message text.
    pub content: String,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, report: MessageReport) -> Result<()>;
}
