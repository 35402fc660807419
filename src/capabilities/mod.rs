//! Collaborators consumed by the core. Hosts implement these over their own
//! REST, push and CDN transports.

mod http;
mod push;

use async_trait::async_trait;
use bytes::Bytes;

use crate::model::{ConversationId, Message, MessageId};

pub use self::http::{HttpError, ValidatedUrl, DEFAULT_RETRYABLE_STATUS_CODES, MAX_URL_LENGTH};
pub use self::push::{PushChannel, PushError, PushEvent, PushIdentity};

/// Where an uploaded image will be attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadContext {
    pub conversation_id: ConversationId,
    pub content_type: String,
}

/// REST side of the chat service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_messages(&self, conversation: &ConversationId)
        -> Result<Vec<Message>, HttpError>;

    /// Sends a locally authored message; the server copy keeps the same id.
    async fn send_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<Message, HttpError>;

    async fn upload_image(
        &self,
        bytes: Bytes,
        filename: &str,
        context: &UploadContext,
    ) -> Result<String, HttpError>;

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        upto: &MessageId,
    ) -> Result<(), HttpError>;
}

/// Raw byte fetch used by the image cache.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &ValidatedUrl) -> Result<Bytes, HttpError>;
}
