// lib.rs - Chat delivery core shared by the mobile apps

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod config;
pub mod error;
pub mod grouping;
pub mod image_cache;
pub mod image_processing;
pub mod logging;
pub mod model;
pub mod retry;
pub mod sync;
pub mod task_queue;

pub use capabilities::{
    ChatBackend, HttpError, ImageFetcher, PushChannel, PushError, PushEvent, PushIdentity,
    UploadContext, ValidatedUrl,
};
pub use config::{ConfigError, CoreConfig};
pub use error::{ChatError, ChatResult, ErrorKind, ErrorSeverity};
pub use grouping::{
    bubble_corners, group, BubbleCorners, BubblePosition, Direction, GroupItem, MessageGroup,
};
pub use image_cache::{ImageCache, ImageCacheConfig, ImageCacheStats};
pub use model::{
    Attachment, AttachmentKind, ConversationId, DeliveryState, Message, MessageId, UnixTimeMs,
    UserId,
};
pub use retry::{FailureKind, RetryEngine, RetryError, RetryPolicy, Retryable};
pub use sync::{ChatSyncController, MessageTimeline, SendFailure, SyncConfig};
pub use task_queue::{TaskPriority, TaskQueue};
