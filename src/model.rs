use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const MAX_CONTENT_LENGTH: usize = 8 * 1024;
pub const MAX_ATTACHMENTS: usize = 10;
pub const MAX_ID_LENGTH: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("identifier cannot be empty")]
    EmptyId,
    #[error("identifier too long ({len} > {max})")]
    IdTooLong { len: usize, max: usize },
    #[error("message content too long ({len} > {max})")]
    ContentTooLong { len: usize, max: usize },
    #[error("too many attachments ({count} > {max})")]
    TooManyAttachments { count: usize, max: usize },
    #[error("message has neither content nor attachments")]
    EmptyMessage,
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn parse(s: impl Into<String>) -> Result<Self, ValidationError> {
                let s = s.into().trim().to_string();
                if s.is_empty() {
                    return Err(ValidationError::EmptyId);
                }
                if s.len() > MAX_ID_LENGTH {
                    return Err(ValidationError::IdTooLong {
                        len: s.len(),
                        max: MAX_ID_LENGTH,
                    });
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

typed_id!(MessageId);
typed_id!(UserId);
typed_id!(ConversationId);

impl MessageId {
    /// Client-side id for optimistic sends; the server echoes it back.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Absolute distance between two instants.
    pub fn abs_diff(self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    File,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
}

impl Attachment {
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            url: url.into(),
        }
    }

    pub fn file(url: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::File,
            url: url.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == AttachmentKind::Image
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    #[default]
    Sent,
    Failed,
}

impl DeliveryState {
    pub fn is_pending(self) -> bool {
        matches!(self, DeliveryState::Sending)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// `None` marks a system message.
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub sender_avatar: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub created_at: Option<UnixTimeMs>,
    #[serde(default)]
    pub delivery_state: DeliveryState,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender_id: Option<UserId>,
        sender_name: impl Into<String>,
        created_at: Option<UnixTimeMs>,
    ) -> Self {
        Self {
            id,
            sender_id,
            sender_name: sender_name.into(),
            sender_avatar: None,
            content: None,
            attachments: Vec::new(),
            created_at,
            delivery_state: DeliveryState::Sent,
        }
    }

    /// Locally authored message in the `Sending` state, stamped with a fresh id.
    pub fn outgoing(
        sender_id: UserId,
        sender_name: impl Into<String>,
        content: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Self, ValidationError> {
        let message = Self {
            id: MessageId::generate(),
            sender_id: Some(sender_id),
            sender_name: sender_name.into(),
            sender_avatar: None,
            content,
            attachments,
            created_at: Some(UnixTimeMs::now()),
            delivery_state: DeliveryState::Sending,
        };
        message.validate()?;
        Ok(message)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.sender_avatar = Some(avatar.into());
        self
    }

    pub fn with_delivery_state(mut self, state: DeliveryState) -> Self {
        self.delivery_state = state;
        self
    }

    pub fn is_system(&self) -> bool {
        self.sender_id.is_none()
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        self.sender_id.as_ref() == Some(user)
    }

    pub fn image_urls(&self) -> impl Iterator<Item = &str> {
        self.attachments
            .iter()
            .filter(|a| a.is_image())
            .map(|a| a.url.as_str())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(content) = &self.content {
            if content.len() > MAX_CONTENT_LENGTH {
                return Err(ValidationError::ContentTooLong {
                    len: content.len(),
                    max: MAX_CONTENT_LENGTH,
                });
            }
        }
        if self.attachments.len() > MAX_ATTACHMENTS {
            return Err(ValidationError::TooManyAttachments {
                count: self.attachments.len(),
                max: MAX_ATTACHMENTS,
            });
        }
        let has_text = self
            .content
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if !has_text && self.attachments.is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        Ok(())
    }
}

// Redact debug output because message bodies are user-provided content.
impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("sender_id", &self.sender_id)
            .field("content_len", &self.content.as_ref().map(String::len))
            .field("attachments", &self.attachments.len())
            .field("created_at", &self.created_at)
            .field("delivery_state", &self.delivery_state)
            .finish()
    }
}
