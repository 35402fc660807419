//! User-facing error layer. Lower layers keep their own thiserror enums and
//! convert into [`ChatError`] only where a failure reaches the host UI.

use serde::{Deserialize, Serialize};

use crate::capabilities::{HttpError, PushError};
use crate::config::ConfigError;
use crate::image_processing::ImageProcessingError;
use crate::model::{MessageId, ValidationError, MAX_CONTENT_LENGTH};
use crate::retry::RetryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    RateLimited,
    Server,
    PushChannel,
    ImageProcessing,
    Cancelled,
    Configuration,
    InvalidState,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::Server => "SERVER_ERROR",
            Self::PushChannel => "PUSH_CHANNEL_ERROR",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Configuration => "CONFIG_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::RateLimited
            | Self::Server
            | Self::PushChannel => ErrorSeverity::Transient,

            Self::Configuration | Self::InvalidState => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::ImageProcessing
            | Self::Cancelled
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::RateLimited
                | Self::Server
                | Self::PushChannel
        )
    }

    fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::Authentication,
            403 => Self::Authorization,
            404 => Self::NotFound,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    /// Attempts spent before giving up, when the failure went through retry.
    pub attempts: Option<u32>,
}

impl ChatError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            attempts: None,
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn unknown_message(id: &MessageId) -> Self {
        Self::new(ErrorKind::NotFound, format!("Message {id} is not in this conversation"))
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => {
                "Your session has expired. Please sign in again.".into()
            }
            ErrorKind::Authorization => {
                "You don't have permission to post in this conversation.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "This message or conversation no longer exists.".into(),
            ErrorKind::RateLimited => {
                "You're sending messages too quickly. Please wait a moment.".into()
            }
            ErrorKind::Server => {
                "The chat service is having trouble. Your message was not sent.".into()
            }
            ErrorKind::PushChannel => {
                "Live updates are unavailable. New messages may be delayed.".into()
            }
            ErrorKind::ImageProcessing => {
                "Unable to process the image. Please try a different photo.".into()
            }
            ErrorKind::Cancelled => "The operation was cancelled.".into(),
            ErrorKind::Configuration | ErrorKind::InvalidState => {
                "The chat is in an invalid state. Please reopen the conversation.".into()
            }
            ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(attempts) = self.attempts {
            write!(f, " after {attempts} attempt(s)")?;
        }
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ChatError {}

pub type ChatResult<T> = Result<T, ChatError>;

impl From<HttpError> for ChatError {
    fn from(e: HttpError) -> Self {
        let kind = match &e {
            HttpError::Timeout { .. } => ErrorKind::Timeout,
            HttpError::DnsError { .. }
            | HttpError::ConnectionError { .. }
            | HttpError::ConnectionReset { .. }
            | HttpError::NoNetwork
            | HttpError::TlsError { .. } => ErrorKind::Network,
            HttpError::HttpStatus { status, .. } => ErrorKind::from_status(*status),
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidRequest { .. }
            | HttpError::BodyTooLarge { .. } => ErrorKind::Validation,
            HttpError::Cancelled => ErrorKind::Cancelled,
            HttpError::ResponseTooLarge { .. } | HttpError::InvalidResponse { .. } => {
                ErrorKind::Server
            }
        };
        ChatError::new(kind, e.to_string())
    }
}

impl<E> From<RetryError<E>> for ChatError
where
    ChatError: From<E>,
{
    fn from(e: RetryError<E>) -> Self {
        match e {
            RetryError::Cancelled { attempts } => {
                ChatError::new(ErrorKind::Cancelled, "Request cancelled").with_attempts(attempts)
            }
            RetryError::Failed { attempts, source } => {
                ChatError::from(source).with_attempts(attempts)
            }
        }
    }
}

impl From<ValidationError> for ChatError {
    fn from(e: ValidationError) -> Self {
        let message = match &e {
            ValidationError::ContentTooLong { .. } => format!(
                "Messages can be at most {} characters.",
                MAX_CONTENT_LENGTH
            ),
            ValidationError::EmptyMessage => "Type a message or attach a photo.".to_string(),
            _ => e.to_string(),
        };
        ChatError::new(ErrorKind::Validation, message).with_internal(e.to_string())
    }
}

impl From<PushError> for ChatError {
    fn from(e: PushError) -> Self {
        let kind = match &e {
            PushError::Unauthorized { .. } => ErrorKind::Authentication,
            PushError::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::PushChannel,
        };
        ChatError::new(kind, e.to_string())
    }
}

impl From<ImageProcessingError> for ChatError {
    fn from(e: ImageProcessingError) -> Self {
        ChatError::new(ErrorKind::ImageProcessing, e.to_string())
    }
}

impl From<ConfigError> for ChatError {
    fn from(e: ConfigError) -> Self {
        ChatError::new(ErrorKind::Configuration, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(ChatError::from(HttpError::status(401, "")).kind(), ErrorKind::Authentication);
        assert_eq!(ChatError::from(HttpError::status(404, "")).kind(), ErrorKind::NotFound);
        assert_eq!(ChatError::from(HttpError::status(429, "")).kind(), ErrorKind::RateLimited);
        assert_eq!(ChatError::from(HttpError::status(503, "")).kind(), ErrorKind::Server);
        assert_eq!(ChatError::from(HttpError::status(418, "")).kind(), ErrorKind::Unknown);
    }

    #[test]
    fn exhausted_retry_keeps_attempt_count() {
        let err = ChatError::from(RetryError::Failed {
            attempts: 3,
            source: HttpError::NoNetwork,
        });
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.attempts, Some(3));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = ChatError::from(ValidationError::EmptyMessage);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
        assert_eq!(err.user_facing_message(), "Type a message or attach a photo.");
    }

    #[test]
    fn fatal_severity_blocks_retry() {
        let err = ChatError::invalid_state("controller closed");
        assert_eq!(err.severity, ErrorSeverity::Fatal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_is_retryable_with_generic_wait_message() {
        let err = ChatError::from(HttpError::status(429, "slow down"));
        assert!(err.is_retryable());
        assert!(err.user_facing_message().contains("wait a moment"));
    }

    #[test]
    fn cancelled_work_is_not_offered_for_retry() {
        let err = ChatError::from(RetryError::<HttpError>::Cancelled { attempts: 2 });
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.severity, ErrorSeverity::Permanent);
        assert!(!err.is_retryable());
        assert!(!ChatError::from(HttpError::Cancelled).is_retryable());
    }
}
