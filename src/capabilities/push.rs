use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Message, UserId};
use crate::retry::{ConnectionFailure, FailureKind, Retryable};

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushError {
    #[error("push channel not connected")]
    NotConnected,

    #[error("authentication rejected: {reason}")]
    Unauthorized { reason: String },

    #[error("network error: {message}")]
    Network {
        message: String,
        #[serde(default)]
        is_retryable: bool,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl PushError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { is_retryable, .. } => *is_retryable,
            Self::Timeout => true,
            Self::NotConnected | Self::Unauthorized { .. } | Self::Unknown { .. } => false,
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            is_retryable: true,
        }
    }
}

impl Retryable for PushError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout => FailureKind::Connection(ConnectionFailure::Timeout),
            Self::Network { is_retryable: true, .. } => {
                FailureKind::Connection(ConnectionFailure::Reset)
            }
            _ => FailureKind::Terminal,
        }
    }
}

/// Identity presented when opening the push connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

/// Events yielded by the push channel. No ordering or dedup guarantees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Message(Message),
    Connected,
    /// The channel came back after a drop; messages may be replayed.
    Reconnected,
    Disconnected { reason: Option<String> },
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self, token: &str, identity: &PushIdentity) -> Result<(), PushError>;

    /// Live event stream; ends when the channel is shut down.
    fn subscribe(&self) -> BoxStream<'static, PushEvent>;
}
