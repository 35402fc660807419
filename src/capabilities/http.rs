use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::retry::{ConnectionFailure, FailureKind, Retryable};

pub const MAX_URL_LENGTH: usize = 2048;
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl AsRef<str>) -> Result<Self, HttpError> {
        let url = url.as_ref().trim();
        if url.is_empty() {
            return Err(HttpError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
            });
        }

        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!(
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    scheme
                ),
            });
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "URL must have a host".to_string(),
            })?
            .to_lowercase();

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(Self {
            url: parsed.to_string(),
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            return url.to_string();
        }
        let mut cut = 100;
        while !url.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &url[..cut])
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("request body too large: {size} bytes exceeds maximum of {max} bytes")]
    BodyTooLarge { size: usize, max: usize },

    #[error("response body too large: {size} bytes exceeds maximum of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("DNS resolution failed for {host}: {message}")]
    DnsError { host: String, message: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("connection reset by {host}")]
    ConnectionReset { host: String },

    #[error("network unavailable")]
    NoNetwork,

    #[error("TLS error for {host}: {message}")]
    TlsError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl HttpError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        HttpError::HttpStatus {
            status,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status, .. } if (400..500).contains(status))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status, .. } if (500..600).contains(status))
    }

    /// Retryability under the default status-code set.
    pub fn is_retryable(&self) -> bool {
        match self.failure_kind() {
            FailureKind::Connection(_) => true,
            FailureKind::Status(code) => DEFAULT_RETRYABLE_STATUS_CODES.contains(&code),
            FailureKind::Terminal => false,
        }
    }
}

impl Retryable for HttpError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            HttpError::Timeout { .. } => FailureKind::Connection(ConnectionFailure::Timeout),
            HttpError::DnsError { .. } => FailureKind::Connection(ConnectionFailure::Dns),
            HttpError::ConnectionError { .. } | HttpError::ConnectionReset { .. } => {
                FailureKind::Connection(ConnectionFailure::Reset)
            }
            HttpError::NoNetwork => FailureKind::Connection(ConnectionFailure::NoNetwork),
            HttpError::TlsError { .. } => FailureKind::Connection(ConnectionFailure::Tls),
            HttpError::HttpStatus { status, .. } => FailureKind::Status(*status),
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidRequest { .. }
            | HttpError::BodyTooLarge { .. }
            | HttpError::ResponseTooLarge { .. }
            | HttpError::Cancelled
            | HttpError::InvalidResponse { .. } => FailureKind::Terminal,
        }
    }
}
