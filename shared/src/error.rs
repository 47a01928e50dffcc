use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{HttpError, ImageError, KvError};

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
    NotFound,
    Validation,
    Storage,
    Deserialization,
    ImageProcessing,
    InvalidState,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NotFound => "NOT_FOUND",
            Self::Validation => "VALIDATION_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Storage => ErrorSeverity::Transient,
            Self::Deserialization | Self::Internal | Self::InvalidState => ErrorSeverity::Fatal,
            Self::NotFound | Self::Validation | Self::ImageProcessing => ErrorSeverity::Permanent,
        }
    }
}

/// Crate-level error surfaced to the shell.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("network error: {0}")]
    Network(#[from] HttpError),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("page {page} is already being fetched")]
    FetchInFlight { page: u32 },

    #[error("stale response for page {got}, current page is {expected}")]
    StalePage { expected: u32, got: u32 },

    #[error("index {index} out of range for {count} products")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("product at index {index} has no id")]
    MissingProductId { index: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("catalog core is no longer running")]
    Closed,
}

impl CatalogError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(HttpError::Timeout { .. }) => ErrorKind::Timeout,
            Self::Network(HttpError::HttpStatus { status: 404, .. }) => ErrorKind::NotFound,
            Self::Network(HttpError::InvalidResponse { .. }) => ErrorKind::Deserialization,
            Self::Network(HttpError::InvalidUrl { .. } | HttpError::PrivateNetworkBlocked { .. }) => {
                ErrorKind::Validation
            }
            Self::Network(HttpError::Aborted { .. }) => ErrorKind::Internal,
            Self::Network(_) => ErrorKind::Network,
            Self::Storage(KvError::InvalidKey { .. }) => ErrorKind::Validation,
            Self::Storage(KvError::Serialization { .. }) => ErrorKind::Deserialization,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Image(_) => ErrorKind::ImageProcessing,
            Self::FetchInFlight { .. } | Self::StalePage { .. } => ErrorKind::InvalidState,
            Self::IndexOutOfRange { .. } | Self::MissingProductId { .. } | Self::Config(_) => {
                ErrorKind::Validation
            }
            Self::Closed => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        self.kind().default_severity()
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Whether re-issuing the same request can succeed. Nothing retries automatically.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_retryable(),
            Self::Storage(e) => e.is_retryable(),
            Self::FetchInFlight { .. } => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind() {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Storage => "Unable to save your favorites. Please try again.".into(),
            ErrorKind::Deserialization => {
                "The catalog returned data we could not read. Please try again later.".into()
            }
            ErrorKind::ImageProcessing => "Unable to load this image.".into(),
            ErrorKind::Validation | ErrorKind::InvalidState => self.to_string(),
            ErrorKind::Internal => {
                "An unexpected error occurred. Please restart the app.".into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StorageErrorCode;

    fn status(status: u16) -> HttpError {
        HttpError::HttpStatus {
            status,
            message: String::new(),
            request_id: "req".into(),
            retryable: status >= 500,
        }
    }

    #[test]
    fn http_errors_map_to_kinds() {
        assert_eq!(CatalogError::from(status(404)).kind(), ErrorKind::NotFound);
        assert_eq!(CatalogError::from(status(503)).kind(), ErrorKind::Network);
        let timeout = HttpError::Timeout {
            timeout_ms: 10,
            request_id: "req".into(),
        };
        assert_eq!(CatalogError::from(timeout).kind(), ErrorKind::Timeout);
        let aborted = CatalogError::from(HttpError::Aborted {
            reason: "panicked".into(),
        });
        assert_eq!(aborted.code(), "INTERNAL_ERROR");
        assert!(aborted.is_retryable());
    }

    #[test]
    fn retryability_follows_source() {
        assert!(CatalogError::from(status(503)).is_retryable());
        assert!(!CatalogError::from(status(400)).is_retryable());
        assert!(CatalogError::from(KvError::storage(StorageErrorCode::Busy, "busy")).is_retryable());
        assert!(!CatalogError::Closed.is_retryable());
    }

    #[test]
    fn severity_defaults() {
        assert_eq!(ErrorKind::Network.default_severity(), ErrorSeverity::Transient);
        assert_eq!(ErrorKind::Internal.default_severity(), ErrorSeverity::Fatal);
        assert_eq!(CatalogError::Config("x".into()).severity(), ErrorSeverity::Permanent);
    }

    #[test]
    fn user_facing_message_hides_internals() {
        let msg = CatalogError::from(status(500)).user_facing_message();
        assert!(msg.contains("internet connection"));
        assert_eq!(CatalogError::from(status(500)).code(), "NETWORK_ERROR");
    }
}
