//! Error types for the Vast.ai backend.

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;

/// Errors raised by the Vast.ai backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VastBackendError {
    /// Raised when the backend configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when the HTTP request cannot be sent or its body read.
    #[error("{action} request failed: {message}")]
    Transport {
        /// Operation being attempted.
        action: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when the API answers with a non-success status.
    #[error("{action} rejected with HTTP {status}: {message}")]
    Api {
        /// Operation being attempted.
        action: String,
        /// HTTP status code.
        status: u16,
        /// Response body returned by the API.
        message: String,
    },
    /// Raised when a response body does not match the expected shape.
    #[error("unexpected {action} response: {message}")]
    Decode {
        /// Operation being attempted.
        action: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the marketplace declines to rent an offer.
    #[error("creating an instance from offer {offer_id} failed: {message}")]
    CreateRejected {
        /// Offer that was requested.
        offer_id: u64,
        /// Message returned by the marketplace.
        message: String,
    },
    /// Raised when requested logs never become available for download.
    #[error("logs for instance {instance_id} were not available after {attempts} attempts")]
    LogsUnavailable {
        /// Instance whose logs were requested.
        instance_id: u64,
        /// Download attempts made.
        attempts: u32,
    },
}

impl From<BackendError> for VastBackendError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for VastBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
