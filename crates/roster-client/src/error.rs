//! Client error types for the Roster SDK

use roster_api::CodecError;
use roster_api::path::InvalidPath;
use roster_store::StoreError;

/// Error type for discovery and registration operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("store error: {0}")]
    Store(StoreError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no instances available for service '{0}'")]
    NoInstancesAvailable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("client closed")]
    Closed,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ClientError::StoreUnavailable(msg),
            StoreError::Config(msg) => ClientError::Config(msg),
            other => ClientError::Store(other),
        }
    }
}

impl From<InvalidPath> for ClientError {
    fn from(err: InvalidPath) -> Self {
        ClientError::Store(StoreError::InvalidPath(err))
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
