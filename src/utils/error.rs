//! The `error` module defines the error types shared across `memq`.
//!
//! Broker-level failures live in [`crate::broker::BrokerError`]; this module
//! wraps them together with configuration and serialization errors into a
//! single crate-wide [`Error`].

use thiserror::Error;

use crate::broker::BrokerError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error came from the broker connection rather than from the
    /// message itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Broker(e) if e.is_connectivity())
    }
}
