mod acme_client;
mod bundle;
mod config;
mod domain_set;
mod order_manager;
mod retry;
mod secret;

pub use acme_client::*;
pub use bundle::*;
pub use config::*;
pub use domain_set::*;
pub use order_manager::*;
pub use secret::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcmeError {
    #[error("Invalid Domain: {0}")]
    InvalidDomain(String),
    #[error("Invalid Config: {0}")]
    InvalidConfig(String),
    #[error("Rate Limited: {0}")]
    RateLimited(String),
    #[error("Bad Nonce: {0}")]
    BadNonce(String),
    #[error("Network Error: {0}")]
    Network(String),
    #[error("Protocol Error: {0}")]
    Protocol(String),
    #[error("Validation Rejected: {0}")]
    ValidationRejected(String),
    #[error("Finalize Rejected: {0}")]
    FinalizeRejected(String),
    #[error("Retries Exhausted: {0}")]
    RetriesExhausted(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Order Cancelled")]
    Cancelled,
    #[error("Crypto Error: {0}")]
    Crypto(String),
    #[error("Certificate Error: {0}")]
    Certificate(String),
    #[error("IO Error: {0}")]
    IoError(String),
}

impl AcmeError {
    /// Transient failures are retried inside a bounded backoff loop, everything
    /// else fails the current attempt immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AcmeError::RateLimited(_) | AcmeError::BadNonce(_) | AcmeError::Network(_)
        )
    }
}

impl From<openssl::error::ErrorStack> for AcmeError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        AcmeError::Crypto(e.to_string())
    }
}

impl From<serde_json::Error> for AcmeError {
    fn from(e: serde_json::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

pub type AcmeResult<T> = std::result::Result<T, AcmeError>;
