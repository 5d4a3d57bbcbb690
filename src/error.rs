//! Error taxonomy for the collector.
//!
//! Per-record decode problems stay inside [`crate::crypto::CryptoError`] and are
//! recovered where they occur; everything in [`CollectorError`] crosses a module
//! boundary. Transport failures are carried as strings so the fetch engine can
//! requeue work without holding client-specific error types.

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("credential store unavailable: {0}")]
    CredentialsUnavailable(String),

    #[error("request failed with status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("malformed response: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),
}
