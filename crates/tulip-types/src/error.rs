//! Shared error types for tulip.

use thiserror::Error;

/// Errors raised while interpreting identities, addresses and configuration.
#[derive(Error, Debug)]
pub enum TulipError {
    /// An attestation kind string that is not one of the known kinds.
    #[error("Unknown attestation kind: {0}")]
    UnknownKind(String),

    /// An attestation value that does not fit its kind.
    #[error("Invalid {kind} value: {value}")]
    InvalidAttestation {
        /// The kind the value was parsed as.
        kind: String,
        /// The offending value.
        value: String,
    },

    /// A peer address that is not an onion address.
    #[error("Not an onion address: {0}")]
    InvalidAddress(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with TulipError.
pub type TulipResult<T> = Result<T, TulipError>;
