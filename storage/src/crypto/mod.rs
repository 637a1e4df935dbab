//! At-rest encryption for WAL records.
//!
//! Layers, leaf first: [`key_source`] resolves a locator to key bytes,
//! [`cipher`] seals payloads into self-describing [`envelope`]s, [`session`]
//! binds one resolved key to one cipher for the lifetime of a WAL writer or
//! reader, and [`provider`] picks the key source and cipher from configuration.

pub mod cipher;
pub mod envelope;
pub mod key_source;
pub mod key_table;
pub mod provider;
pub mod session;

pub use cipher::{CipherAlgorithm, CipherEngine};
pub use envelope::CryptoEnvelope;
pub use key_source::{
    provision_key_file, EnvKeySource, FileKeySource, KeyLocator, KeyMaterial, KeySource,
};
pub use key_table::KeyTable;
pub use provider::{CryptoService, ProviderRegistry};
pub use session::Session;

use cryptwal_core::error::{CryptwalError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key source unavailable: {0}")]
    KeySourceUnavailable(String),
    #[error("invalid key format: {0}")]
    KeyFormatInvalid(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("malformed envelope: {0}")]
    EnvelopeMalformed(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("unknown crypto provider: {0}")]
    UnknownProvider(String),
    #[error("unknown cipher algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("invalid crypto configuration: {0}")]
    InvalidConfig(String),
    #[error("crypto session is closed")]
    SessionClosed,
}

impl CryptwalError for CryptoError {
    fn error_code(&self) -> ErrorCode {
        match self {
            CryptoError::KeySourceUnavailable(_) => ErrorCode::Unavailable,
            CryptoError::KeyFormatInvalid(_) => ErrorCode::InvalidArgument,
            CryptoError::KeyNotFound(_) => ErrorCode::NotFound,
            CryptoError::AuthenticationFailed => ErrorCode::Unauthenticated,
            CryptoError::EnvelopeMalformed(_) => ErrorCode::DataLoss,
            CryptoError::EncryptionFailed(_) => ErrorCode::Internal,
            CryptoError::UnknownProvider(_) => ErrorCode::InvalidArgument,
            CryptoError::UnknownAlgorithm(_) => ErrorCode::InvalidArgument,
            CryptoError::InvalidConfig(_) => ErrorCode::InvalidArgument,
            CryptoError::SessionClosed => ErrorCode::Internal,
        }
    }
}

impl CryptoError {
    /// Errors that mean the stored bytes cannot be trusted, as opposed to
    /// errors about keys or configuration.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::AuthenticationFailed | CryptoError::EnvelopeMalformed(_)
        )
    }
}
