use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::cipher::{CipherAlgorithm, CipherEngine};
use super::envelope::CryptoEnvelope;
use super::key_source::{KeyLocator, KeySource};
use super::CryptoError;

/// One resolved key bound to one cipher, for the lifetime of a WAL writer or
/// reader. The key is zeroized on [`Session::close`] or drop, whichever
/// comes first.
#[derive(Debug)]
pub struct Session {
    provider: String,
    algorithm: CipherAlgorithm,
    engine: Option<CipherEngine>,
}

impl Session {
    /// Resolve the key behind `locator` and bind it to `algorithm`.
    ///
    /// Resolution runs on the blocking pool and is abandoned after `timeout`;
    /// a timeout fails the open with `KeySourceUnavailable`. Nothing is kept
    /// when the open fails.
    pub async fn open(
        provider: impl Into<String>,
        source: Arc<dyn KeySource>,
        locator: KeyLocator,
        algorithm: CipherAlgorithm,
        timeout: Duration,
    ) -> Result<Self, CryptoError> {
        let provider = provider.into();
        if !algorithm.requires_key() {
            return Ok(Self::plaintext(provider));
        }

        let fingerprint = locator.fingerprint();
        let resolve = tokio::task::spawn_blocking(move || source.resolve(&locator));

        let key = match tokio::time::timeout(timeout, resolve).await {
            Ok(Ok(resolved)) => resolved?,
            Ok(Err(join_err)) => {
                return Err(CryptoError::KeySourceUnavailable(format!(
                    "key resolution aborted: {}",
                    join_err
                )))
            }
            Err(_) => {
                return Err(CryptoError::KeySourceUnavailable(format!(
                    "key resolution timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        };

        let engine = CipherEngine::new(algorithm, &key)?;
        info!(
            provider = %provider,
            %algorithm,
            locator = %fingerprint,
            key = %key.fingerprint(),
            "crypto session opened"
        );

        Ok(Self {
            provider,
            algorithm,
            engine: Some(engine),
        })
    }

    /// Session for the unencrypted control case; needs no key.
    pub fn plaintext(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            algorithm: CipherAlgorithm::Plaintext,
            engine: Some(CipherEngine::plaintext()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    /// Seal a record into envelope bytes.
    pub fn encrypt_record(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let engine = self.engine.as_ref().ok_or(CryptoError::SessionClosed)?;
        Ok(engine.encrypt(plaintext)?.to_bytes())
    }

    /// Parse and open envelope bytes written by [`Session::encrypt_record`].
    pub fn decrypt_record(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let engine = self.engine.as_ref().ok_or(CryptoError::SessionClosed)?;
        let envelope = CryptoEnvelope::from_bytes(envelope)?;
        engine.decrypt(&envelope)
    }

    /// Drop the cipher (and with it the key schedule). Safe to call twice.
    pub fn close(&mut self) {
        if self.engine.take().is_some() {
            debug!(provider = %self.provider, "crypto session closed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
