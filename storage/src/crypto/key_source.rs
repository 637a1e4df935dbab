use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cryptwal_core::fingerprint::fingerprint;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::CryptoError;

/// Width of the big-endian length prefix in front of a key file's key string.
pub const KEY_RECORD_PREFIX_LEN: usize = 2;

/// Where key material lives, e.g. `file:///etc/wal.key`, `env:WAL_KEY` or a
/// bare filesystem path. Debug output never shows the locator itself.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyLocator(String);

impl KeyLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `file` for `file:` URIs and bare paths; otherwise the URI scheme.
    pub fn scheme(&self) -> &str {
        match self.split() {
            Some((scheme, _)) => scheme,
            None => "file",
        }
    }

    /// The locator with its scheme stripped: a path for `file`, a variable
    /// name for `env`, a key id for anything else.
    pub fn target(&self) -> &str {
        match self.split() {
            Some((_, rest)) => rest.strip_prefix("//").unwrap_or(rest),
            None => &self.0,
        }
    }

    /// Safe-to-log identifier: scheme plus a digest of the full locator.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.scheme(), fingerprint(self.0.as_bytes()))
    }

    fn split(&self) -> Option<(&str, &str)> {
        let (scheme, rest) = self.0.split_once(':')?;
        // A single letter is a drive prefix, not a scheme.
        let is_scheme = scheme.len() > 1
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        is_scheme.then_some((scheme, rest))
    }
}

impl fmt::Debug for KeyLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyLocator").field(&self.fingerprint()).finish()
    }
}

impl From<&str> for KeyLocator {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for KeyLocator {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Raw symmetric key bytes. Zeroized on drop; `clone` hands off an
/// independent copy with its own zeroize-on-drop.
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: Zeroizing<Vec<u8>>,
}

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.bytes)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.bytes.len())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Resolves a locator to key bytes. Implementations may block on I/O; the
/// session layer runs them off the async runtime and bounds them with a
/// timeout.
pub trait KeySource: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, locator: &KeyLocator) -> Result<KeyMaterial, CryptoError>;
}

/// Reads a key file holding one `[u16 BE length][UTF-8 key string]` record.
///
/// The whole record, prefix included, is the key material: a 14-character
/// key string gives a 16-byte AES-128 key.
#[derive(Debug, Clone)]
pub struct FileKeySource {
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Default for FileKeySource {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(20),
        }
    }
}

impl FileKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry budget for transient read errors. Missing or unreadable files
    /// are never retried.
    pub fn with_retry(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    fn read_with_retry(&self, path: &Path) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            match fs::read(path) {
                Ok(bytes) => return Ok(Zeroizing::new(bytes)),
                Err(e) if is_transient(e.kind()) && attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient key file read error, retrying: {}",
                        e.kind()
                    );
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(CryptoError::KeySourceUnavailable(format!(
                        "cannot read key file: {}",
                        e.kind()
                    )))
                }
            }
        }
    }
}

impl KeySource for FileKeySource {
    fn name(&self) -> &str {
        "file"
    }

    fn resolve(&self, locator: &KeyLocator) -> Result<KeyMaterial, CryptoError> {
        if locator.scheme() != "file" {
            return Err(CryptoError::InvalidConfig(format!(
                "file key source cannot resolve '{}' locators",
                locator.scheme()
            )));
        }

        let record = self.read_with_retry(Path::new(locator.target()))?;
        decode_key_record(&record)?;
        Ok(KeyMaterial::from_slice(&record))
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// Encode a key string as a length-prefixed key record.
pub fn encode_key_record(key: &str) -> Result<Vec<u8>, CryptoError> {
    let len = u16::try_from(key.len()).map_err(|_| {
        CryptoError::KeyFormatInvalid(format!(
            "key string is {} bytes, limit is {}",
            key.len(),
            u16::MAX
        ))
    })?;

    let mut record = Vec::with_capacity(KEY_RECORD_PREFIX_LEN + key.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(key.as_bytes());
    Ok(record)
}

/// Validate a key record and return its key string bytes.
pub fn decode_key_record(record: &[u8]) -> Result<&[u8], CryptoError> {
    if record.len() < KEY_RECORD_PREFIX_LEN {
        return Err(CryptoError::KeyFormatInvalid(format!(
            "key record is {} bytes, shorter than its length prefix",
            record.len()
        )));
    }

    let (prefix, body) = record.split_at(KEY_RECORD_PREFIX_LEN);
    let declared = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    if declared != body.len() {
        return Err(CryptoError::KeyFormatInvalid(format!(
            "length prefix declares {} bytes but {} follow",
            declared,
            body.len()
        )));
    }

    std::str::from_utf8(body)
        .map_err(|_| CryptoError::KeyFormatInvalid("key string is not valid UTF-8".into()))?;
    Ok(body)
}

/// Replace whatever is at `path` with a single key record for `key`.
///
/// Delete, create, write, fsync, in that order, so repeated runs against the
/// same path always end with the same file.
pub fn provision_key_file(path: impl AsRef<Path>, key: &str) -> Result<PathBuf, CryptoError> {
    let path = path.as_ref();
    let record = Zeroizing::new(encode_key_record(key)?);
    let unavailable =
        |e: std::io::Error| CryptoError::KeySourceUnavailable(format!("key file: {}", e));

    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(unavailable(e)),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(unavailable)?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(unavailable)?;
    file.write_all(&record).map_err(unavailable)?;
    file.sync_all().map_err(unavailable)?;

    let locator = KeyLocator::new(path.to_string_lossy().into_owned());
    info!(locator = %locator.fingerprint(), "provisioned key file");
    Ok(path.to_path_buf())
}

/// Reads a base64-encoded key from an environment variable named by an
/// `env:NAME` locator.
#[derive(Debug, Clone, Default)]
pub struct EnvKeySource;

impl KeySource for EnvKeySource {
    fn name(&self) -> &str {
        "env"
    }

    fn resolve(&self, locator: &KeyLocator) -> Result<KeyMaterial, CryptoError> {
        if locator.scheme() != "env" {
            return Err(CryptoError::InvalidConfig(format!(
                "env key source cannot resolve '{}' locators",
                locator.scheme()
            )));
        }

        let encoded = Zeroizing::new(std::env::var(locator.target()).map_err(|_| {
            CryptoError::KeySourceUnavailable(format!(
                "environment variable for {} is not set",
                locator.fingerprint()
            ))
        })?);

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::KeyFormatInvalid("key is not valid base64".into()))?;
        Ok(KeyMaterial::new(decoded))
    }
}
