use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Property naming the crypto provider in flat cluster-style configuration.
pub const CRYPTO_SERVICE_PROPERTY: &str = "instance.crypto.service";
/// Namespace for provider-specific options, e.g. `instance.crypto.opts.key.uri`.
pub const CRYPTO_OPTS_PREFIX: &str = "instance.crypto.opts.";

pub const DEFAULT_CRYPTO_SERVICE: &str = "noop";
pub const DEFAULT_KEY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub wal_dir: String,
}

impl StorageConfig {
    /// Path of the log file `name` under `wal_dir`.
    pub fn wal_path(&self, name: &str) -> PathBuf {
        Path::new(&self.wal_dir).join(name)
    }
}

/// Crypto provider selection, resolved once when the WAL is opened.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CryptoConfig {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub cipher: Option<String>,
    #[serde(default)]
    pub key_uri: Option<String>,
    #[serde(default = "default_key_timeout_ms")]
    pub key_timeout_ms: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            cipher: None,
            key_uri: None,
            key_timeout_ms: DEFAULT_KEY_TIMEOUT_MS,
            extra: BTreeMap::new(),
        }
    }
}

impl CryptoConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn with_key_uri(mut self, key_uri: impl Into<String>) -> Self {
        self.key_uri = Some(key_uri.into());
        self
    }

    pub fn with_cipher(mut self, cipher: impl Into<String>) -> Self {
        self.cipher = Some(cipher.into());
        self
    }

    pub fn with_key_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.key_timeout_ms = timeout_ms;
        self
    }

    /// Build from flat `instance.crypto.*` properties. Keys outside that
    /// namespace are ignored; unrecognised options are kept in `extra`.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self, PropertyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();

        for (key, value) in properties {
            let key = key.as_ref();
            let value: String = value.into();

            if key == CRYPTO_SERVICE_PROPERTY {
                config.service = value;
                continue;
            }

            let Some(option) = key.strip_prefix(CRYPTO_OPTS_PREFIX) else {
                continue;
            };

            match option {
                "key.uri" => config.key_uri = Some(value),
                "cipher" => config.cipher = Some(value),
                "key.timeout.ms" => {
                    config.key_timeout_ms =
                        value
                            .trim()
                            .parse()
                            .map_err(|_| PropertyError::InvalidValue {
                                key: key.to_string(),
                                value: value.clone(),
                            })?;
                }
                other => {
                    config.extra.insert(other.to_string(), value);
                }
            }
        }

        Ok(config)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Layered load: `<dir>/default`, `<dir>/<RUN_MODE>` (optional), then
    /// `CRYPTWAL_*` environment variables (`__` separates nested keys).
    pub fn load_from(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let default_source = dir.join("default");
        let mode_source = dir.join(&run_mode);

        let builder = Config::builder()
            .add_source(File::with_name(&default_source.to_string_lossy()))
            .add_source(File::with_name(&mode_source.to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix("CRYPTWAL")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        tracing::debug!(
            run_mode = %run_mode,
            crypto_service = %config.crypto.service,
            "configuration loaded"
        );
        Ok(config)
    }
}

fn default_service() -> String {
    DEFAULT_CRYPTO_SERVICE.to_string()
}

fn default_key_timeout_ms() -> u64 {
    DEFAULT_KEY_TIMEOUT_MS
}
