use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cryptwal_core::config::CryptoConfig;

use super::cipher::CipherAlgorithm;
use super::key_source::{EnvKeySource, FileKeySource, KeyLocator, KeySource};
use super::key_table::KeyTable;
use super::session::Session;
use super::CryptoError;

pub const NOOP_PROVIDER: &str = "noop";
pub const LOCAL_FILE_PROVIDER: &str = "local-file";
pub const ENV_PROVIDER: &str = "env";

pub const DEFAULT_CIPHER: CipherAlgorithm = CipherAlgorithm::Aes128Gcm;

/// A configured provider: which key, from where, under which cipher.
///
/// Each [`CryptoService::open_session`] resolves the key again; nothing is
/// cached between sessions.
#[derive(Clone)]
pub struct CryptoService {
    name: String,
    source: Option<Arc<dyn KeySource>>,
    locator: Option<KeyLocator>,
    algorithm: CipherAlgorithm,
    timeout: Duration,
}

impl CryptoService {
    pub fn noop() -> Self {
        Self {
            name: NOOP_PROVIDER.to_string(),
            source: None,
            locator: None,
            algorithm: CipherAlgorithm::Plaintext,
            timeout: Duration::ZERO,
        }
    }

    /// A keyed provider. `algorithm` must need a key; use [`CryptoService::noop`]
    /// for the plaintext case.
    pub fn keyed(
        name: impl Into<String>,
        source: Arc<dyn KeySource>,
        locator: KeyLocator,
        algorithm: CipherAlgorithm,
        timeout: Duration,
    ) -> Result<Self, CryptoError> {
        let name = name.into();
        if !algorithm.requires_key() {
            return Err(CryptoError::InvalidConfig(format!(
                "provider '{}' cannot use the {} cipher",
                name, algorithm
            )));
        }

        Ok(Self {
            name,
            source: Some(source),
            locator: Some(locator),
            algorithm,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn locator(&self) -> Option<&KeyLocator> {
        self.locator.as_ref()
    }

    pub async fn open_session(&self) -> Result<Session, CryptoError> {
        match (&self.source, &self.locator) {
            (Some(source), Some(locator)) => {
                Session::open(
                    self.name.clone(),
                    source.clone(),
                    locator.clone(),
                    self.algorithm,
                    self.timeout,
                )
                .await
            }
            _ => Ok(Session::plaintext(self.name.clone())),
        }
    }
}

impl std::fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoService")
            .field("name", &self.name)
            .field("source", &self.source.as_ref().map(|s| s.name().to_string()))
            .field("locator", &self.locator)
            .field("algorithm", &self.algorithm)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub type ProviderFactory =
    Arc<dyn Fn(&CryptoConfig) -> Result<CryptoService, CryptoError> + Send + Sync>;

/// Provider name → factory. Selection happens once, from configuration.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// `noop`, `local-file` and `env`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(NOOP_PROVIDER, |_config| Ok(CryptoService::noop()));
        registry.register_source(LOCAL_FILE_PROVIDER, Arc::new(FileKeySource::new()));
        registry.register_source(ENV_PROVIDER, Arc::new(EnvKeySource));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&CryptoConfig) -> Result<CryptoService, CryptoError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register a keyed provider backed by `source`, reading `key_uri`,
    /// `cipher` and `key_timeout_ms` from the config.
    pub fn register_source(&mut self, name: impl Into<String>, source: Arc<dyn KeySource>) {
        let name = name.into();
        let provider_name = name.clone();
        self.register(name, move |config| {
            keyed_from_config(&provider_name, source.clone(), config)
        });
    }

    /// Register a provider that resolves keys through a shared key table.
    /// Every session open reloads its key into the table.
    pub fn register_key_table(&mut self, name: impl Into<String>, table: Arc<KeyTable>) {
        self.register_source(name, table);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(&self, config: &CryptoConfig) -> Result<CryptoService, CryptoError> {
        let factory = self
            .factories
            .get(config.service.as_str())
            .ok_or_else(|| CryptoError::UnknownProvider(config.service.clone()))?;
        factory(config)
    }
}

fn keyed_from_config(
    name: &str,
    source: Arc<dyn KeySource>,
    config: &CryptoConfig,
) -> Result<CryptoService, CryptoError> {
    let key_uri = config.key_uri.as_deref().ok_or_else(|| {
        CryptoError::InvalidConfig(format!("provider '{}' requires key_uri", name))
    })?;

    let algorithm = match config.cipher.as_deref() {
        Some(cipher) => cipher.parse()?,
        None => DEFAULT_CIPHER,
    };

    CryptoService::keyed(
        name,
        source,
        KeyLocator::new(key_uri),
        algorithm,
        Duration::from_millis(config.key_timeout_ms),
    )
}
