//! Store configuration.
//!
//! [`SyncSettings`] holds the plain settings and can be loaded from a TOML
//! file. [`StoreConfig`] wraps them together with the code-level pieces
//! (registered types, custom stores, conflict resolver).

use crate::local::{FileLocalStore, LocalStore, MemoryLocalStore};
use crate::mapping::RecordMapping;
use crate::metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore};
use crate::registry::TypeRegistry;
use crate::resolver::{ConflictResolver, RejectResolver};
use objsync_core::RetryPolicy;
use objsync_types::hash::short_hash;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Length of a store identifier.
pub const STORE_IDENTIFIER_LEN: usize = 32;

/// Which remote database a store syncs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Per-user database. Objects belong to the signed-in user.
    #[default]
    Private,
    /// Shared database. Objects have no owning user.
    Public,
}

impl Scope {
    /// Stable name, matching the TOML form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
        }
    }
}

/// Plain store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncSettings {
    /// Remote container name (default: "default").
    #[serde(default = "default_container")]
    pub container: String,
    /// Remote database scope (default: private).
    #[serde(default)]
    pub scope: Scope,
    /// Seconds between up-sync attempts (default: 5).
    #[serde(default = "default_up_sync_interval_secs")]
    pub up_sync_interval_secs: u64,
    /// Seconds between down-sync attempts (default: 60).
    #[serde(default = "default_down_sync_interval_secs")]
    pub down_sync_interval_secs: u64,
    /// Maximum records per up-sync batch and per fetched page (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Ceiling for a single retry delay in seconds (default: 3600).
    #[serde(default = "default_max_retry_interval_secs")]
    pub max_retry_interval_secs: u64,
    /// Unit multiplied by the squared failure count, in seconds (default: 1).
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    /// Directory for file-backed stores. In-memory stores when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

// Default value functions
fn default_container() -> String {
    "default".to_string()
}

fn default_up_sync_interval_secs() -> u64 {
    5
}

fn default_down_sync_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retry_interval_secs() -> u64 {
    60 * 60 // 1 hour
}

fn default_retry_base_delay_secs() -> u64 {
    1
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            container: default_container(),
            scope: Scope::default(),
            up_sync_interval_secs: default_up_sync_interval_secs(),
            down_sync_interval_secs: default_down_sync_interval_secs(),
            batch_size: default_batch_size(),
            max_retry_interval_secs: default_max_retry_interval_secs(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            data_dir: None,
        }
    }
}

impl SyncSettings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or holds
    /// invalid values.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the sync loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.up_sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("up_sync_interval_secs must be > 0".into()));
        }
        if self.down_sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("down_sync_interval_secs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        Ok(())
    }

    /// Identifier of the store these settings open.
    pub fn identifier(&self) -> String {
        store_identifier(&self.container, self.scope)
    }

    /// Up-sync timer period.
    pub fn up_sync_interval(&self) -> Duration {
        Duration::from_secs(self.up_sync_interval_secs)
    }

    /// Down-sync timer period.
    pub fn down_sync_interval(&self) -> Duration {
        Duration::from_secs(self.down_sync_interval_secs)
    }

    /// Backoff policy for failed writes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_base_delay_secs),
            Duration::from_secs(self.max_retry_interval_secs),
        )
    }
}

/// Derive the identifier shared by every store opened for the same
/// container and scope.
pub fn store_identifier(container: &str, scope: Scope) -> String {
    let key = format!("{}{}", container, scope.as_str());
    short_hash(key.as_bytes(), STORE_IDENTIFIER_LEN)
}

/// Full store configuration.
#[derive(Clone)]
pub struct StoreConfig {
    /// Plain settings.
    pub settings: SyncSettings,
    /// Registered object types.
    pub types: TypeRegistry,
    /// Custom local store. Derived from `settings.data_dir` when absent.
    pub local_store: Option<Arc<dyn LocalStore>>,
    /// Custom metadata store. Derived from `settings.data_dir` when absent.
    pub metadata_store: Option<Arc<dyn MetadataStore>>,
    /// Conflict resolver (default: [`RejectResolver`]).
    pub resolver: Arc<dyn ConflictResolver>,
    /// Whether to run the periodic sync task (default: true).
    pub background_sync: bool,
}

impl StoreConfig {
    /// Configuration with the given settings and no registered types.
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            types: TypeRegistry::new(),
            local_store: None,
            metadata_store: None,
            resolver: Arc::new(RejectResolver),
            background_sync: true,
        }
    }

    /// Register `T` under `name` with the default JSON record mapping.
    pub fn with_type<T: DeserializeOwned + 'static>(mut self, name: &str) -> Self {
        self.types.register::<T>(name);
        self
    }

    /// Register `T` under `name` with a custom record mapping.
    pub fn with_type_mapping<T: DeserializeOwned + 'static>(
        mut self,
        name: &str,
        mapping: impl RecordMapping + 'static,
    ) -> Self {
        self.types.register_with_mapping::<T>(name, mapping);
        self
    }

    /// Use a custom local store.
    pub fn with_local_store(mut self, store: impl LocalStore + 'static) -> Self {
        self.local_store = Some(Arc::new(store));
        self
    }

    /// Use a custom metadata store.
    pub fn with_metadata_store(mut self, store: impl MetadataStore + 'static) -> Self {
        self.metadata_store = Some(Arc::new(store));
        self
    }

    /// Use a custom conflict resolver.
    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Enable or disable the periodic sync task.
    pub fn with_background_sync(mut self, enabled: bool) -> Self {
        self.background_sync = enabled;
        self
    }

    /// Identifier of the store this configuration opens.
    pub fn identifier(&self) -> String {
        self.settings.identifier()
    }

    /// Local and metadata stores to open the store with.
    pub(crate) fn stores(&self) -> (Arc<dyn LocalStore>, Arc<dyn MetadataStore>) {
        let dir = self
            .settings
            .data_dir
            .as_ref()
            .map(|root| root.join(self.identifier()));

        let local: Arc<dyn LocalStore> = match (&self.local_store, &dir) {
            (Some(store), _) => Arc::clone(store),
            (None, Some(dir)) => Arc::new(FileLocalStore::new(dir)),
            (None, None) => Arc::new(MemoryLocalStore::new()),
        };
        let metadata: Arc<dyn MetadataStore> = match (&self.metadata_store, &dir) {
            (Some(store), _) => Arc::clone(store),
            (None, Some(dir)) => Arc::new(FileMetadataStore::new(dir)),
            (None, None) => Arc::new(MemoryMetadataStore::new()),
        };
        (local, metadata)
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("settings", &self.settings)
            .field("types", &self.types)
            .field("custom_local_store", &self.local_store.is_some())
            .field("custom_metadata_store", &self.metadata_store.is_some())
            .field("background_sync", &self.background_sync)
            .finish()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Failed to parse inline TOML.
    #[error("failed to parse config: {0}")]
    Syntax(#[from] toml::de::Error),
    /// A setting has an unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),
}
