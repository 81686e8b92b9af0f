//! Configuration types for the IPAM automation core
//!
//! The core consumes configuration; loading it (environment, files, secrets)
//! is the caller's concern.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Resource types whose data rarely changes and may be cached for longer
pub const REFERENCE_RESOURCE_TYPES: &[&str] = &[
    "dcim.manufacturers",
    "dcim.device-roles",
    "dcim.device-types",
    "dcim.platforms",
    "tenancy.tenants",
];

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote backend configuration
    pub backend: BackendConfig,

    /// Global dry-run flag: mutators log and return simulated results
    #[serde(default)]
    pub dry_run: bool,

    /// Cache layer settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Fingerprint metadata settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl ClientConfig {
    /// Create a configuration for the given backend with defaults elsewhere
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            dry_run: false,
            cache: CacheConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }

    /// Enable or disable dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.backend.validate()?;
        self.cache.validate()?;
        self.reconcile.validate()?;
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(BackendConfig::Memory)
    }
}

/// Remote backend configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// REST API over HTTP
    Http {
        /// Base URL of the remote system (e.g. "https://netbox.example.com")
        base_url: String,
        /// API token, sent as `Authorization: Token <token>`
        api_token: String,
        /// Request timeout in seconds
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        /// Page size for list requests
        #[serde(default = "default_page_size")]
        page_size: usize,
    },

    /// In-process fake of the remote system
    Memory,

    /// Custom backend
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl BackendConfig {
    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            BackendConfig::Http {
                base_url,
                api_token,
                timeout_secs,
                page_size,
            } => {
                if base_url.is_empty() {
                    return Err(crate::Error::config("Backend base URL cannot be empty"));
                }
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    return Err(crate::Error::config(format!(
                        "Backend base URL must use http or https: {}",
                        base_url
                    )));
                }
                if api_token.is_empty() {
                    return Err(crate::Error::config("Backend API token cannot be empty"));
                }
                if *timeout_secs == 0 {
                    return Err(crate::Error::config("Backend timeout must be > 0"));
                }
                if *page_size == 0 {
                    return Err(crate::Error::config("Backend page size must be > 0"));
                }
                Ok(())
            }
            BackendConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom backend factory cannot be empty"));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom backend config cannot be null"));
                }
                Ok(())
            }
            BackendConfig::Memory => Ok(()),
        }
    }

    /// Get the backend type name
    pub fn type_name(&self) -> &str {
        match self {
            BackendConfig::Http { .. } => "http",
            BackendConfig::Memory => "memory",
            BackendConfig::Custom { factory, .. } => factory,
        }
    }
}

// Keeps the API token out of logs
impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendConfig::Http {
                base_url,
                timeout_secs,
                page_size,
                ..
            } => f
                .debug_struct("Http")
                .field("base_url", base_url)
                .field("api_token", &"<REDACTED>")
                .field("timeout_secs", timeout_secs)
                .field("page_size", page_size)
                .finish(),
            BackendConfig::Memory => f.write_str("Memory"),
            BackendConfig::Custom { factory, .. } => f
                .debug_struct("Custom")
                .field("factory", factory)
                .finish_non_exhaustive(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    100
}

/// Cache layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether reads go through the cache at all
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// TTL for mutable data (seconds)
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// TTL for [`REFERENCE_RESOURCE_TYPES`] (seconds)
    #[serde(default = "default_reference_ttl_secs")]
    pub reference_ttl_secs: u64,

    /// Per resource type overrides, keyed by "domain.collection"
    #[serde(default)]
    pub ttl_overrides: HashMap<String, u64>,

    /// Upper bound on cached entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl CacheConfig {
    /// Resolve the TTL for a resource type: override, then reference data, then default
    pub fn ttl_for(&self, resource_type: &str) -> Duration {
        if let Some(secs) = self.ttl_overrides.get(resource_type) {
            return Duration::from_secs(*secs);
        }
        if REFERENCE_RESOURCE_TYPES.contains(&resource_type) {
            return Duration::from_secs(self.reference_ttl_secs);
        }
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Validate the cache configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.enabled && self.max_entries == 0 {
            return Err(crate::Error::config("Cache max_entries must be > 0 when enabled"));
        }
        Ok(())
    }

    /// Set a TTL override for one resource type
    pub fn with_ttl(mut self, resource_type: impl Into<String>, ttl_secs: u64) -> Self {
        self.ttl_overrides.insert(resource_type.into(), ttl_secs);
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            default_ttl_secs: default_ttl_secs(),
            reference_ttl_secs: default_reference_ttl_secs(),
            ttl_overrides: HashMap::new(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_reference_ttl_secs() -> u64 {
    3600
}

fn default_max_entries() -> usize {
    10_000
}

/// Where the reconciler keeps its bookkeeping on remote objects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Name of the free-form key/value bag on remote objects
    #[serde(default = "default_metadata_field")]
    pub metadata_field: String,

    /// Key holding the managed-fields hash
    #[serde(default = "default_fingerprint_key")]
    pub fingerprint_key: String,

    /// Key holding the writer's source tag
    #[serde(default = "default_source_key")]
    pub source_key: String,

    /// Key holding the last sync timestamp
    #[serde(default = "default_synced_at_key")]
    pub synced_at_key: String,

    /// Key holding the id of the last orchestration batch that wrote the object
    #[serde(default = "default_batch_key")]
    pub batch_key: String,

    /// Key holding the id of the orchestration batch that created the object
    #[serde(default = "default_origin_batch_key")]
    pub origin_batch_key: String,

    /// Source tag written alongside every fingerprint
    #[serde(default = "default_source_tag")]
    pub source_tag: String,
}

impl ReconcileConfig {
    /// Validate the reconcile configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        let keys = [
            &self.metadata_field,
            &self.fingerprint_key,
            &self.source_key,
            &self.synced_at_key,
            &self.batch_key,
            &self.origin_batch_key,
        ];
        if keys.iter().any(|k| k.is_empty()) {
            return Err(crate::Error::config("Reconcile metadata keys cannot be empty"));
        }
        Ok(())
    }

    /// Filter name that selects objects created by a batch on the remote
    pub fn origin_batch_filter(&self) -> String {
        format!("cf_{}", self.origin_batch_key)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            metadata_field: default_metadata_field(),
            fingerprint_key: default_fingerprint_key(),
            source_key: default_source_key(),
            synced_at_key: default_synced_at_key(),
            batch_key: default_batch_key(),
            origin_batch_key: default_origin_batch_key(),
            source_tag: default_source_tag(),
        }
    }
}

fn default_metadata_field() -> String {
    "custom_fields".to_string()
}

fn default_fingerprint_key() -> String {
    "sync_fields_hash".to_string()
}

fn default_source_key() -> String {
    "sync_source".to_string()
}

fn default_synced_at_key() -> String {
    "sync_last_synced".to_string()
}

fn default_batch_key() -> String {
    "sync_batch_id".to_string()
}

fn default_origin_batch_key() -> String {
    "sync_origin_batch".to_string()
}

fn default_source_tag() -> String {
    "ipam-sync".to_string()
}

/// Task broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerConfig {
    /// Durable JSON-file broker
    File {
        /// Path to the broker file
        path: String,
    },

    /// In-memory broker (not durable)
    #[default]
    Memory,

    /// Custom broker
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl BrokerConfig {
    /// Get the broker type name
    pub fn type_name(&self) -> &str {
        match self {
            BrokerConfig::File { .. } => "file",
            BrokerConfig::Memory => "memory",
            BrokerConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delay between broker polls when the queue is empty (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Whether workers execute writes (the task payload carries no confirm flag)
    #[serde(default = "default_confirm_writes")]
    pub confirm_writes: bool,

    /// How long finished tasks stay queryable through `status` (seconds)
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl WorkerConfig {
    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            confirm_writes: default_confirm_writes(),
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_confirm_writes() -> bool {
    true
}

fn default_retention_secs() -> u64 {
    86_400
}
