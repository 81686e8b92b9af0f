//! Plugin-based backend registry
//!
//! Remote backends and task brokers are registered at runtime by name, so
//! binaries pick implementations from configuration instead of if-else
//! chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ipam_core::registry::BackendRegistry;
//! use ipam_core::config::BackendConfig;
//!
//! let registry = BackendRegistry::with_builtins();
//! ipam_backend_http::register(&registry);
//!
//! let backend = registry.create_backend(&BackendConfig::Http { .. })?;
//! ```
//!
//! ## Registration
//!
//! Backend crates expose a `register` function:
//!
//! ```rust,ignore
//! pub fn register(registry: &BackendRegistry) {
//!     registry.register_backend("http", Box::new(HttpBackendFactory));
//! }
//! ```

use crate::broker::{FileBrokerFactory, MemoryBrokerFactory};
use crate::backend::MemoryBackendFactory;
use crate::config::{BackendConfig, BrokerConfig};
use crate::error::{Error, Result};
use crate::traits::{BackendFactory, RemoteBackend, TaskBroker, TaskBrokerFactory};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Registry of backend and broker factories
///
/// ## Thread Safety
///
/// Interior mutability with RwLock: concurrent reads, exclusive writes.
/// The lock is never held across an await.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Box<dyn BackendFactory>>>,
    brokers: RwLock<HashMap<String, Arc<dyn TaskBrokerFactory>>>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-crate implementations (`memory` backend,
    /// `memory` and `file` brokers)
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_backend("memory", Box::new(MemoryBackendFactory));
        registry.register_broker("memory", Box::new(MemoryBrokerFactory));
        registry.register_broker("file", Box::new(FileBrokerFactory));
        registry
    }

    /// Register a remote backend factory
    ///
    /// # Parameters
    ///
    /// - `name`: Backend type name (e.g., "http", "memory")
    /// - `factory`: Factory object for creating backend instances
    pub fn register_backend(&self, name: impl Into<String>, factory: Box<dyn BackendFactory>) {
        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        backends.insert(name.into(), factory);
    }

    /// Register a task broker factory
    pub fn register_broker(&self, name: impl Into<String>, factory: Box<dyn TaskBrokerFactory>) {
        let mut brokers = self.brokers.write().unwrap_or_else(PoisonError::into_inner);
        brokers.insert(name.into(), Arc::from(factory));
    }

    /// Create a remote backend from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn RemoteBackend>)`: Created backend instance
    /// - `Err(Error::Config)`: If the type is not registered or creation fails
    pub fn create_backend(&self, config: &BackendConfig) -> Result<Arc<dyn RemoteBackend>> {
        config.validate()?;
        let backend_type = config.type_name();
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);

        let factory = backends
            .get(backend_type)
            .ok_or_else(|| Error::config(format!("Unknown backend type: {}", backend_type)))?;

        factory.create(config)
    }

    /// Create a task broker from configuration
    pub async fn create_broker(&self, config: &BrokerConfig) -> Result<Arc<dyn TaskBroker>> {
        let broker_type = config.type_name();
        let factory = {
            let brokers = self.brokers.read().unwrap_or_else(PoisonError::into_inner);
            brokers
                .get(broker_type)
                .ok_or_else(|| Error::config(format!("Unknown broker type: {}", broker_type)))?
                .clone()
        };

        factory.create(config).await
    }

    /// List all registered backend types
    pub fn list_backends(&self) -> Vec<String> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// List all registered broker types
    pub fn list_brokers(&self) -> Vec<String> {
        let brokers = self.brokers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = brokers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend type is registered
    pub fn has_backend(&self, name: &str) -> bool {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends.contains_key(name)
    }

    /// Check if a broker type is registered
    pub fn has_broker(&self, name: &str) -> bool {
        let brokers = self.brokers.read().unwrap_or_else(PoisonError::into_inner);
        brokers.contains_key(name)
    }
}
