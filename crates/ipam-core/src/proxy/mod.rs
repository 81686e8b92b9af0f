//! Dynamic proxy client
//!
//! Two-level router over the remote API:
//!
//! ```text
//! ProxyClient ──domain("dcim")──▶ Navigator ──collection("sites")──▶ Executor
//!                                                                      │
//!                                    list/get ──▶ ResponseCache ──▶ RemoteBackend
//!                      create/update/delete ──▶ confirm gate ──▶ dry-run? ──▶ RemoteBackend
//!                                                                      └──▶ invalidate type
//! ```
//!
//! The client is an explicit context object: build it once at startup and
//! share it (`Arc<ProxyClient>`) with the reconciler, orchestrator and
//! workers. Nothing in the crate reaches for a global.

pub mod domain;
pub mod executor;

pub use domain::{ApiDomain, DomainTable};
pub use executor::Executor;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::ResponseCache;
use crate::config::{ClientConfig, ReconcileConfig};
use crate::error::{Error, Result};
use crate::traits::{CollectionPath, RemoteBackend};

/// First ID handed out to simulated (dry-run) creations
///
/// Far above anything a real inventory allocates, so simulated IDs are easy
/// to spot in logs.
pub const SIMULATED_ID_BASE: u64 = 1 << 48;

/// Entry point for all remote reads and writes
pub struct ProxyClient {
    backend: Arc<dyn RemoteBackend>,
    cache: Arc<ResponseCache>,
    domains: DomainTable,
    reconcile: ReconcileConfig,
    dry_run: bool,
    next_simulated_id: AtomicU64,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("backend", &self.backend.backend_name())
            .field("dry_run", &self.dry_run)
            .field("domains", &self.domains.names())
            .finish()
    }
}

impl ProxyClient {
    /// Create a client over an already-built backend
    pub fn new(backend: Arc<dyn RemoteBackend>, config: &ClientConfig) -> Result<Self> {
        config.cache.validate()?;
        config.reconcile.validate()?;

        if config.dry_run {
            tracing::warn!(
                "Proxy client running in DRY-RUN mode - no remote writes will be made"
            );
        }

        Ok(Self {
            backend,
            cache: Arc::new(ResponseCache::new(config.cache.clone())),
            domains: DomainTable::builtin(),
            reconcile: config.reconcile.clone(),
            dry_run: config.dry_run,
            next_simulated_id: AtomicU64::new(SIMULATED_ID_BASE),
        })
    }

    /// Replace the domain table (e.g. to add plugin domains)
    pub fn with_domains(mut self, domains: DomainTable) -> Self {
        self.domains = domains;
        self
    }

    /// Navigate to an API domain
    ///
    /// # Errors
    ///
    /// [`Error::UnknownDomain`] if `name` is not in the domain table.
    pub fn domain(&self, name: &str) -> Result<Navigator<'_>> {
        let domain = self
            .domains
            .get(name)
            .ok_or_else(|| Error::unknown_domain(name))?;
        Ok(Navigator {
            client: self,
            domain,
        })
    }

    /// Shortcut for `domain(d)?.collection(c)`
    pub fn executor(&self, domain: &str, collection: &str) -> Result<Executor<'_>> {
        self.domain(domain)?.collection(collection)
    }

    /// Executor for a [`CollectionPath`]
    pub fn collection(&self, path: &CollectionPath) -> Result<Executor<'_>> {
        self.executor(&path.domain, &path.collection)
    }

    /// Whether mutators are simulated
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// The shared cache layer
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Metadata key settings used by the reconciler
    pub fn reconcile_config(&self) -> &ReconcileConfig {
        &self.reconcile
    }

    /// The domain table
    pub fn domains(&self) -> &DomainTable {
        &self.domains
    }

    pub(crate) fn backend(&self) -> &dyn RemoteBackend {
        self.backend.as_ref()
    }

    pub(crate) fn next_simulated_id(&self) -> u64 {
        self.next_simulated_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A validated API domain, ready to hand out executors
#[derive(Debug, Clone, Copy)]
pub struct Navigator<'a> {
    client: &'a ProxyClient,
    domain: &'a ApiDomain,
}

impl<'a> Navigator<'a> {
    /// Domain name
    pub fn name(&self) -> &str {
        &self.domain.name
    }

    /// Commonly used collections of this domain (not exhaustive)
    pub fn known_collections(&self) -> &[String] {
        &self.domain.known_collections
    }

    /// Executor for one collection
    ///
    /// The collection is not checked against the remote here.
    pub fn collection(&self, name: &str) -> Result<Executor<'a>> {
        domain::validate_collection_name(name)?;
        Ok(Executor::new(
            self.client,
            CollectionPath::new(self.domain.name.clone(), name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn client() -> ProxyClient {
        ProxyClient::new(Arc::new(MemoryBackend::new()), &ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_unknown_domain_rejected() {
        let client = client();
        let err = client.domain("dns").unwrap_err();
        assert!(matches!(err, Error::UnknownDomain(ref d) if d == "dns"));
    }

    #[test]
    fn test_collection_is_not_validated_eagerly() {
        let client = client();
        let exec = client.executor("dcim", "brand-new-things").unwrap();
        assert_eq!(exec.path().resource_type(), "dcim.brand-new-things");
    }

    #[test]
    fn test_debug_does_not_panic() {
        let client = client();
        let debug_str = format!("{:?}", client);
        assert!(debug_str.contains("ProxyClient"));
        assert!(debug_str.contains("memory"));
    }
}
