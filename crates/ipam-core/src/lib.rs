// # ipam-core
//
// Core library for safe, idempotent automation of a remote IPAM /
// network-documentation inventory.
//
// ## Architecture Overview
//
// - **ProxyClient**: Domain table + generic executor over any remote collection,
//   with a confirm gate, dry-run, and a read-through TTL cache
// - **Resolver**: Name/slug/ID to exactly one remote object
// - **Reconciler**: "ensure" semantics driven by a managed-field fingerprint
// - **Orchestrator**: Two-pass bulk plan/execute, dry-run report, rollback
// - **Tasks**: Background execution through a TaskBroker with progress and cancel
// - **BackendRegistry**: Plugin-based creation of backends and brokers
//
// ## Design Principles
//
// 1. **Explicit context**: One `ProxyClient` built at startup and passed down; no globals
// 2. **Safety first**: Every mutator takes `confirm`; nothing writes without it
// 3. **Idempotency**: Repeated runs with unchanged input issue no writes
// 4. **Plugin-Based**: Backends and brokers are registered, not hard-coded
// 5. **Library-First**: Transports and CLIs are thin callers of this crate

pub mod backend;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;
pub mod proxy;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod tasks;
pub mod traits;

// Re-export core types for convenience
pub use traits::{CollectionPath, Filters, RemoteBackend, Task, TaskBroker, TaskState};
pub use proxy::{Executor, Navigator, ProxyClient};
pub use reconciler::{Action, EnsureOutcome, EnsureRequest, Reconciler};
pub use resolver::{Identifier, Lookup, ResourceReference, Resolver};
pub use orchestrator::{Batch, BatchOperation, BatchResult, BatchSummary, Orchestrator};
pub use tasks::{TaskManager, TaskWorker};
pub use registry::BackendRegistry;
pub use config::{BackendConfig, BrokerConfig, CacheConfig, ClientConfig, ReconcileConfig, WorkerConfig};
pub use error::{Error, Result};
pub use backend::MemoryBackend;
pub use broker::{FileBroker, MemoryBroker};
