//! Core traits for the IPAM automation core
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`RemoteBackend`]: Resource-oriented access to the remote inventory
//! - [`TaskBroker`]: Durable queue and status store for background runs

pub mod backend;
pub mod task_broker;

pub use backend::{BackendFactory, CollectionPath, Filters, RemoteBackend};
pub use task_broker::{Task, TaskBroker, TaskBrokerFactory, TaskProgress, TaskState};
