// # Backend Implementations
//
// In-process implementations of the RemoteBackend trait. The HTTP backend
// lives in its own crate (`ipam-backend-http`).

pub mod memory;

pub use memory::{MemoryBackend, MemoryBackendFactory};
