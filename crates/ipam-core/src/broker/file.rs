// # File Broker
//
// JSON-file implementation of TaskBroker, shared by a submitting process and
// a worker process on the same host.
//
// ## Durability
//
// - Atomic writes: new state goes to a uniquely named temp file in the same
//   directory, then is renamed over
// - Backup: the previous file is copied to `.backup` before every write
// - Corruption recovery: an unparseable file falls back to the backup
//
// ## Sharing
//
// Every call re-reads the file, so `status()` in one process sees progress
// published by a worker in another. Each read-modify-write holds an
// exclusive advisory lock on a sibling `.lock` file, so writers in different
// processes (or different instances in one process) never lose each other's
// updates. Readers take no lock; the rename makes every write visible whole.
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "state": {
//     "tasks": { "<task id>": { "task": {..}, "payload": {..}, "cancel_requested": false } },
//     "queue": ["<task id>"]
//   }
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::io::Write;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

use super::BrokerState;
use crate::Error;
use crate::config::BrokerConfig;
use crate::traits::{Task, TaskBroker, TaskBrokerFactory};

/// Broker file format version
const BROKER_FILE_VERSION: &str = "1.0";

/// Serializable broker file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct BrokerFileFormat {
    version: String,
    state: BrokerState,
}

/// File-backed broker with crash recovery
///
/// # Example
///
/// ```rust,no_run
/// use ipam_core::broker::FileBroker;
/// use ipam_core::traits::TaskBroker;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let broker = FileBroker::new("/var/lib/ipam/tasks.json").await?;
///     broker.ping().await?;
///     for task in broker.list().await? {
///         println!("{} {:?}", task.task_id, task.state);
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FileBroker {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileBroker {
    /// Open (or create) a broker file
    ///
    /// Creates parent directories, and restores the file from its backup if
    /// it is corrupted.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create broker directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let state = Self::load_state_with_recovery(&path).await?;
        tracing::debug!("Opened broker file {}: {} tasks", path.display(), state.len());

        Ok(Self {
            path,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Load state, falling back to the backup on corruption
    async fn load_state_with_recovery(path: &Path) -> Result<BrokerState, Error> {
        match Self::load_state(path).await {
            Ok(state) => Ok(state),
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Broker file {} appears corrupted: {}. Attempting recovery from backup.",
                    path.display(),
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with an empty queue.");
                    return Ok(BrokerState::default());
                }

                match Self::load_state(&backup_path).await {
                    Ok(state) => {
                        tracing::info!("Recovered broker state from backup: {} tasks", state.len());
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore broker file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(state)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also corrupted: {}. Starting with an empty queue.",
                            backup_err
                        );
                        Ok(BrokerState::default())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Load state from a file; a missing file is an empty queue
    async fn load_state(path: &Path) -> Result<BrokerState, Error> {
        if !path.exists() {
            return Ok(BrokerState::default());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::broker(format!("Failed to read broker file {}: {}", path.display(), e))
        })?;

        let file: BrokerFileFormat = serde_json::from_str(&content)?;
        if file.version != BROKER_FILE_VERSION {
            tracing::warn!(
                "Broker file version mismatch: expected {}, got {}. Attempting to load anyway.",
                BROKER_FILE_VERSION,
                file.version
            );
        }
        Ok(file.state)
    }

    /// Write state atomically, keeping the previous file as backup
    async fn write_state(&self, state: &BrokerState) -> Result<(), Error> {
        let file = BrokerFileFormat {
            version: BROKER_FILE_VERSION.to_string(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || Self::replace_file(&path, json.as_bytes()))
            .await
            .map_err(|e| Error::broker(format!("Broker write task failed: {}", e)))??;

        tracing::trace!("Broker state written to {}", self.path.display());
        Ok(())
    }

    fn replace_file(path: &Path, contents: &[u8]) -> Result<(), Error> {
        let dir = Self::directory(path);
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            Error::broker(format!("Failed to create temp file in {}: {}", dir.display(), e))
        })?;
        temp.write_all(contents)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| {
                Error::broker(format!(
                    "Failed to write temp file {}: {}",
                    temp.path().display(),
                    e
                ))
            })?;

        if path.exists() {
            if let Err(e) = std::fs::copy(path, Self::backup_path(path)) {
                tracing::warn!("Failed to create broker backup: {}", e);
            }
        }

        temp.persist(path).map_err(|e| {
            Error::broker(format!(
                "Failed to move temp file over {}: {}",
                path.display(),
                e.error
            ))
        })?;
        Ok(())
    }

    /// Take the cross-process write lock; released when the file is dropped
    async fn lock_exclusive(&self) -> Result<std::fs::File, Error> {
        let lock_path = Self::lock_path(&self.path);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            FileExt::lock_exclusive(&file)?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| Error::broker(format!("Broker lock task failed: {}", e)))?
        .map_err(|e| {
            Error::broker(format!(
                "Failed to lock broker file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Read-modify-write under the in-process and the cross-process lock
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut BrokerState) -> Result<R, Error> + Send,
    ) -> Result<R, Error> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_exclusive().await?;
        let mut state = Self::load_state_with_recovery(&self.path).await?;
        let out = f(&mut state)?;
        self.write_state(&state).await?;
        Ok(out)
    }

    async fn read(&self) -> Result<BrokerState, Error> {
        let _guard = self.lock.lock().await;
        Self::load_state_with_recovery(&self.path).await
    }

    fn directory(path: &Path) -> &Path {
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut lock = path.to_path_buf();
        lock.set_extension("lock");
        lock
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl TaskBroker for FileBroker {
    async fn ping(&self) -> Result<(), Error> {
        let parent = Self::directory(&self.path);
        if !parent.is_dir() {
            return Err(Error::broker(format!(
                "broker directory {} is missing",
                parent.display()
            )));
        }
        self.read().await.map(|_| ())
    }

    async fn enqueue(&self, task: &Task, payload: &Value) -> Result<(), Error> {
        self.mutate(|state| state.enqueue(task, payload)).await
    }

    async fn claim_next(&self) -> Result<Option<(Task, Value)>, Error> {
        self.mutate(|state| Ok(state.claim_next())).await
    }

    async fn save(&self, task: &Task) -> Result<(), Error> {
        self.mutate(|state| state.save(task)).await
    }

    async fn load(&self, task_id: &str) -> Result<Option<Task>, Error> {
        Ok(self.read().await?.load(task_id))
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Option<Task>, Error> {
        self.mutate(|state| Ok(state.request_cancel(task_id))).await
    }

    async fn is_cancel_requested(&self, task_id: &str) -> Result<bool, Error> {
        Ok(self.read().await?.is_cancel_requested(task_id))
    }

    async fn list(&self) -> Result<Vec<Task>, Error> {
        Ok(self.read().await?.list())
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, Error> {
        self.mutate(|state| Ok(state.purge_finished(cutoff))).await
    }
}

/// Factory for creating file brokers
pub struct FileBrokerFactory;

#[async_trait]
impl TaskBrokerFactory for FileBrokerFactory {
    async fn create(&self, config: &BrokerConfig) -> Result<Arc<dyn TaskBroker>, Error> {
        match config {
            BrokerConfig::File { path } => Ok(Arc::new(FileBroker::new(path).await?)),
            other => Err(Error::config(format!(
                "Invalid config type for FileBrokerFactory: {}",
                other.type_name()
            ))),
        }
    }
}
