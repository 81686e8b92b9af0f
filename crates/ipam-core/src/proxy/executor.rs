//! Read/write access to one remote collection
//!
//! Every mutator checks `confirm` first and refuses without touching the
//! network. Dry-run short-circuits after that check and before the backend
//! call, returning a result shaped like the real one.

use serde_json::{Value, json};
use tracing::{debug, info};

use super::ProxyClient;
use crate::cache::{list_key, object_key};
use crate::error::{Error, Result};
use crate::traits::{CollectionPath, Filters};

/// Executor bound to one `(domain, collection)` pair
#[derive(Debug, Clone)]
pub struct Executor<'a> {
    client: &'a ProxyClient,
    path: CollectionPath,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(client: &'a ProxyClient, path: CollectionPath) -> Self {
        Self { client, path }
    }

    /// The collection this executor targets
    pub fn path(&self) -> &CollectionPath {
        &self.path
    }

    /// List objects matching `filters` (read-through cache)
    pub async fn list(&self, filters: &Filters) -> Result<Vec<Value>> {
        let resource_type = self.path.resource_type();
        let key = list_key(&resource_type, filters);
        let backend = self.client.backend();
        let path = &self.path;

        let value = self
            .client
            .cache()
            .read_through(&key, &resource_type, async {
                let items = backend.list(path, filters).await?;
                Ok(Value::Array(items))
            })
            .await?;

        match value {
            Value::Array(items) => Ok(items),
            other => Err(Error::Other(format!(
                "cached list for {} is not an array: {}",
                key, other
            ))),
        }
    }

    /// Fetch one object by ID (read-through cache)
    pub async fn get(&self, id: u64) -> Result<Value> {
        let resource_type = self.path.resource_type();
        let key = object_key(&resource_type, id);
        let backend = self.client.backend();
        let path = &self.path;

        self.client
            .cache()
            .read_through(&key, &resource_type, async { backend.get(path, id).await })
            .await
    }

    /// Create an object
    ///
    /// # Errors
    ///
    /// - [`Error::ConfirmationRequired`] if `confirm` is false (no network call)
    /// - [`Error::Validation`] if `payload` is not a JSON object
    pub async fn create(&self, payload: &Value, confirm: bool) -> Result<Value> {
        self.gate("create", confirm)?;
        require_object(payload)?;

        if self.client.is_dry_run() {
            let id = self.client.next_simulated_id();
            info!(
                "[DRY-RUN] Would POST {} with payload: {}",
                self.path.api_path(),
                payload
            );
            return Ok(with_id(payload, id));
        }

        info!("Creating object in {}", self.path);
        let created = self.client.backend().create(&self.path, payload).await?;
        self.invalidate();
        Ok(created)
    }

    /// Partially update an object
    ///
    /// # Errors
    ///
    /// - [`Error::ConfirmationRequired`] if `confirm` is false (no network call)
    /// - [`Error::Validation`] if `payload` is not a JSON object
    pub async fn update(&self, id: u64, payload: &Value, confirm: bool) -> Result<Value> {
        self.gate("update", confirm)?;
        require_object(payload)?;

        if self.client.is_dry_run() {
            info!(
                "[DRY-RUN] Would PATCH {} with payload: {}",
                self.path.object_path(id),
                payload
            );
            return Ok(with_id(payload, id));
        }

        info!("Updating object {} in {}", id, self.path);
        let updated = self.client.backend().update(&self.path, id, payload).await?;
        self.invalidate();
        Ok(updated)
    }

    /// Delete an object
    ///
    /// # Errors
    ///
    /// [`Error::ConfirmationRequired`] if `confirm` is false (no network call)
    pub async fn delete(&self, id: u64, confirm: bool) -> Result<()> {
        self.gate("delete", confirm)?;

        if self.client.is_dry_run() {
            info!("[DRY-RUN] Would DELETE {}", self.path.object_path(id));
            return Ok(());
        }

        info!("Deleting object {} in {}", id, self.path);
        self.client.backend().delete(&self.path, id).await?;
        self.invalidate();
        Ok(())
    }

    fn gate(&self, operation: &str, confirm: bool) -> Result<()> {
        if confirm {
            return Ok(());
        }
        debug!("Refusing {} on {} without confirmation", operation, self.path);
        Err(Error::confirmation_required(format!(
            "{} {}",
            operation, self.path
        )))
    }

    fn invalidate(&self) {
        self.client.cache().invalidate_type(&self.path.resource_type());
    }
}

fn require_object(payload: &Value) -> Result<()> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "payload must be a JSON object, got: {}",
            payload
        )))
    }
}

fn with_id(payload: &Value, id: u64) -> Value {
    let mut object = payload.clone();
    if let Some(map) = object.as_object_mut() {
        map.insert("id".to_string(), json!(id));
    }
    object
}
