//! Resource handle cache
//!
//! Remote snapshots of the objects tracked by one provision, keyed by
//! class. A refresh re-reads the provision document from the store and then
//! fetches one snapshot per tracked reference. The whole refresh runs under
//! the cache lock, so callers never observe a half-populated entry.

use crate::error::{ProvisionError, Result};
use provflow_cloud::{ControlPlane, DocumentStore, ProvisionDocument, RemoteObject, ResourceClass};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct ObjectCache {
    id: i64,
    store: Arc<dyn DocumentStore>,
    cloud: Arc<dyn ControlPlane>,
    entries: Mutex<HashMap<ResourceClass, Vec<RemoteObject>>>,
}

impl ObjectCache {
    pub fn new(id: i64, store: Arc<dyn DocumentStore>, cloud: Arc<dyn ControlPlane>) -> Self {
        Self {
            id,
            store,
            cloud,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshots of every tracked object of `class`.
    ///
    /// Empty or missing entries are always refreshed. Failures are reported
    /// as recoverable so the caller's step can be retried.
    pub async fn get_objects(
        &self,
        class: ResourceClass,
        force_refresh: bool,
    ) -> Result<Vec<RemoteObject>> {
        let mut entries = self.entries.lock().await;

        if !force_refresh
            && let Some(objects) = entries.get(&class)
            && !objects.is_empty()
        {
            return Ok(objects.clone());
        }

        debug!(provision_id = self.id, %class, "Refreshing cached objects");

        let stored = self.store.info(self.id).await.map_err(|e| {
            ProvisionError::Recoverable(format!("Failed to read provision {}: {}", self.id, e))
        })?;
        let doc = ProvisionDocument::from_value(stored.body)?;

        let mut objects = Vec::with_capacity(doc.objects(class).len());
        for object in doc.objects(class) {
            let snapshot = self.cloud.info(class, object.id).await.map_err(|e| {
                ProvisionError::Recoverable(format!(
                    "Failed to read {} {}: {}",
                    class.singular(),
                    object.id,
                    e
                ))
            })?;
            objects.push(snapshot);
        }

        entries.insert(class, objects.clone());
        Ok(objects)
    }

    /// Drops every cached entry
    pub async fn invalidate(&self) {
        self.entries.lock().await.clear();
    }
}
