use crate::cache::ObjectCache;
use crate::error::{ProvisionError, Result};
use crate::retry::{Operator, operator_from_settings};
use provflow_cloud::{
    AutomationState, CloudError, ConfigurationDriver, ControlPlane, CreateOutcome,
    DeploymentDriver, DocumentStore, ObjectRef, ProvisionDocument, ProvisionState, ResourceClass,
};
use provflow_config::Settings;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// External collaborators of the orchestrator
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DocumentStore>,
    pub cloud: Arc<dyn ControlPlane>,
    pub deployer: Arc<dyn DeploymentDriver>,
    pub configurator: Arc<dyn ConfigurationDriver>,
    pub operator: Arc<dyn Operator>,
}

impl Backends {
    /// Collaborators with the operator chosen by `settings.fail_mode`
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cloud: Arc<dyn ControlPlane>,
        deployer: Arc<dyn DeploymentDriver>,
        configurator: Arc<dyn ConfigurationDriver>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            cloud,
            deployer,
            configurator,
            operator: operator_from_settings(settings),
        }
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }
}

/// One provision, bound to its document in the store.
///
/// An instance holds the document's exclusive lock from [`Provision::open`]
/// (or allocation) until [`Provision::release`] or a deletion.
pub struct Provision {
    id: i64,
    version: u64,
    pub(crate) doc: ProvisionDocument,
    pub(crate) backends: Backends,
    pub(crate) settings: Settings,
    pub(crate) cache: ObjectCache,
    pub(crate) skip_all: bool,
}

impl Provision {
    fn bind(id: i64, version: u64, doc: ProvisionDocument, backends: Backends, settings: Settings) -> Self {
        let cache = ObjectCache::new(id, Arc::clone(&backends.store), Arc::clone(&backends.cloud));
        Self {
            id,
            version,
            doc,
            backends,
            settings,
            cache,
            skip_all: false,
        }
    }

    /// Loads an existing provision and locks its document
    pub async fn open(backends: Backends, settings: Settings, id: i64) -> Result<Self> {
        let stored = backends.store.info(id).await?;
        let doc = ProvisionDocument::from_value(stored.body)?;
        backends.store.lock(id).await?;

        debug!(provision_id = id, state = %doc.state, "Opened provision");
        Ok(Self::bind(id, stored.version, doc, backends, settings))
    }

    /// Stores a new document and locks it
    pub(crate) async fn allocate(
        backends: Backends,
        settings: Settings,
        doc: ProvisionDocument,
    ) -> Result<Self> {
        let id = backends.store.allocate(&doc.name, doc.to_value()?).await?;
        let stored = backends.store.info(id).await?;
        backends.store.lock(id).await?;

        Ok(Self::bind(id, stored.version, doc, backends, settings))
    }

    /// Writes the in-memory document back. A concurrent update of the same
    /// document fails with `CloudError::StaleVersion`.
    pub(crate) async fn persist(&mut self) -> Result<()> {
        let body = self.doc.to_value()?;
        self.version = self.backends.store.update(self.id, body, self.version).await?;
        Ok(())
    }

    /// Re-reads the document from the store
    pub async fn refresh(&mut self) -> Result<()> {
        let stored = self.backends.store.info(self.id).await?;
        self.doc = ProvisionDocument::from_value(stored.body)?;
        self.version = stored.version;
        self.cache.invalidate().await;
        Ok(())
    }

    /// Drops the document lock
    pub async fn release(self) -> Result<()> {
        self.backends.store.unlock(self.id).await?;
        Ok(())
    }

    pub(crate) async fn set_state(&mut self, state: ProvisionState) -> Result<()> {
        debug!(provision_id = self.id, from = %self.doc.state, to = %state, "State change");
        self.doc.state = state;
        self.persist().await
    }

    /// Best-effort transition to ERROR after a failed pipeline
    pub(crate) async fn mark_error(&mut self) {
        if let Err(e) = self.set_state(ProvisionState::Error).await {
            warn!(provision_id = self.id, "Failed to record ERROR state: {}", e);
        }
    }

    pub(crate) fn require_state(&self, operation: &'static str, expected: ProvisionState) -> Result<()> {
        if self.doc.state != expected {
            return Err(ProvisionError::invalid_state(
                operation,
                self.doc.state,
                expected.as_str(),
            ));
        }
        Ok(())
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn state(&self) -> ProvisionState {
        self.doc.state
    }

    pub fn provider(&self) -> &str {
        &self.doc.provider
    }

    pub fn document(&self) -> &ProvisionDocument {
        &self.doc
    }

    /// Tracked references of a class, empty when none were created
    pub fn objects(&self, class: ResourceClass) -> &[ObjectRef] {
        self.doc.objects(class)
    }

    pub fn automation_state(&self) -> Option<&AutomationState> {
        self.doc.tf.as_ref()
    }

    pub fn address_range_template(&self) -> Option<&Value> {
        self.doc.ar_template.as_ref()
    }
}

/// Extracts the reference of a standing object
pub(crate) fn expect_created(class: ResourceClass, outcome: CreateOutcome) -> Result<ObjectRef> {
    match outcome {
        CreateOutcome::Created(object) => Ok(object),
        CreateOutcome::Materialized { .. } => Err(ProvisionError::Cloud(CloudError::InvalidConfig(
            format!("create of a {} returned a marketplace materialization", class.singular()),
        ))),
    }
}
