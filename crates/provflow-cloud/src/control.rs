//! Control plane capability
//!
//! The orchestrator never talks to the control plane's object model
//! directly. Every read, create and delete goes through [`ControlPlane`],
//! parameterized by the closed [`ResourceClass`] set.

use crate::document::AutomationState;
use crate::error::Result;
use crate::provider::Provider;
use crate::resource::{ObjectRef, RemoteObject, ResourceClass};
use crate::rules::EvalContext;
use async_trait::async_trait;
use serde_json::Value;

/// Everything needed to create one object
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Declaration after rule evaluation (or the rendered deployment
    /// descriptor, for hosts)
    pub decl: Value,

    /// Cluster the object is created under
    pub cluster_id: Option<i64>,

    /// Comma separated playbook list, hosts only
    pub playbooks: Option<String>,
}

impl CreateRequest {
    pub fn new(decl: Value) -> Self {
        Self {
            decl,
            ..Default::default()
        }
    }

    pub fn in_cluster(mut self, cluster_id: i64) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    pub fn with_playbooks(mut self, playbooks: Option<String>) -> Self {
        self.playbooks = playbooks;
        self
    }
}

/// Result of a create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A standing object of the requested class
    Created(ObjectRef),

    /// A marketplace app materialized into an image and/or a template
    Materialized {
        image: Option<ObjectRef>,
        template: Option<ObjectRef>,
    },
}

/// Result of a delete call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,

    /// The deletion released driver-managed addressing and the driver
    /// reported a new automation state to persist
    AutomationUpdated(AutomationState),
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Looks up a provider by name
    async fn provider(&self, name: &str) -> Result<Option<Provider>>;

    /// Fetches a fresh snapshot of one object
    async fn info(&self, class: ResourceClass, id: i64) -> Result<RemoteObject>;

    /// Applies template-expansion rules to a declaration in place
    fn evaluate_rules(&self, _class: ResourceClass, decl: &mut Value, ctx: &EvalContext) -> Result<()> {
        ctx.expand_value(decl)
    }

    async fn create(&self, class: ResourceClass, request: &CreateRequest) -> Result<CreateOutcome>;

    /// Deletes one object. Infrastructure deletions receive the current
    /// automation state so hosts can release driver-managed addressing.
    async fn delete(
        &self,
        class: ResourceClass,
        id: i64,
        force: bool,
        automation: Option<&AutomationState>,
    ) -> Result<DeleteOutcome>;

    /// Applies the ownership declared in `decl` (`uid`/`gid`)
    async fn template_chown(&self, _class: ResourceClass, _id: i64, _decl: &Value) -> Result<()> {
        Ok(())
    }

    /// Applies the permissions declared in `decl` (`mode`)
    async fn template_chmod(&self, _class: ResourceClass, _id: i64, _decl: &Value) -> Result<()> {
        Ok(())
    }

    async fn add_datastore_to_cluster(&self, cluster_id: i64, datastore_id: i64) -> Result<()>;

    /// Takes a host out of active rotation
    async fn host_offline(&self, id: i64) -> Result<()>;

    async fn host_enable(&self, id: i64) -> Result<()>;

    /// Renames a host and records its deployment identifier
    async fn rename_host(&self, id: i64, name: &str, deploy_id: Option<&str>) -> Result<()>;

    async fn delete_vm(&self, id: i64) -> Result<()>;

    /// Whether a workload instance reached its terminal state
    async fn vm_done(&self, id: i64) -> Result<bool>;

    async fn delete_image(&self, id: i64) -> Result<()>;

    async fn image_exists(&self, id: i64) -> Result<bool>;

    /// Adds one address range to a virtual network
    async fn add_address_range(&self, network_id: i64, ar_template: &Value) -> Result<()>;
}
