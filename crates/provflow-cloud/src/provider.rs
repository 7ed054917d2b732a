//! Providers and external automation drivers

use crate::document::{AutomationState, ProvisionDocument};
use crate::error::Result;
use crate::resource::RemoteObject;
use crate::rules::ProviderIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Infrastructure provider registered in the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,

    /// Provider name; an unnamed provider is recorded as `dummy`
    #[serde(default)]
    pub name: Option<String>,

    /// Inputs the provider declares for its templates
    #[serde(default)]
    pub inputs: Vec<ProviderInput>,
}

impl Provider {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
            inputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<ProviderInput>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn identity(&self) -> ProviderIdentity {
        match &self.name {
            Some(name) => ProviderIdentity::new(self.id, name.clone()),
            None => ProviderIdentity::dummy(),
        }
    }
}

/// A user-facing input of a provider or provision template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInput {
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl ProviderInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_type: None,
            description: None,
            default: None,
            value: None,
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Explicit value, falling back to the declared default
    pub fn effective_value(&self) -> Option<&serde_json::Value> {
        self.value.as_ref().or(self.default.as_ref())
    }
}

/// Addressing and automation state returned by the deployment driver.
///
/// `addresses` and `deploy_ids` are ordered like the provision's hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutput {
    pub addresses: Vec<String>,
    pub deploy_ids: Vec<String>,
    pub state: Option<String>,
    pub conf: Option<String>,
}

impl DeployOutput {
    pub fn automation(&self) -> Option<AutomationState> {
        AutomationState::from_parts(self.state.clone(), self.conf.clone())
    }
}

/// External deployment driver (Terraform-like)
#[async_trait]
pub trait DeploymentDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Deploys the infrastructure backing every host of the provision
    async fn deploy(&self, provision: &ProvisionDocument) -> Result<DeployOutput>;

    /// Deploys the hosts appended since the last deployment
    async fn add_hosts(
        &self,
        provision: &ProvisionDocument,
        automation: Option<&AutomationState>,
    ) -> Result<DeployOutput>;

    /// Tears down driver-managed infrastructure
    async fn destroy(&self, provision: &ProvisionDocument, automation: &AutomationState) -> Result<()>;
}

/// External configuration driver (Ansible-like)
#[async_trait]
pub trait ConfigurationDriver: Send + Sync {
    /// Verifies the driver's tooling before any deployment starts
    async fn check_version(&self) -> Result<()>;

    /// Configures hosts and datastores. Returns the driver's exit code,
    /// zero meaning success.
    async fn configure(
        &self,
        hosts: &[RemoteObject],
        datastores: &[RemoteObject],
        provision: &ProvisionDocument,
    ) -> Result<i32>;
}
