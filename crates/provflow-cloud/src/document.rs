//! Provision document model
//!
//! The provision is persisted as a JSON document in the remote document
//! store. The layout mirrors what the control plane tools expect:
//!
//! ```text
//! {
//!   "name": "...", "description": "...", "start_time": 1700000000,
//!   "state": 3, "provider": "aws",
//!   "provision": {
//!     "infrastructure": { "clusters": [{"id": 0, "name": "c"}], "hosts": [...] },
//!     "resource": { "images": [...], "templates": [...] }
//!   },
//!   "tf": { "state": "...", "conf": "..." },
//!   "ar_template": { ... }
//! }
//! ```

use crate::resource::{ObjectRef, ResourceClass, Section};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Provider name recorded for provisions without a backing provider
pub const DUMMY_PROVIDER: &str = "dummy";

/// Lifecycle state of a provision, stored as its ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProvisionState {
    Pending,
    Deploying,
    Configuring,
    Running,
    Error,
    Deleting,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Pending => "PENDING",
            ProvisionState::Deploying => "DEPLOYING",
            ProvisionState::Configuring => "CONFIGURING",
            ProvisionState::Running => "RUNNING",
            ProvisionState::Error => "ERROR",
            ProvisionState::Deleting => "DELETING",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ProvisionState> for u8 {
    fn from(state: ProvisionState) -> Self {
        match state {
            ProvisionState::Pending => 0,
            ProvisionState::Deploying => 1,
            ProvisionState::Configuring => 2,
            ProvisionState::Running => 3,
            ProvisionState::Error => 4,
            ProvisionState::Deleting => 5,
        }
    }
}

impl TryFrom<u8> for ProvisionState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(ProvisionState::Pending),
            1 => Ok(ProvisionState::Deploying),
            2 => Ok(ProvisionState::Configuring),
            3 => Ok(ProvisionState::Running),
            4 => Ok(ProvisionState::Error),
            5 => Ok(ProvisionState::Deleting),
            other => Err(format!("invalid provision state {}", other)),
        }
    }
}

/// State and configuration blobs produced by the deployment driver.
///
/// Both halves are required: a document carrying only one of them is
/// treated as having no automation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationState {
    pub state: String,
    pub conf: String,
}

impl AutomationState {
    pub fn new(state: impl Into<String>, conf: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            conf: conf.into(),
        }
    }

    /// Builds the pair only when the driver returned both halves
    pub fn from_parts(state: Option<String>, conf: Option<String>) -> Option<Self> {
        match (state, conf) {
            (Some(state), Some(conf)) => Some(Self { state, conf }),
            _ => None,
        }
    }
}

/// Objects tracked by a provision, per section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionObjects {
    #[serde(default)]
    pub infrastructure: BTreeMap<ResourceClass, Vec<ObjectRef>>,

    #[serde(default)]
    pub resource: BTreeMap<ResourceClass, Vec<ObjectRef>>,
}

impl ProvisionObjects {
    fn section(&self, section: Section) -> &BTreeMap<ResourceClass, Vec<ObjectRef>> {
        match section {
            Section::Infrastructure => &self.infrastructure,
            Section::Resource => &self.resource,
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut BTreeMap<ResourceClass, Vec<ObjectRef>> {
        match section {
            Section::Infrastructure => &mut self.infrastructure,
            Section::Resource => &mut self.resource,
        }
    }

    /// Tracked references of a class; empty when the class was never created
    pub fn get(&self, class: ResourceClass) -> &[ObjectRef] {
        self.section(class.section())
            .get(&class)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Mutable list of a class, created on first use
    pub fn get_mut(&mut self, class: ResourceClass) -> &mut Vec<ObjectRef> {
        self.section_mut(class.section()).entry(class).or_default()
    }

    pub fn push(&mut self, class: ResourceClass, object: ObjectRef) {
        self.get_mut(class).push(object);
    }

    /// Removes every reference with the given id, returning how many were removed
    pub fn remove(&mut self, class: ResourceClass, id: i64) -> usize {
        let Some(list) = self.section_mut(class.section()).get_mut(&class) else {
            return 0;
        };
        let before = list.len();
        list.retain(|o| o.id != id);
        before - list.len()
    }
}

/// The provision document body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionDocument {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Unix timestamp of the allocation
    pub start_time: i64,

    pub state: ProvisionState,

    /// Provider name, or [`DUMMY_PROVIDER`]
    pub provider: String,

    #[serde(default)]
    pub provision: ProvisionObjects,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf: Option<AutomationState>,

    /// Address range fragment captured when the first network declaring one was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ar_template: Option<serde_json::Value>,

    /// Extra template keys stored verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProvisionDocument {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            start_time: chrono::Utc::now().timestamp(),
            state: ProvisionState::Deploying,
            provider: provider.into(),
            provision: ProvisionObjects::default(),
            tf: None,
            ar_template: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn objects(&self, class: ResourceClass) -> &[ObjectRef] {
        self.provision.get(class)
    }

    /// The provision's cluster, once created
    pub fn cluster(&self) -> Option<&ObjectRef> {
        self.objects(ResourceClass::Cluster).first()
    }

    pub fn hosts(&self) -> &[ObjectRef] {
        self.objects(ResourceClass::Host)
    }

    pub fn datastores(&self) -> &[ObjectRef] {
        self.objects(ResourceClass::Datastore)
    }

    pub fn networks(&self) -> &[ObjectRef] {
        self.objects(ResourceClass::Network)
    }

    pub fn is_dummy(&self) -> bool {
        self.provider == DUMMY_PROVIDER
    }

    pub fn to_value(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
