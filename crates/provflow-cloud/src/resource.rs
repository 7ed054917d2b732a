//! Resource classes and remote object snapshots

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of object classes a provision can track.
///
/// The serialized form is the plural key used in the provision document
/// (`clusters`, `datastores`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    #[serde(rename = "clusters")]
    Cluster,
    #[serde(rename = "datastores")]
    Datastore,
    #[serde(rename = "networks")]
    Network,
    #[serde(rename = "hosts")]
    Host,
    #[serde(rename = "images")]
    Image,
    #[serde(rename = "marketplaceapps")]
    MarketplaceApp,
    #[serde(rename = "templates")]
    Template,
    #[serde(rename = "vntemplates")]
    VnTemplate,
    #[serde(rename = "flowtemplates")]
    FlowTemplate,
}

/// Document section an object class is filed under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Infrastructure,
    Resource,
}

impl ResourceClass {
    /// Infrastructure created right after the cluster, in creation order
    pub const INFRASTRUCTURE: [ResourceClass; 2] = [ResourceClass::Datastore, ResourceClass::Network];

    /// Every class living in the `infrastructure` section
    pub const FULL_CLUSTER: [ResourceClass; 4] = [
        ResourceClass::Datastore,
        ResourceClass::Network,
        ResourceClass::Host,
        ResourceClass::Cluster,
    ];

    /// Virtual resources, in creation order. Objects without dependencies
    /// come first.
    pub const RESOURCES: [ResourceClass; 5] = [
        ResourceClass::Image,
        ResourceClass::MarketplaceApp,
        ResourceClass::Template,
        ResourceClass::VnTemplate,
        ResourceClass::FlowTemplate,
    ];

    /// Plural document key (`hosts`, `images`, ...)
    pub fn key(&self) -> &'static str {
        match self {
            ResourceClass::Cluster => "clusters",
            ResourceClass::Datastore => "datastores",
            ResourceClass::Network => "networks",
            ResourceClass::Host => "hosts",
            ResourceClass::Image => "images",
            ResourceClass::MarketplaceApp => "marketplaceapps",
            ResourceClass::Template => "templates",
            ResourceClass::VnTemplate => "vntemplates",
            ResourceClass::FlowTemplate => "flowtemplates",
        }
    }

    /// Singular name used in log and error messages
    pub fn singular(&self) -> &'static str {
        let key = self.key();
        &key[..key.len() - 1]
    }

    pub fn section(&self) -> Section {
        if Self::FULL_CLUSTER.contains(self) {
            Section::Infrastructure
        } else {
            Section::Resource
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.section() == Section::Infrastructure
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl FromStr for ResourceClass {
    type Err = crate::CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::FULL_CLUSTER
            .iter()
            .chain(Self::RESOURCES.iter())
            .find(|class| class.key() == s)
            .copied()
            .ok_or_else(|| crate::CloudError::InvalidConfig(format!("Unknown object class: {}", s)))
    }
}

/// Reference to an object living in the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: i64,
    pub name: String,
}

impl ObjectRef {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Snapshot of a remote object as returned by `ControlPlane::info`
///
/// `template` holds the object's user template (lowercase keys), while
/// `attributes` carries the runtime fields the orchestrator inspects:
/// `running_vms`, `vms`, `images`, `vn_mad`, `deploy_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub class: ResourceClass,
    pub id: i64,
    pub name: String,

    #[serde(default)]
    pub template: serde_json::Value,

    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl RemoteObject {
    pub fn new(class: ResourceClass, id: i64, name: impl Into<String>) -> Self {
        Self {
            class,
            id,
            name: name.into(),
            template: serde_json::Value::Object(Default::default()),
            attributes: HashMap::new(),
        }
    }

    pub fn with_template(mut self, template: serde_json::Value) -> Self {
        self.template = template;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn to_ref(&self) -> ObjectRef {
        ObjectRef::new(self.id, self.name.clone())
    }

    /// Number of workload instances running on a host
    pub fn running_vms(&self) -> u32 {
        self.get_attribute("running_vms").unwrap_or(0)
    }

    /// Workload instance ids placed on a host
    pub fn vm_ids(&self) -> Vec<i64> {
        self.get_attribute("vms").unwrap_or_default()
    }

    /// Image ids stored in a datastore
    pub fn image_ids(&self) -> Vec<i64> {
        self.get_attribute("images").unwrap_or_default()
    }

    /// Addressing driver of a virtual network
    pub fn vn_mad(&self) -> Option<String> {
        self.get_attribute("vn_mad")
    }

    /// Deployment identifier recorded on a host by the deployment driver
    pub fn deploy_id(&self) -> Option<String> {
        self.template
            .get("provision")
            .and_then(|p| p.get("deploy_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| self.get_attribute("deploy_id"))
    }
}
