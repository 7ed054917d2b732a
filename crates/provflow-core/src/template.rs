//! Provision templates
//!
//! A provision template is a YAML file declaring the cluster, the
//! infrastructure, the hosts and the virtual resources of a provision:
//!
//! ```yaml
//! name: edge
//! defaults:
//!   provision:
//!     provider_name: aws
//! playbook: [default]
//! cluster:
//!   name: "{{ provision.name }}-cluster"
//! networks:
//!   - name: "{{ provision.name }}-public"
//!     vn_mad: elastic
//!     ar: [{ size: 1, ipam_mad: aws }]
//! hosts:
//!   - im_mad: kvm
//!     vm_mad: kvm
//!     provision:
//!       count: 2
//!       hostname: "edge-host{{ index }}"
//! ```

use crate::error::{ProvisionError, Result};
use provflow_cloud::{ProviderInput, ResourceClass};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Playbooks run by the configuration driver, one name or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Playbooks {
    One(String),
    Many(Vec<String>),
}

impl Playbooks {
    /// Comma separated form passed to host creation
    pub fn joined(&self) -> String {
        match self {
            Playbooks::One(p) => p.clone(),
            Playbooks::Many(list) => list.join(","),
        }
    }
}

/// Declaration of one host group.
///
/// A group expands into several hosts through `provision.count` or a
/// `provision.hostname` list. Each host is created from a structural copy
/// specialized with [`HostDecl::specialize`]; the group itself is never
/// mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostDecl(pub Map<String, Value>);

impl HostDecl {
    pub fn provision(&self) -> Option<&Map<String, Value>> {
        self.0.get("provision").and_then(Value::as_object)
    }

    fn provision_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry("provision")
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("provision section was just normalized to an object"),
        }
    }

    /// Explicit hostnames when the group lists them
    pub fn hostnames(&self) -> Option<Vec<String>> {
        let list = self.provision()?.get("hostname")?.as_array()?;
        Some(
            list.iter()
                .map(|h| match h {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        )
    }

    /// Number of hosts the group expands into
    pub fn count(&self) -> Result<usize> {
        if let Some(hostnames) = self.hostnames() {
            return Ok(hostnames.len());
        }

        let Some(count) = self.provision().and_then(|p| p.get("count")) else {
            return Ok(1);
        };

        match count {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| ProvisionError::InvalidTemplate(format!("invalid host count: {}", count)))
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provision()?.get("provider_name")?.as_str()
    }

    /// Playbook reference carried by a host template (used by host stencils)
    pub fn playbook(&self) -> Option<String> {
        self.0
            .get("ansible_playbook")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Copy of the declaration for one concrete host
    pub fn specialize(
        &self,
        index: usize,
        count: usize,
        hostname: Option<&str>,
        provision_id: i64,
    ) -> HostDecl {
        let mut host = self.clone();
        let provision = host.provision_mut();
        if let Some(hostname) = hostname {
            provision.insert("hostname".into(), Value::String(hostname.to_string()));
        }
        provision.insert("index".into(), Value::from(index));
        provision.insert("count".into(), Value::from(count));
        provision.insert("id".into(), Value::from(provision_id));
        host
    }

    /// Builds a stencil from the template of an existing host.
    ///
    /// Host-specific data (last error, deployment id, hostname) is dropped and
    /// the connection attributes are copied back into `connection`.
    pub fn from_existing(template: &Value) -> HostDecl {
        let mut host = HostDecl(template.as_object().cloned().unwrap_or_default());
        host.0.remove("error");

        let provision = host.provision_mut();
        provision.remove("deploy_id");
        provision.remove("hostname");

        let connection: Map<String, Value> = host
            .0
            .get("provision_connection")
            .and_then(Value::as_object)
            .map(|conn| {
                ["private_key", "public_key", "remote_port", "remote_user"]
                    .iter()
                    .filter_map(|attr| conn.get(*attr).map(|v| (attr.to_string(), v.clone())))
                    .collect()
            })
            .unwrap_or_default();
        host.0.insert("connection".into(), Value::Object(connection));
        host
    }

    /// Per-host deployment descriptor handed to the control plane.
    ///
    /// The `provision`, `connection` and `configuration` sections are kept
    /// apart; every other attribute goes to `template`.
    pub fn deployment_descriptor(&self) -> Value {
        let mut descriptor = Map::new();
        let mut template = Map::new();

        for (key, value) in &self.0 {
            match key.as_str() {
                "provision" | "connection" | "configuration" => {
                    descriptor.insert(key.clone(), value.clone());
                }
                _ => {
                    template.insert(key.clone(), value.clone());
                }
            }
        }

        descriptor.insert("template".into(), Value::Object(template));
        Value::Object(descriptor)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// A parsed provision template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionTemplate {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Sections merged into every host declaration (host values win)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub defaults: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<ProviderInput>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<Playbooks>,

    #[serde(default)]
    pub cluster: Map<String, Value>,

    #[serde(default)]
    pub datastores: Vec<Value>,
    #[serde(default)]
    pub networks: Vec<Value>,
    #[serde(default)]
    pub hosts: Vec<HostDecl>,
    #[serde(default)]
    pub images: Vec<Value>,
    #[serde(default)]
    pub marketplaceapps: Vec<Value>,
    #[serde(default)]
    pub templates: Vec<Value>,
    #[serde(default)]
    pub vntemplates: Vec<Value>,
    #[serde(default)]
    pub flowtemplates: Vec<Value>,

    /// Keys not understood by the orchestrator, stored in the document as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProvisionTemplate {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut template: ProvisionTemplate = serde_yaml::from_str(content)?;
        template.apply_defaults();
        template.validate()?;
        Ok(template)
    }

    fn apply_defaults(&mut self) {
        if self.defaults.is_empty() {
            return;
        }
        for host in &mut self.hosts {
            for (section, value) in &self.defaults {
                match host.0.get_mut(section) {
                    Some(existing) => merge_missing(existing, value),
                    None => {
                        host.0.insert(section.clone(), value.clone());
                    }
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::InvalidTemplate("missing name".into()));
        }
        if self.cluster.is_empty() {
            return Err(ProvisionError::InvalidTemplate("missing cluster".into()));
        }
        for host in &self.hosts {
            host.count()?;
        }
        Ok(())
    }

    /// Declarations of a class that is created from the template
    pub fn declarations(&self, class: ResourceClass) -> &[Value] {
        match class {
            ResourceClass::Datastore => &self.datastores,
            ResourceClass::Network => &self.networks,
            ResourceClass::Image => &self.images,
            ResourceClass::MarketplaceApp => &self.marketplaceapps,
            ResourceClass::Template => &self.templates,
            ResourceClass::VnTemplate => &self.vntemplates,
            ResourceClass::FlowTemplate => &self.flowtemplates,
            ResourceClass::Cluster | ResourceClass::Host => &[],
        }
    }

    /// Provider named by the template: the global defaults win over the
    /// first host's own setting.
    pub fn read_provider(&self) -> Option<String> {
        self.defaults
            .get("provision")
            .and_then(|p| p.get("provider_name"))
            .and_then(Value::as_str)
            .or_else(|| self.hosts.first().and_then(HostDecl::provider_name))
            .map(str::to_string)
    }

    /// Replaces template inputs with values supplied by the user
    pub fn with_user_inputs(mut self, user_inputs: Vec<ProviderInput>) -> Self {
        if user_inputs.is_empty() {
            return self;
        }
        let inputs = self.inputs.get_or_insert_with(Vec::new);
        for input in user_inputs {
            match inputs.iter_mut().find(|i| i.name == input.name) {
                Some(existing) => existing.value = input.value,
                None => inputs.push(input),
            }
        }
        self
    }

    /// Merges provider-declared inputs into the template's inputs.
    ///
    /// A provider input takes the template's value when both declare the same
    /// name; template-only inputs are kept.
    pub fn merge_provider_inputs(&mut self, provider_inputs: &[ProviderInput]) {
        let Some(inputs) = self.inputs.as_mut() else {
            self.inputs = Some(provider_inputs.to_vec());
            return;
        };

        for provider_input in provider_inputs {
            let mut merged = provider_input.clone();
            if let Some(pos) = inputs.iter().position(|i| i.name == provider_input.name) {
                let user = inputs.remove(pos);
                merged.value = user.value;
            }
            inputs.push(merged);
        }
    }

    /// Input values visible to rule evaluation
    pub fn input_values(&self) -> BTreeMap<String, Value> {
        self.inputs
            .iter()
            .flatten()
            .filter_map(|i| i.effective_value().map(|v| (i.name.clone(), v.clone())))
            .collect()
    }

    pub fn playbooks(&self) -> Option<String> {
        self.playbook.as_ref().map(Playbooks::joined)
    }

    /// Ids of pre-existing datastores to attach to the cluster
    pub fn cluster_datastores(&self) -> Vec<i64> {
        self.cluster
            .get("datastores")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default()
    }

    /// Cluster declaration without the datastore attachment list
    pub fn cluster_decl(&self) -> Value {
        let mut cluster = self.cluster.clone();
        cluster.remove("datastores");
        Value::Object(cluster)
    }
}

/// Copies keys of `defaults` missing from `target`, recursing into objects
fn merge_missing(target: &mut Value, defaults: &Value) {
    let (Value::Object(target), Value::Object(defaults)) = (target, defaults) else {
        return;
    };
    for (key, value) in defaults {
        match target.get_mut(key) {
            Some(existing) => merge_missing(existing, value),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
