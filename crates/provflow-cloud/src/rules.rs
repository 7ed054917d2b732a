//! Template-expansion rules
//!
//! Declarations may reference the provision they belong to through Tera
//! expressions, e.g. `name: "{{ provision.name }}-public"` or
//! `hostname: "edge-host{{ index }}"`. The context is built explicitly by
//! the orchestrator and handed to `ControlPlane::evaluate_rules`.

use crate::error::{CloudError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tera::{Context, Tera};

/// Identity of the provider backing a provision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderIdentity {
    pub id: i64,
    pub name: String,
}

impl ProviderIdentity {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Synthetic identity used when no provider backs the provision
    pub fn dummy() -> Self {
        Self::new(-1, crate::document::DUMMY_PROVIDER)
    }
}

/// Values available to template expressions
#[derive(Debug, Clone, Serialize)]
pub struct EvalContext {
    pub provision: ProvisionIdentity,
    pub provider: ProviderIdentity,
    pub inputs: BTreeMap<String, Value>,

    /// Global host index, set while creating hosts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionIdentity {
    pub id: i64,
    pub name: String,
}

impl EvalContext {
    pub fn new(id: i64, name: impl Into<String>, provider: ProviderIdentity) -> Self {
        Self {
            provision: ProvisionIdentity {
                id,
                name: name.into(),
            },
            provider,
            inputs: BTreeMap::new(),
            index: None,
        }
    }

    pub fn with_inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Copy of the context scoped to one host
    pub fn for_index(&self, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.index = Some(index);
        ctx
    }

    fn tera_context(&self) -> Result<Context> {
        Context::from_serialize(self).map_err(|e| CloudError::InvalidConfig(e.to_string()))
    }

    /// Expands a single string. Strings without expressions are returned as-is.
    pub fn expand(&self, input: &str) -> Result<String> {
        if !input.contains("{{") && !input.contains("{%") {
            return Ok(input.to_string());
        }
        let context = self.tera_context()?;
        Tera::one_off(input, &context, false)
            .map_err(|e| CloudError::InvalidConfig(format!("Failed to expand '{}': {}", input, e)))
    }

    /// Expands every string inside a declaration, recursively
    pub fn expand_value(&self, value: &mut Value) -> Result<()> {
        match value {
            Value::String(s) => {
                let expanded = self.expand(s)?;
                *s = expanded;
            }
            Value::Array(items) => {
                for item in items {
                    self.expand_value(item)?;
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.expand_value(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
