//! provflow cloud contracts
//!
//! This crate defines the collaborators the provision orchestrator talks
//! to, without implementing any of them against a real cloud:
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 provflow-core                    │
//! │        (deploy / delete / add_hosts / ...)       │
//! └──────┬───────────────┬──────────────────┬───────┘
//!        │               │                  │
//! ┌──────▼──────┐ ┌──────▼───────┐ ┌────────▼────────┐
//! │ ControlPlane│ │ Deployment / │ │  DocumentStore  │
//! │ (objects)   │ │ Configuration│ │ (versioned JSON)│
//! │             │ │   drivers    │ │                 │
//! └─────────────┘ └──────────────┘ └─────────────────┘
//! ```
//!
//! The provision document model lives here too; drivers receive it as
//! their input.

pub mod control;
pub mod document;
pub mod error;
pub mod provider;
pub mod resource;
pub mod rules;
pub mod store;

// Re-exports
pub use control::{ControlPlane, CreateOutcome, CreateRequest, DeleteOutcome};
pub use document::{
    AutomationState, DUMMY_PROVIDER, ProvisionDocument, ProvisionObjects, ProvisionState,
};
pub use error::{CloudError, Result};
pub use provider::{ConfigurationDriver, DeployOutput, DeploymentDriver, Provider, ProviderInput};
pub use resource::{ObjectRef, RemoteObject, ResourceClass, Section};
pub use rules::{EvalContext, ProviderIdentity, ProvisionIdentity};
pub use store::{DocumentStore, FileStore, MemoryStore, StoredDocument};
