//! provflow core
//!
//! Orchestrates the lifecycle of a provision: a cluster, its datastores,
//! networks and hosts, plus the virtual resources built on top of them.
//!
//! ```text
//! deploy:  cluster → datastores → networks → hosts → deploy driver
//!          → configuration driver → images, templates, ...  → RUNNING
//! delete:  drain VMs/images → destroy → hosts → resources
//!          → datastores → networks → cluster → document removed
//! ```
//!
//! Every step talking to the control plane runs under the Retry/Skip/Abort
//! protocol (see [`retry`]) and persists the provision document when it
//! succeeds.

pub mod cache;
mod delete;
pub mod deploy;
pub mod error;
pub mod objects;
pub mod provision;
pub mod report;
pub mod retry;
pub mod scale;
pub mod template;

// Re-exports
pub use cache::ObjectCache;
pub use deploy::{DeployOptions, DeployOutcome, Skip};
pub use error::{ProvisionError, Result};
pub use objects::ObjectOp;
pub use provision::{Backends, Provision};
pub use report::{ObjectResult, TeardownReport};
pub use retry::{
    Decision, InteractiveOperator, Operator, PolicyOperator, StepFailure, StepOutcome,
    operator_from_settings,
};
pub use scale::HostsRequest;
pub use template::{HostDecl, Playbooks, ProvisionTemplate};
