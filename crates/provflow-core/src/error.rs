use provflow_cloud::{CloudError, ProvisionState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Can't {operation} provision in {state} (expected {expected})")]
    InvalidState {
        operation: &'static str,
        state: ProvisionState,
        expected: String,
    },

    #[error("No provider found")]
    ProviderNotFound,

    #[error("Provider '{0}' is not registered")]
    UnknownProvider(String),

    #[error("Provision has no networks")]
    NoNetworks,

    #[error("Provision has no hosts")]
    NoHosts,

    #[error("Provision has no cluster")]
    NoCluster,

    #[error("Can't add IPs to network, wrong VN_MAD '{0}'")]
    NotElastic(String),

    #[error("Provision has no address range template")]
    MissingAddressRange,

    #[error("Provision with running VMs can't be deleted")]
    RunningWorkloads,

    #[error("Provision with images can't be deleted")]
    SurvivingImages,

    #[error("Invalid provision template: {0}")]
    InvalidTemplate(String),

    #[error("Provision template parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Provision template could not be read: {0}")]
    Io(#[from] std::io::Error),

    /// A failure worth retrying, surfaced to the operator
    #[error("{0}")]
    Recoverable(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Configuration failed with exit code {0}")]
    ConfigurationFailed(i32),

    /// The operator chose to abort while creating a provision
    #[error("Cleanup requested: {0}")]
    CleanupRequested(String),

    /// The operator aborted an operation that has no rollback
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("{label}: giving up after {attempts} attempts: {message}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        message: String,
    },

    #[error("Provision {id} was rolled back: {reason}")]
    RolledBack { id: i64, reason: String },
}

impl ProvisionError {
    pub(crate) fn invalid_state(
        operation: &'static str,
        state: ProvisionState,
        expected: impl Into<String>,
    ) -> Self {
        ProvisionError::InvalidState {
            operation,
            state,
            expected: expected.into(),
        }
    }

    /// An abort outside the creation pipeline has nothing to roll back
    pub(crate) fn into_aborted(self) -> Self {
        match self {
            ProvisionError::CleanupRequested(reason) => ProvisionError::Aborted(reason),
            e => e,
        }
    }

    /// Whether the Retry/Skip/Abort protocol may handle this failure
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProvisionError::Recoverable(_) => true,
            ProvisionError::Cloud(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
