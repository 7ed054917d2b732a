//! Teardown report returned by the deletion pipeline

use provflow_cloud::ResourceClass;
use serde::Serialize;
use std::fmt;

/// Result of deleting a single object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectResult {
    pub class: ResourceClass,
    pub id: i64,
    pub name: String,

    /// Error message if the deletion failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Objects removed by a deletion run
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub deleted: Vec<ObjectResult>,

    /// Failures swallowed because the deletion was forced
    pub failed: Vec<ObjectResult>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn add_success(&mut self, class: ResourceClass, id: i64, name: impl Into<String>) {
        self.deleted.push(ObjectResult {
            class,
            id,
            name: name.into(),
            error: None,
        });
    }

    pub fn add_failure(
        &mut self,
        class: ResourceClass,
        id: i64,
        name: impl Into<String>,
        error: impl Into<String>,
    ) {
        self.failed.push(ObjectResult {
            class,
            id,
            name: name.into(),
            error: Some(error.into()),
        });
    }

    /// Deleted objects of one class
    pub fn deleted_of(&self, class: ResourceClass) -> Vec<&ObjectResult> {
        self.deleted.iter().filter(|r| r.class == class).collect()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} deleted, {} failed in {}ms",
            self.deleted.len(),
            self.failed.len(),
            self.duration_ms
        )
    }
}
