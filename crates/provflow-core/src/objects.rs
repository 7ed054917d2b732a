use crate::error::Result;
use crate::provision::Provision;
use provflow_cloud::{DeleteOutcome, ObjectRef, ResourceClass};
use tracing::info;

/// Mutation applied by [`Provision::update_objects`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOp {
    /// Track an object created outside the pipelines
    Append { name: String },
    /// Delete the object remotely and stop tracking it
    Remove,
}

impl Provision {
    /// Appends or removes a single tracked object.
    ///
    /// The document is refreshed first. A failed remote deletion leaves the
    /// tracked references untouched.
    pub async fn update_objects(&mut self, class: ResourceClass, op: ObjectOp, id: i64) -> Result<()> {
        self.refresh().await?;

        match op {
            ObjectOp::Append { name } => {
                info!(provision_id = self.id(), %class, object_id = id, "Tracking {} {}", class.singular(), id);
                self.doc.provision.push(class, ObjectRef::new(id, name));
            }
            ObjectOp::Remove => {
                let cloud = self.backends.cloud.clone();
                cloud.info(class, id).await?;

                let automation = if class.is_infrastructure() {
                    self.doc.tf.clone()
                } else {
                    None
                };

                if let DeleteOutcome::AutomationUpdated(automation) =
                    cloud.delete(class, id, false, automation.as_ref()).await?
                {
                    self.doc.tf = Some(automation);
                }

                info!(provision_id = self.id(), %class, object_id = id, "Removed {} {}", class.singular(), id);
                self.doc.provision.remove(class, id);
            }
        }

        self.persist().await
    }
}
