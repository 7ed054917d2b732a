//! Deletion pipeline
//!
//! Reverse-order teardown: drain workloads and images when cleanup is
//! requested, destroy driver-managed infrastructure, delete hosts, then the
//! virtual resources, then datastores, networks and finally the cluster.

use crate::error::{ProvisionError, Result};
use crate::provision::Provision;
use crate::report::TeardownReport;
use crate::retry::StepOutcome;
use provflow_cloud::{AutomationState, DeleteOutcome, ObjectRef, ProvisionState, ResourceClass};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Infrastructure deleted after the virtual resources; clusters go last
const INFRASTRUCTURE_TEARDOWN: [ResourceClass; 3] = [
    ResourceClass::Datastore,
    ResourceClass::Network,
    ResourceClass::Cluster,
];

impl Provision {
    /// Tears the provision down and removes its document.
    ///
    /// Without `force`, a provision with running workloads or images fails
    /// before any state change unless `cleanup` is set, and the first failed
    /// deletion stops the pipeline with the document left in DELETING. With
    /// `force`, failed deletions are recorded in the report and skipped.
    /// The document lock is released on failure.
    pub async fn delete(mut self, cleanup: bool, timeout: Duration, force: bool) -> Result<TeardownReport> {
        self.begin_operation();
        let started = std::time::Instant::now();
        let mut report = TeardownReport::new();

        match self.teardown(cleanup, timeout, force, &mut report).await {
            Ok(()) => {
                report.duration_ms = started.elapsed().as_millis() as u64;
                info!(provision_id = self.id(), "Provision deleted: {}", report);
                Ok(report)
            }
            Err(e) => {
                warn!(provision_id = self.id(), "Deletion stopped: {}", e);
                if let Err(unlock) = self.backends.store.unlock(self.id()).await {
                    warn!(provision_id = self.id(), "Failed to release provision lock: {}", unlock);
                }
                Err(e.into_aborted())
            }
        }
    }

    async fn teardown(
        &mut self,
        cleanup: bool,
        timeout: Duration,
        force: bool,
        report: &mut TeardownReport,
    ) -> Result<()> {
        if !force && !cleanup {
            if self.has_running_vms().await? {
                return Err(ProvisionError::RunningWorkloads);
            }
            if !self.untracked_images().await?.is_empty() {
                return Err(ProvisionError::SurvivingImages);
            }
        }

        self.set_state(ProvisionState::Deleting).await?;
        info!(provision_id = self.id(), "Deleting provision");

        if cleanup {
            let drained = self
                .step("Failed to delete running VMs", move |p| Box::pin(p.drain_workloads(timeout)))
                .await;
            tolerate(drained, force, "workload drain")?;

            let drained = self
                .step("Failed to delete images", move |p| Box::pin(p.drain_images(timeout)))
                .await;
            tolerate(drained, force, "image drain")?;
        }

        if !self.doc.hosts().is_empty()
            && let Some(automation) = self.doc.tf.clone()
        {
            info!(provision_id = self.id(), "Destroying deployed infrastructure");
            let destroyed = self
                .step("Failed to destroy infrastructure", move |p| {
                    Box::pin(p.destroy_infrastructure(automation.clone()))
                })
                .await;
            tolerate(destroyed, force, "infrastructure destroy")?;
        }

        for host in self.doc.hosts().to_vec() {
            self.delete_tracked(ResourceClass::Host, host, force, report).await?;
        }

        info!(provision_id = self.id(), "Deleting provision objects");

        // marketplace apps were filed under images and templates
        let classes = ResourceClass::RESOURCES
            .into_iter()
            .filter(|c| *c != ResourceClass::MarketplaceApp)
            .chain(INFRASTRUCTURE_TEARDOWN);

        for class in classes {
            for object in self.doc.objects(class).to_vec() {
                self.delete_tracked(class, object, force, report).await?;
            }
        }

        self.backends.store.delete(self.id()).await?;
        Ok(())
    }

    async fn destroy_infrastructure(&mut self, automation: AutomationState) -> Result<()> {
        self.backends.deployer.destroy(&self.doc, &automation).await?;
        Ok(())
    }

    /// Deletes one tracked object and drops its reference
    async fn delete_tracked(
        &mut self,
        class: ResourceClass,
        object: ObjectRef,
        force: bool,
        report: &mut TeardownReport,
    ) -> Result<()> {
        let id = object.id;

        if force {
            match self.remove_object(class, id, true).await {
                Ok(()) => report.add_success(class, id, object.name),
                Err(e) => {
                    warn!(provision_id = self.id(), %class, object_id = id, "Ignoring failed deletion: {}", e);
                    self.doc.provision.remove(class, id);
                    report.add_failure(class, id, object.name, e.to_string());
                }
            }
            return Ok(());
        }

        let label = format!("Failed to delete {} {}", class.singular(), id);
        let outcome = self
            .step(&label, move |p| Box::pin(p.remove_object(class, id, false)))
            .await?
            .or_cleanup()?;

        if outcome.completed() {
            report.add_success(class, id, object.name);
        } else {
            self.doc.provision.remove(class, id);
        }
        Ok(())
    }

    async fn remove_object(&mut self, class: ResourceClass, id: i64, force: bool) -> Result<()> {
        let cloud = self.backends.cloud.clone();
        debug!(provision_id = self.id(), %class, object_id = id, "Deleting {} {}", class.singular(), id);

        cloud.info(class, id).await?;

        let automation = if class.is_infrastructure() {
            self.doc.tf.clone()
        } else {
            None
        };

        if let DeleteOutcome::AutomationUpdated(automation) =
            cloud.delete(class, id, force, automation.as_ref()).await?
        {
            self.doc.tf = Some(automation);
        }

        self.doc.provision.remove(class, id);
        self.persist().await
    }

    async fn has_running_vms(&self) -> Result<bool> {
        let hosts = self.cache.get_objects(ResourceClass::Host, true).await?;
        Ok(hosts.iter().any(|h| h.running_vms() > 0))
    }

    /// Images found in the provision's datastores that it does not track
    async fn untracked_images(&self) -> Result<Vec<i64>> {
        let tracked: HashSet<i64> = self
            .doc
            .objects(ResourceClass::Image)
            .iter()
            .map(|i| i.id)
            .collect();

        let datastores = self.cache.get_objects(ResourceClass::Datastore, true).await?;
        Ok(datastores
            .iter()
            .flat_map(|d| d.image_ids())
            .filter(|id| !tracked.contains(id))
            .collect())
    }

    async fn drain_workloads(&mut self, timeout: Duration) -> Result<()> {
        let cloud = self.backends.cloud.clone();
        let hosts = self.cache.get_objects(ResourceClass::Host, true).await?;

        for host in hosts.iter().filter(|h| h.running_vms() > 0) {
            for vm in host.vm_ids() {
                debug!(provision_id = self.id(), host_id = host.id, "Deleting VM {}", vm);
                cloud.delete_vm(vm).await?;

                let cloud = cloud.clone();
                self.wait_until(timeout, &format!("VM {}", vm), move || {
                    let cloud = cloud.clone();
                    async move { cloud.vm_done(vm).await }
                })
                .await?;
            }
        }

        if self.has_running_vms().await? {
            return Err(ProvisionError::Recoverable("Still found running VMs".into()));
        }
        Ok(())
    }

    async fn drain_images(&mut self, timeout: Duration) -> Result<()> {
        let cloud = self.backends.cloud.clone();

        for image in self.untracked_images().await? {
            debug!(provision_id = self.id(), "Deleting image {}", image);
            cloud.delete_image(image).await?;

            let cloud = cloud.clone();
            self.wait_until(timeout, &format!("image {}", image), move || {
                let cloud = cloud.clone();
                async move { cloud.image_exists(image).await.map(|exists| !exists) }
            })
            .await?;
        }

        if !self.untracked_images().await?.is_empty() {
            return Err(ProvisionError::Recoverable("Still found images".into()));
        }
        Ok(())
    }

    /// Polls `done` every `poll_interval` until it reports true or the
    /// timeout expires
    async fn wait_until<F, Fut>(&self, timeout: Duration, what: &str, mut done: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = provflow_cloud::Result<bool>> + Send,
    {
        let deadline = Instant::now() + timeout;

        loop {
            if done().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::Recoverable(format!(
                    "Timeout expired for deleting {}",
                    what
                )));
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }
}

/// Forced teardowns carry on past a failed drain or destroy
fn tolerate(result: Result<StepOutcome>, force: bool, what: &str) -> Result<()> {
    match result.and_then(StepOutcome::or_cleanup) {
        Ok(_) => Ok(()),
        Err(e) if force => {
            warn!("Ignoring failed {}: {}", what, e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
