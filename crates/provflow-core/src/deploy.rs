//! Dependency-ordered creation pipeline
//!
//! cluster → datastores → networks → hosts → deployment driver →
//! configuration driver → images, marketplace apps, templates, vntemplates,
//! flowtemplates. The document is persisted after every step, so a failure
//! leaves a well-defined prefix of created objects behind.

use crate::error::{ProvisionError, Result};
use crate::provision::{Backends, Provision, expect_created};
use crate::retry::StepOutcome;
use crate::template::{HostDecl, ProvisionTemplate};
use provflow_cloud::{
    CreateOutcome, CreateRequest, DUMMY_PROVIDER, EvalContext, Provider, ProvisionDocument,
    ProvisionState, ResourceClass,
};
use provflow_config::Settings;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Automation phases left out of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Skip {
    /// Deploy and configure
    #[default]
    Nothing,
    /// Deploy, then enable hosts without configuring them
    Config,
    /// Neither deploy nor configure
    All,
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub skip: Skip,

    /// Drain timeout used if the operator aborts and the provision is rolled
    /// back; defaults to `delete_timeout_secs`
    pub timeout: Option<Duration>,

    /// Provider to use instead of the one named by the template
    pub provider: Option<Provider>,
}

/// Result of a deployment that was not rolled back
pub enum DeployOutcome {
    /// Every step ran; the provision is RUNNING
    Deployed(Provision),

    /// Cluster creation was skipped by the operator. Nothing else was
    /// created and the document stays in DEPLOYING.
    ClusterSkipped(Provision),
}

impl DeployOutcome {
    pub fn provision(&self) -> &Provision {
        match self {
            DeployOutcome::Deployed(p) | DeployOutcome::ClusterSkipped(p) => p,
        }
    }

    pub fn into_provision(self) -> Provision {
        match self {
            DeployOutcome::Deployed(p) | DeployOutcome::ClusterSkipped(p) => p,
        }
    }
}

enum Created {
    All,
    ClusterSkipped,
}

impl Provision {
    /// Creates a provision from a template.
    ///
    /// An operator abort rolls back every created object and returns
    /// [`ProvisionError::RolledBack`]. Any other failure after allocation
    /// leaves the document in ERROR.
    pub async fn deploy(
        backends: Backends,
        settings: Settings,
        mut template: ProvisionTemplate,
        options: DeployOptions,
    ) -> Result<DeployOutcome> {
        if options.skip == Skip::Nothing {
            backends.configurator.check_version().await?;
        }

        let provider = match options.provider {
            Some(provider) => provider,
            None => {
                let name = template.read_provider().ok_or(ProvisionError::ProviderNotFound)?;
                backends
                    .cloud
                    .provider(&name)
                    .await?
                    .ok_or_else(|| ProvisionError::UnknownProvider(name.clone()))?
            }
        };

        template.merge_provider_inputs(&provider.inputs);
        template.validate()?;

        let mut doc = ProvisionDocument::new(
            template.name.clone(),
            provider.name.clone().unwrap_or_else(|| DUMMY_PROVIDER.to_string()),
        );
        doc.description = template.description.clone();
        doc.extra = template.extra.clone();

        let timeout = options.timeout.unwrap_or_else(|| settings.delete_timeout());
        let mut provision = Provision::allocate(backends, settings, doc).await?;

        info!(provision_id = provision.id(), name = %template.name, "Allocated provision");

        let ctx = EvalContext::new(provision.id(), template.name.clone(), provider.identity())
            .with_inputs(template.input_values());

        match provision.create_objects(&template, &ctx, options.skip).await {
            Ok(Created::All) => Ok(DeployOutcome::Deployed(provision)),
            Ok(Created::ClusterSkipped) => {
                warn!(provision_id = provision.id(), "Cluster skipped, nothing else was created");
                Ok(DeployOutcome::ClusterSkipped(provision))
            }
            Err(ProvisionError::CleanupRequested(reason)) => {
                let id = provision.id();
                warn!(provision_id = id, "Cleanup requested, rolling back: {}", reason);

                match provision.delete(true, timeout, true).await {
                    Ok(report) => info!(provision_id = id, "Rolled back: {}", report),
                    Err(e) => error!(provision_id = id, "Rollback failed: {}", e),
                }
                Err(ProvisionError::RolledBack { id, reason })
            }
            Err(e) => {
                error!(provision_id = provision.id(), "Deployment failed: {}", e);
                provision.mark_error().await;
                if let Err(unlock) = provision.release().await {
                    warn!("Failed to release provision lock: {}", unlock);
                }
                Err(e)
            }
        }
    }

    async fn create_objects(
        &mut self,
        template: &ProvisionTemplate,
        ctx: &EvalContext,
        skip: Skip,
    ) -> Result<Created> {
        info!(provision_id = self.id(), "Creating provision objects");

        let mut cluster = template.cluster_decl();
        self.backends
            .cloud
            .evaluate_rules(ResourceClass::Cluster, &mut cluster, ctx)?;

        let outcome = self
            .step("Failed to create cluster", move |p| {
                Box::pin(p.create_cluster(cluster.clone()))
            })
            .await?
            .or_cleanup()?;

        if !outcome.completed() {
            return Ok(Created::ClusterSkipped);
        }

        let cluster_id = self.doc.cluster().map(|c| c.id).ok_or(ProvisionError::NoCluster)?;

        for datastore in template.cluster_datastores() {
            self.step("Failed to create cluster", move |p| {
                Box::pin(p.attach_datastore(cluster_id, datastore))
            })
            .await?
            .or_cleanup()?;
        }

        for class in ResourceClass::INFRASTRUCTURE {
            for decl in template.declarations(class) {
                let decl = self.evaluate(class, decl.clone(), ctx)?;
                self.create_tracked(class, decl, Some(cluster_id)).await?;
            }
        }

        self.create_hosts(template, ctx, cluster_id).await?;

        if skip != Skip::All && !self.doc.hosts().is_empty() {
            info!(provision_id = self.id(), "Deploying");
            self.step("Failed to deploy hosts", |p| Box::pin(p.run_deployment()))
                .await?
                .or_cleanup()?;
        }

        if skip == Skip::Nothing {
            self.configure_resources().await?;
        } else {
            self.enable_hosts().await?;
        }

        for class in ResourceClass::RESOURCES {
            for decl in template.declarations(class) {
                let decl = self.evaluate(class, decl.clone(), ctx)?;
                self.create_tracked(class, decl, None).await?;
            }
        }

        self.set_state(ProvisionState::Running).await?;
        info!(provision_id = self.id(), "Provision is RUNNING");

        Ok(Created::All)
    }

    async fn create_cluster(&mut self, decl: Value) -> Result<()> {
        debug!(provision_id = self.id(), "Creating cluster {}", decl["name"]);

        let outcome = self
            .backends
            .cloud
            .create(ResourceClass::Cluster, &CreateRequest::new(decl))
            .await?;
        let cluster = expect_created(ResourceClass::Cluster, outcome)?;

        debug!(provision_id = self.id(), cluster_id = cluster.id, "Cluster created");
        *self.doc.provision.get_mut(ResourceClass::Cluster) = vec![cluster];
        self.persist().await
    }

    async fn attach_datastore(&mut self, cluster_id: i64, datastore_id: i64) -> Result<()> {
        self.backends
            .cloud
            .add_datastore_to_cluster(cluster_id, datastore_id)
            .await?;
        Ok(())
    }

    /// Tags a declaration with the provision and applies the provider rules
    fn evaluate(&self, class: ResourceClass, mut decl: Value, ctx: &EvalContext) -> Result<Value> {
        tag_with_provision(&mut decl, self.id());
        self.backends.cloud.evaluate_rules(class, &mut decl, ctx)?;
        Ok(decl)
    }

    /// Creates one object, then sets its ownership and permissions in a step
    /// of their own. A retried chown or chmod never creates the object again.
    async fn create_tracked(&mut self, class: ResourceClass, decl: Value, cluster_id: Option<i64>) -> Result<()> {
        let tracked = self.doc.objects(class).len();

        let outcome = self
            .step("Failed to create some resources", {
                let decl = decl.clone();
                move |p| Box::pin(p.create_object(class, decl.clone(), cluster_id))
            })
            .await?
            .or_cleanup()?;

        // marketplace apps are tracked as the images and templates they produce
        let Some(id) = self.doc.objects(class).get(tracked).map(|o| o.id) else {
            return Ok(());
        };
        if !outcome.completed() {
            return Ok(());
        }

        self.step("Failed to create some resources", move |p| {
            Box::pin(p.apply_permissions(class, id, decl.clone()))
        })
        .await?
        .or_cleanup()?;
        Ok(())
    }

    async fn create_object(&mut self, class: ResourceClass, decl: Value, cluster_id: Option<i64>) -> Result<()> {
        let cloud = self.backends.cloud.clone();
        debug!(provision_id = self.id(), %class, "Creating {} {}", class.singular(), decl["name"]);

        let mut request = CreateRequest::new(decl.clone());
        if let Some(cluster_id) = cluster_id {
            request = request.in_cluster(cluster_id);
        }
        let outcome = cloud.create(class, &request).await?;

        if class.is_infrastructure() {
            let object = expect_created(class, outcome)?;
            self.doc.provision.push(class, object);

            if class == ResourceClass::Network
                && self.doc.ar_template.is_none()
                && let Some(ar) = decl.get("ar").and_then(Value::as_array).and_then(|a| a.first())
            {
                self.doc.ar_template = Some(ar.clone());
            }
        } else {
            match outcome {
                CreateOutcome::Created(object) => self.doc.provision.push(class, object),
                CreateOutcome::Materialized { image, template } => {
                    if let Some(image) = image {
                        self.doc.provision.push(ResourceClass::Image, image);
                    }
                    if let Some(template) = template {
                        self.doc.provision.push(ResourceClass::Template, template);
                    }
                }
            }
        }

        self.persist().await
    }

    async fn apply_permissions(&mut self, class: ResourceClass, id: i64, decl: Value) -> Result<()> {
        let cloud = self.backends.cloud.clone();
        cloud.template_chown(class, id, &decl).await?;
        cloud.template_chmod(class, id, &decl).await?;
        Ok(())
    }

    async fn create_hosts(
        &mut self,
        template: &ProvisionTemplate,
        ctx: &EvalContext,
        cluster_id: i64,
    ) -> Result<()> {
        let playbooks = template.playbooks();
        let mut index = 0;

        for group in &template.hosts {
            let count = group.count()?;
            let hostnames = group.hostnames();

            for position in 0..count {
                let hostname = hostnames.as_ref().and_then(|h| h.get(position)).cloned();
                let host = group.specialize(index, count, hostname.as_deref(), self.id());
                let descriptor = self.host_descriptor(host, &ctx.for_index(index))?;
                index += 1;

                self.create_host(descriptor, cluster_id, playbooks.clone()).await?;
            }
        }
        Ok(())
    }

    /// Evaluated creation descriptor of one host
    pub(crate) fn host_descriptor(&self, host: HostDecl, ctx: &EvalContext) -> Result<Value> {
        let mut decl = host.into_value();
        self.backends
            .cloud
            .evaluate_rules(ResourceClass::Host, &mut decl, ctx)?;

        Ok(HostDecl(match decl {
            Value::Object(map) => map,
            _ => Map::new(),
        })
        .deployment_descriptor())
    }

    /// Registers a host, then takes it offline in a separate step
    pub(crate) async fn create_host(
        &mut self,
        descriptor: Value,
        cluster_id: i64,
        playbooks: Option<String>,
    ) -> Result<()> {
        let tracked = self.doc.hosts().len();

        let outcome = self
            .step("Failed to create some host", move |p| {
                Box::pin(p.register_host(descriptor.clone(), cluster_id, playbooks.clone()))
            })
            .await?
            .or_cleanup()?;

        let Some(id) = self.doc.hosts().get(tracked).map(|h| h.id) else {
            return Ok(());
        };
        if !outcome.completed() {
            return Ok(());
        }

        self.step("Failed to create some host", move |p| Box::pin(p.host_offline(id)))
            .await?
            .or_cleanup()?;
        Ok(())
    }

    async fn register_host(&mut self, descriptor: Value, cluster_id: i64, playbooks: Option<String>) -> Result<()> {
        let request = CreateRequest::new(descriptor)
            .in_cluster(cluster_id)
            .with_playbooks(playbooks);
        let outcome = self.backends.cloud.create(ResourceClass::Host, &request).await?;
        let host = expect_created(ResourceClass::Host, outcome)?;

        debug!(provision_id = self.id(), host_id = host.id, "Host {} created", host.name);
        self.doc.provision.push(ResourceClass::Host, host);
        self.persist().await
    }

    async fn host_offline(&mut self, id: i64) -> Result<()> {
        self.backends.cloud.host_offline(id).await?;
        Ok(())
    }

    async fn run_deployment(&mut self) -> Result<()> {
        let output = self.backends.deployer.deploy(&self.doc).await?;

        info!(provision_id = self.id(), "Monitoring hosts");
        self.update_hosts(output.addresses.clone(), output.deploy_ids.clone())
            .await?;

        if let Some(automation) = output.automation() {
            self.doc.tf = Some(automation);
        }
        self.persist().await
    }

    /// Renames every new host to its address and records its deployment id.
    ///
    /// Both lists are ordered like the tracked hosts; hosts that already
    /// carry a deployment id consume their slot and are left alone.
    pub(crate) async fn update_hosts(&mut self, addresses: Vec<String>, deploy_ids: Vec<String>) -> Result<()> {
        let cloud = self.backends.cloud.clone();
        let mut addresses = addresses.into_iter();
        let mut deploy_ids = deploy_ids.into_iter();

        let hosts = self.doc.hosts().to_vec();
        for (position, host) in hosts.iter().enumerate() {
            let remote = cloud.info(ResourceClass::Host, host.id).await?;
            let address = addresses.next();
            let deploy_id = deploy_ids.next();

            if remote.deploy_id().is_some() {
                continue;
            }

            let Some(address) = address else {
                return Err(ProvisionError::Recoverable(format!(
                    "Deployment returned no address for host {}",
                    host.id
                )));
            };

            cloud.rename_host(host.id, &address, deploy_id.as_deref()).await?;
            debug!(provision_id = self.id(), host_id = host.id, "Host renamed to {}", address);

            if let Some(entry) = self.doc.provision.get_mut(ResourceClass::Host).get_mut(position) {
                entry.name = address;
            }
        }

        self.cache.invalidate().await;
        Ok(())
    }

    async fn enable_hosts(&mut self) -> Result<()> {
        for host in self.cache.get_objects(ResourceClass::Host, true).await? {
            self.backends.cloud.host_enable(host.id).await?;
        }
        Ok(())
    }

    /// Hands hosts and datastores to the configuration driver.
    ///
    /// The provision ends in RUNNING on success and in ERROR otherwise.
    pub(crate) async fn configure_resources(&mut self) -> Result<()> {
        self.set_state(ProvisionState::Configuring).await?;

        let hosts = self.cache.get_objects(ResourceClass::Host, true).await?;
        let datastores = self.cache.get_objects(ResourceClass::Datastore, true).await?;

        info!(provision_id = self.id(), hosts = hosts.len(), "Configuring hosts");
        let code = self
            .backends
            .configurator
            .configure(&hosts, &datastores, &self.doc)
            .await?;

        if code == 0 {
            self.set_state(ProvisionState::Running).await
        } else {
            self.set_state(ProvisionState::Error).await?;
            Err(ProvisionError::ConfigurationFailed(code))
        }
    }

    /// Re-runs host configuration.
    ///
    /// Without `force` only a provision in ERROR may be configured; with it,
    /// any provision that is not PENDING, DEPLOYING or DELETING.
    pub async fn configure(&mut self, force: bool) -> Result<()> {
        self.begin_operation();
        let state = self.state();
        let allowed = if force {
            !matches!(
                state,
                ProvisionState::Pending | ProvisionState::Deploying | ProvisionState::Deleting
            )
        } else {
            state == ProvisionState::Error
        };

        if !allowed {
            let expected = if force {
                "CONFIGURING, RUNNING or ERROR"
            } else {
                "ERROR"
            };
            return Err(ProvisionError::invalid_state("configure", state, expected));
        }

        self.configure_resources().await
    }
}

/// Records the owning provision in a declaration's `provision` section
fn tag_with_provision(decl: &mut Value, id: i64) {
    let Value::Object(map) = decl else {
        return;
    };
    let provision = map
        .entry("provision")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(provision) = provision {
        provision.insert("id".into(), Value::from(id));
    }
}
