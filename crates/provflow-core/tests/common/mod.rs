#![allow(dead_code)]

use async_trait::async_trait;
use provflow_cloud::{
    AutomationState, CloudError, ConfigurationDriver, ControlPlane, CreateOutcome, CreateRequest,
    DeleteOutcome, DeployOutput, DeploymentDriver, DocumentStore, MemoryStore, ObjectRef, Provider,
    ProvisionDocument, RemoteObject, ResourceClass, StoredDocument,
};
use provflow_config::{FailMode, Settings};
use provflow_core::{
    Backends, Decision, DeployOptions, DeployOutcome, Operator, Provision, ProvisionTemplate,
    StepFailure,
};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const EDGE: &str = r#"
name: edge
defaults:
  provision:
    provider_name: aws
playbook: [default]
cluster:
  name: "{{ provision.name }}-cluster"
datastores:
  - name: "{{ provision.name }}-images"
networks:
  - name: "{{ provision.name }}-public"
    vn_mad: elastic
    ar:
      - size: 1
        ipam_mad: aws
hosts:
  - im_mad: kvm
    vm_mad: kvm
    connection:
      remote_user: root
    provision:
      count: 2
      hostname: "edge-host{{ index }}"
"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn settings() -> Settings {
    Settings {
        fail_mode: FailMode::Retry,
        max_retries: 2,
        retry_wait_secs: 0,
        poll_interval_ms: 100,
        delete_timeout_secs: 5,
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CloudState {
    next_id: i64,
    objects: HashMap<(ResourceClass, i64), RemoteObject>,
    providers: HashMap<String, Provider>,
    create_failures: HashMap<ResourceClass, u32>,
    delete_failures: HashSet<(ResourceClass, i64)>,
    call_failures: HashMap<&'static str, u32>,
    marketplace: Option<(Option<ObjectRef>, Option<ObjectRef>)>,
    stuck_vms: bool,
    ar_failure_after: Option<usize>,
    address_ranges: Vec<(i64, Value)>,
    attached_datastores: Vec<(i64, i64)>,
    offline: Vec<i64>,
    enabled: Vec<i64>,
    deleted_vms: Vec<i64>,
    calls: Vec<String>,
}

impl CloudState {
    fn injected_failure(&mut self, call: &'static str) -> provflow_cloud::Result<()> {
        match self.call_failures.get_mut(call) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(CloudError::ApiError(format!("{} rejected", call)))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory control plane
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        let mut state = CloudState {
            next_id: 100,
            ..Default::default()
        };
        state.providers.insert("aws".into(), Provider::new(1, "aws"));
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn register_provider(&self, provider: Provider) {
        let name = provider.name.clone().unwrap_or_default();
        self.state.lock().unwrap().providers.insert(name, provider);
    }

    /// The next `times` creations of `class` fail
    pub fn fail_creates(&self, class: ResourceClass, times: u32) {
        self.state.lock().unwrap().create_failures.insert(class, times);
    }

    /// The next `times` calls of `call` (`offline`, `chown` or
    /// `adddatastore`) fail
    pub fn fail_calls(&self, call: &'static str, times: u32) {
        self.state.lock().unwrap().call_failures.insert(call, times);
    }

    pub fn fail_deletes(&self, class: ResourceClass, id: i64) {
        self.state.lock().unwrap().delete_failures.insert((class, id));
    }

    /// Marketplace apps materialize into the given image and template
    pub fn materialize(&self, image: Option<ObjectRef>, template: Option<ObjectRef>) {
        self.state.lock().unwrap().marketplace = Some((image, template));
    }

    /// Deleted VMs never reach DONE
    pub fn stick_vms(&self) {
        self.state.lock().unwrap().stuck_vms = true;
    }

    pub fn fail_address_ranges_after(&self, successes: usize) {
        self.state.lock().unwrap().ar_failure_after = Some(successes);
    }

    pub fn insert(&self, object: RemoteObject) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((object.class, object.id), object);
    }

    pub fn set_attribute(&self, class: ResourceClass, id: i64, key: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(&(class, id)) {
            object.set_attribute(key, value);
        }
    }

    pub fn place_vms(&self, host_id: i64, vms: &[i64]) {
        self.set_attribute(ResourceClass::Host, host_id, "vms", json!(vms));
        self.set_attribute(ResourceClass::Host, host_id, "running_vms", json!(vms.len()));
    }

    pub fn place_images(&self, datastore_id: i64, images: &[i64]) {
        self.set_attribute(ResourceClass::Datastore, datastore_id, "images", json!(images));
    }

    pub fn object(&self, class: ResourceClass, id: i64) -> Option<RemoteObject> {
        self.state.lock().unwrap().objects.get(&(class, id)).cloned()
    }

    pub fn objects_of(&self, class: ResourceClass) -> Vec<RemoteObject> {
        let mut objects: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .objects
            .values()
            .filter(|o| o.class == class)
            .cloned()
            .collect();
        objects.sort_by_key(|o| o.id);
        objects
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().objects.is_empty()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn address_ranges(&self) -> Vec<(i64, Value)> {
        self.state.lock().unwrap().address_ranges.clone()
    }

    pub fn attached_datastores(&self) -> Vec<(i64, i64)> {
        self.state.lock().unwrap().attached_datastores.clone()
    }

    pub fn offline(&self) -> Vec<i64> {
        self.state.lock().unwrap().offline.clone()
    }

    pub fn enabled(&self) -> Vec<i64> {
        self.state.lock().unwrap().enabled.clone()
    }

    pub fn deleted_vms(&self) -> Vec<i64> {
        self.state.lock().unwrap().deleted_vms.clone()
    }
}

fn name_of(class: ResourceClass, decl: &Value, id: i64) -> String {
    let name = match class {
        ResourceClass::Host => decl["provision"]["hostname"].as_str(),
        _ => decl["name"].as_str(),
    };
    name.map(str::to_string)
        .unwrap_or_else(|| format!("{}{}", class.singular(), id))
}

fn remote_object(class: ResourceClass, id: i64, request: &CreateRequest) -> RemoteObject {
    let decl = &request.decl;
    let name = name_of(class, decl, id);

    match class {
        ResourceClass::Host => {
            let mut template = decl["template"].clone();
            template["provision"] = decl["provision"].clone();
            if !decl["connection"].is_null() {
                template["provision_connection"] = decl["connection"].clone();
            }
            if let Some(playbooks) = &request.playbooks {
                template["ansible_playbook"] = json!(playbooks);
            }
            RemoteObject::new(class, id, name)
                .with_template(template)
                .with_attribute("running_vms", json!(0))
                .with_attribute("vms", json!([]))
        }
        ResourceClass::Network => {
            let mut object = RemoteObject::new(class, id, name).with_template(decl.clone());
            if let Some(vn_mad) = decl["vn_mad"].as_str() {
                object.set_attribute("vn_mad", json!(vn_mad));
            }
            object
        }
        ResourceClass::Datastore => RemoteObject::new(class, id, name)
            .with_template(decl.clone())
            .with_attribute("images", json!([])),
        _ => RemoteObject::new(class, id, name).with_template(decl.clone()),
    }
}

#[async_trait]
impl ControlPlane for FakeCloud {
    async fn provider(&self, name: &str) -> provflow_cloud::Result<Option<Provider>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("provider {}", name));
        Ok(state.providers.get(name).cloned())
    }

    async fn info(&self, class: ResourceClass, id: i64) -> provflow_cloud::Result<RemoteObject> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("info {} {}", class, id));
        state
            .objects
            .get(&(class, id))
            .cloned()
            .ok_or_else(|| CloudError::ResourceNotFound(format!("{} {}", class.singular(), id)))
    }

    async fn create(
        &self,
        class: ResourceClass,
        request: &CreateRequest,
    ) -> provflow_cloud::Result<CreateOutcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create {}", class));

        if let Some(remaining) = state.create_failures.get_mut(&class)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(CloudError::ApiError(format!(
                "failed to allocate {}",
                class.singular()
            )));
        }

        if class == ResourceClass::MarketplaceApp
            && let Some((image, template)) = state.marketplace.clone()
        {
            for (class, object) in [(ResourceClass::Image, &image), (ResourceClass::Template, &template)] {
                if let Some(object) = object {
                    state.objects.insert(
                        (class, object.id),
                        RemoteObject::new(class, object.id, object.name.clone()),
                    );
                }
            }
            return Ok(CreateOutcome::Materialized { image, template });
        }

        let id = state.next_id;
        state.next_id += 1;

        let object = remote_object(class, id, request);
        let reference = object.to_ref();
        state.objects.insert((class, id), object);

        Ok(CreateOutcome::Created(reference))
    }

    async fn delete(
        &self,
        class: ResourceClass,
        id: i64,
        _force: bool,
        automation: Option<&AutomationState>,
    ) -> provflow_cloud::Result<DeleteOutcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete {} {}", class, id));

        if state.delete_failures.contains(&(class, id)) {
            return Err(CloudError::ApiError(format!("{} {} is busy", class.singular(), id)));
        }
        if state.objects.remove(&(class, id)).is_none() {
            return Err(CloudError::ResourceNotFound(format!("{} {}", class.singular(), id)));
        }

        match (class, automation) {
            (ResourceClass::Host, Some(automation)) => Ok(DeleteOutcome::AutomationUpdated(
                AutomationState::new(format!("{}-{}", automation.state, id), automation.conf.clone()),
            )),
            _ => Ok(DeleteOutcome::Deleted),
        }
    }

    async fn add_datastore_to_cluster(&self, cluster_id: i64, datastore_id: i64) -> provflow_cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("adddatastore {} {}", cluster_id, datastore_id));
        state.injected_failure("adddatastore")?;
        state.attached_datastores.push((cluster_id, datastore_id));
        Ok(())
    }

    async fn template_chown(&self, class: ResourceClass, id: i64, _decl: &Value) -> provflow_cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("chown {} {}", class, id));
        state.injected_failure("chown")
    }

    async fn host_offline(&self, id: i64) -> provflow_cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("offline {}", id));
        state.injected_failure("offline")?;
        state.offline.push(id);
        Ok(())
    }

    async fn host_enable(&self, id: i64) -> provflow_cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("enable {}", id));
        state.enabled.push(id);
        Ok(())
    }

    async fn rename_host(&self, id: i64, name: &str, deploy_id: Option<&str>) -> provflow_cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("rename {} {}", id, name));

        let host = state
            .objects
            .get_mut(&(ResourceClass::Host, id))
            .ok_or_else(|| CloudError::ResourceNotFound(format!("host {}", id)))?;
        host.name = name.to_string();
        if let Some(deploy_id) = deploy_id {
            host.template["provision"]["deploy_id"] = json!(deploy_id);
        }
        Ok(())
    }

    async fn delete_vm(&self, id: i64) -> provflow_cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete vm {}", id));
        state.deleted_vms.push(id);

        if !state.stuck_vms {
            for host in state.objects.values_mut().filter(|o| o.class == ResourceClass::Host) {
                let vms: Vec<i64> = host.vm_ids().into_iter().filter(|vm| *vm != id).collect();
                host.set_attribute("running_vms", json!(vms.len()));
                host.set_attribute("vms", json!(vms));
            }
        }
        Ok(())
    }

    async fn vm_done(&self, id: i64) -> provflow_cloud::Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(!state.stuck_vms && state.deleted_vms.contains(&id))
    }

    async fn delete_image(&self, id: i64) -> provflow_cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete image {}", id));
        for datastore in state
            .objects
            .values_mut()
            .filter(|o| o.class == ResourceClass::Datastore)
        {
            let images: Vec<i64> = datastore.image_ids().into_iter().filter(|i| *i != id).collect();
            datastore.set_attribute("images", json!(images));
        }
        Ok(())
    }

    async fn image_exists(&self, id: i64) -> provflow_cloud::Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .values()
            .filter(|o| o.class == ResourceClass::Datastore)
            .any(|d| d.image_ids().contains(&id)))
    }

    async fn add_address_range(&self, network_id: i64, ar_template: &Value) -> provflow_cloud::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("addar {}", network_id));

        if let Some(limit) = state.ar_failure_after
            && state.address_ranges.len() >= limit
        {
            return Err(CloudError::ApiError("address pool exhausted".into()));
        }
        state.address_ranges.push((network_id, ar_template.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

/// Deployment driver assigning `10.0.0.<n>` addresses in host order
#[derive(Default)]
pub struct FakeDeployer {
    deploy_failures: AtomicUsize,
    calls: Mutex<Vec<String>>,
    add_hosts_automation: Mutex<Vec<Option<AutomationState>>>,
    destroyed: Mutex<Vec<AutomationState>>,
}

impl FakeDeployer {
    pub fn fail_deploys(&self, times: usize) {
        self.deploy_failures.store(times, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn add_hosts_automation(&self) -> Vec<Option<AutomationState>> {
        self.add_hosts_automation.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<AutomationState> {
        self.destroyed.lock().unwrap().clone()
    }

    fn output(provision: &ProvisionDocument) -> DeployOutput {
        let hosts = provision.hosts();
        DeployOutput {
            addresses: (1..=hosts.len()).map(|n| format!("10.0.0.{}", n)).collect(),
            deploy_ids: hosts.iter().map(|h| format!("i-{}", h.id)).collect(),
            state: Some(format!("tfstate-{}", hosts.len())),
            conf: Some("tfconf".into()),
        }
    }
}

#[async_trait]
impl DeploymentDriver for FakeDeployer {
    fn name(&self) -> &str {
        "fake"
    }

    async fn deploy(&self, provision: &ProvisionDocument) -> provflow_cloud::Result<DeployOutput> {
        self.calls.lock().unwrap().push("deploy".into());

        let remaining = self.deploy_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.deploy_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CloudError::CommandFailed("apply failed".into()));
        }
        Ok(Self::output(provision))
    }

    async fn add_hosts(
        &self,
        provision: &ProvisionDocument,
        automation: Option<&AutomationState>,
    ) -> provflow_cloud::Result<DeployOutput> {
        self.calls.lock().unwrap().push("add_hosts".into());
        self.add_hosts_automation.lock().unwrap().push(automation.cloned());
        Ok(Self::output(provision))
    }

    async fn destroy(
        &self,
        _provision: &ProvisionDocument,
        automation: &AutomationState,
    ) -> provflow_cloud::Result<()> {
        self.calls.lock().unwrap().push("destroy".into());
        self.destroyed.lock().unwrap().push(automation.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConfigurator {
    exit_code: AtomicI32,
    version_checks: AtomicUsize,
    runs: Mutex<Vec<(usize, usize)>>,
}

impl FakeConfigurator {
    pub fn exit_with(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn version_checks(&self) -> usize {
        self.version_checks.load(Ordering::SeqCst)
    }

    /// (hosts, datastores) handed to each configuration run
    pub fn runs(&self) -> Vec<(usize, usize)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigurationDriver for FakeConfigurator {
    async fn check_version(&self) -> provflow_cloud::Result<()> {
        self.version_checks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn configure(
        &self,
        hosts: &[RemoteObject],
        datastores: &[RemoteObject],
        _provision: &ProvisionDocument,
    ) -> provflow_cloud::Result<i32> {
        self.runs.lock().unwrap().push((hosts.len(), datastores.len()));
        Ok(self.exit_code.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Operator and store
// ---------------------------------------------------------------------------

/// Plays back scripted decisions, then answers with a fallback
pub struct ScriptedOperator {
    script: Mutex<VecDeque<Decision>>,
    fallback: Mutex<Decision>,
    failures: Mutex<Vec<StepFailure>>,
}

impl ScriptedOperator {
    pub fn new(fallback: Decision) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, decisions: &[Decision]) {
        self.script.lock().unwrap().extend(decisions.iter().copied());
    }

    pub fn fallback(&self, decision: Decision) {
        *self.fallback.lock().unwrap() = decision;
    }

    pub fn failures(&self) -> Vec<StepFailure> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn decide(&self, failure: &StepFailure) -> Decision {
        self.failures.lock().unwrap().push(failure.clone());
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or(*self.fallback.lock().unwrap())
    }
}

/// Memory store counting document reads
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    reads: AtomicUsize,
    allocated: Mutex<Vec<i64>>,
}

impl CountingStore {
    /// Id of the most recent allocation
    pub fn last_id(&self) -> i64 {
        *self.allocated.lock().unwrap().last().expect("nothing allocated")
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub async fn is_locked(&self, id: i64) -> bool {
        self.inner.is_locked(id).await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.is_empty().await
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn allocate(&self, name: &str, body: Value) -> provflow_cloud::Result<i64> {
        let id = self.inner.allocate(name, body).await?;
        self.allocated.lock().unwrap().push(id);
        Ok(id)
    }

    async fn info(&self, id: i64) -> provflow_cloud::Result<StoredDocument> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.info(id).await
    }

    async fn update(&self, id: i64, body: Value, expected_version: u64) -> provflow_cloud::Result<u64> {
        self.inner.update(id, body, expected_version).await
    }

    async fn delete(&self, id: i64) -> provflow_cloud::Result<()> {
        self.inner.delete(id).await
    }

    async fn lock(&self, id: i64) -> provflow_cloud::Result<()> {
        self.inner.lock(id).await
    }

    async fn unlock(&self, id: i64) -> provflow_cloud::Result<()> {
        self.inner.unlock(id).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<CountingStore>,
    pub cloud: Arc<FakeCloud>,
    pub deployer: Arc<FakeDeployer>,
    pub configurator: Arc<FakeConfigurator>,
    pub operator: Arc<ScriptedOperator>,
}

impl Harness {
    /// Failed steps are retried up to `settings().max_retries` times
    pub fn new() -> Self {
        init_tracing();
        Self {
            store: Arc::new(CountingStore::default()),
            cloud: Arc::new(FakeCloud::new()),
            deployer: Arc::new(FakeDeployer::default()),
            configurator: Arc::new(FakeConfigurator::default()),
            operator: Arc::new(ScriptedOperator::new(Decision::Retry)),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends::new(
            self.store.clone(),
            self.cloud.clone(),
            self.deployer.clone(),
            self.configurator.clone(),
            &settings(),
        )
        .with_operator(self.operator.clone())
    }

    pub async fn deploy(&self, yaml: &str, options: DeployOptions) -> provflow_core::Result<DeployOutcome> {
        let template = ProvisionTemplate::from_yaml_str(yaml)?;
        Provision::deploy(self.backends(), settings(), template, options).await
    }

    /// Deploys `yaml` and returns the RUNNING provision, still locked
    pub async fn deploy_running(&self, yaml: &str) -> Provision {
        match self.deploy(yaml, DeployOptions::default()).await {
            Ok(DeployOutcome::Deployed(provision)) => provision,
            Ok(DeployOutcome::ClusterSkipped(_)) => panic!("cluster was skipped"),
            Err(e) => panic!("deployment failed: {}", e),
        }
    }

    pub async fn open(&self, id: i64) -> Provision {
        match Provision::open(self.backends(), settings(), id).await {
            Ok(provision) => provision,
            Err(e) => panic!("failed to open provision {}: {}", id, e),
        }
    }

    pub async fn stored(&self, id: i64) -> StoredDocument {
        self.store.info(id).await.unwrap()
    }

    pub async fn stored_doc(&self, id: i64) -> ProvisionDocument {
        ProvisionDocument::from_value(self.stored(id).await.body).unwrap()
    }
}
