//! Scaling operations: more hosts, more addresses

use crate::error::{ProvisionError, Result};
use crate::provision::Provision;
use crate::template::HostDecl;
use provflow_cloud::{EvalContext, ProviderIdentity, ProvisionState, ResourceClass};
use tracing::{info, warn};

/// Hosts to append to a provision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostsRequest {
    /// Synthesized `edge-host<index>` names, indexed from the current host count
    Amount(usize),
    /// Explicit hostnames, for hosts that already exist on premises
    Hostnames(Vec<String>),
}

impl HostsRequest {
    fn hostnames(self, first_index: usize) -> Vec<String> {
        match self {
            HostsRequest::Amount(amount) => (first_index..first_index + amount)
                .map(|i| format!("edge-host{}", i))
                .collect(),
            HostsRequest::Hostnames(hostnames) => hostnames,
        }
    }
}

impl Provision {
    /// Appends hosts modelled on the provision's first host, deploys them
    /// and re-runs configuration. Only valid from RUNNING.
    pub async fn add_hosts(&mut self, request: HostsRequest) -> Result<()> {
        self.begin_operation();
        self.require_state("add hosts to", ProvisionState::Running)?;

        let cluster_id = self.doc.cluster().map(|c| c.id).ok_or(ProvisionError::NoCluster)?;
        let stencil_id = self
            .doc
            .hosts()
            .first()
            .map(|h| h.id)
            .ok_or(ProvisionError::NoHosts)?;

        self.set_state(ProvisionState::Deploying).await?;

        match self.grow(cluster_id, stencil_id, request).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(provision_id = self.id(), "Adding hosts failed: {}", e);
                if !matches!(e, ProvisionError::ConfigurationFailed(_)) {
                    self.mark_error().await;
                }
                Err(e.into_aborted())
            }
        }
    }

    async fn grow(&mut self, cluster_id: i64, stencil_id: i64, request: HostsRequest) -> Result<()> {
        info!(provision_id = self.id(), "Adding more hosts");

        let stencil = self.backends.cloud.info(ResourceClass::Host, stencil_id).await?;
        let stencil = HostDecl::from_existing(&stencil.template);
        let playbook = stencil.playbook();

        let ctx = EvalContext::new(self.id(), self.doc.name.clone(), self.provider_identity().await?);

        let first_index = self.doc.hosts().len();
        let hostnames = request.hostnames(first_index);
        let count = hostnames.len();

        for (offset, hostname) in hostnames.iter().enumerate() {
            let index = first_index + offset;
            let host = stencil.specialize(index, count, Some(hostname.as_str()), self.id());
            let descriptor = self.host_descriptor(host, &ctx.for_index(index))?;

            self.create_host(descriptor, cluster_id, playbook.clone()).await?;
        }

        info!(provision_id = self.id(), "Deploying");
        self.step("Failed to deploy hosts", |p| Box::pin(p.run_host_addition()))
            .await?
            .or_cleanup()?;

        self.configure_resources().await
    }

    async fn run_host_addition(&mut self) -> Result<()> {
        let output = self
            .backends
            .deployer
            .add_hosts(&self.doc, self.doc.tf.as_ref())
            .await?;

        info!(provision_id = self.id(), "Monitoring hosts");
        self.update_hosts(output.addresses.clone(), output.deploy_ids.clone())
            .await?;

        if let Some(automation) = output.automation() {
            self.doc.tf = Some(automation);
        }
        self.persist().await
    }

    async fn provider_identity(&self) -> Result<ProviderIdentity> {
        if self.doc.is_dummy() {
            return Ok(ProviderIdentity::dummy());
        }
        let provider = self
            .backends
            .cloud
            .provider(&self.doc.provider)
            .await?
            .ok_or_else(|| ProvisionError::UnknownProvider(self.doc.provider.clone()))?;
        Ok(provider.identity())
    }

    /// Adds `amount` address ranges to the provision's first network.
    ///
    /// Only valid from RUNNING on an elastic network. Stops at the first
    /// failed request.
    pub async fn add_ips(&mut self, amount: usize) -> Result<()> {
        self.require_state("add IPs to", ProvisionState::Running)?;

        let network_id = self
            .doc
            .networks()
            .first()
            .map(|n| n.id)
            .ok_or(ProvisionError::NoNetworks)?;

        let network = self.backends.cloud.info(ResourceClass::Network, network_id).await?;
        let vn_mad = network.vn_mad().unwrap_or_default();
        if vn_mad != "elastic" {
            return Err(ProvisionError::NotElastic(vn_mad));
        }

        let ar_template = self
            .doc
            .ar_template
            .clone()
            .ok_or(ProvisionError::MissingAddressRange)?;

        info!(provision_id = self.id(), network_id, "Adding more IPs to network {}", network_id);
        for _ in 0..amount {
            self.backends
                .cloud
                .add_address_range(network_id, &ar_template)
                .await?;
        }
        Ok(())
    }
}
