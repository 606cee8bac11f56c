//! Cloud adapters: VPS providers, DNS, and the provisioning step, behind
//! thin traits so the control loop only sees effectful operations and their
//! error surface.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use blockhost_types::OrgId;
use rand::seq::SliceRandom;

pub mod cloudflare;
pub mod hetzner;
pub mod provision;

#[cfg(test)]
pub mod mock;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The named resource already exists. Callers that create idempotently
    /// treat this as success.
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("timed out waiting for server {0} to reach `running`")]
    BootTimeout(String),
    #[error("{api} api error: {message}")]
    Api {
        api: &'static str,
        message: String,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// A VPS provider the loop can rent servers from.
#[async_trait]
pub trait ServerProvider: Send + Sync + 'static {
    /// Stable tag persisted with the deployment, used to route termination.
    fn name(&self) -> &'static str;

    /// Create the VPS named after the org and return its IPv4 once the
    /// server runs. A name collision means the server was already reserved
    /// for this org; its address is returned instead.
    async fn create_server(&self, org: &OrgId) -> Result<String, CloudError>;

    /// Delete the org's VPS. A server that no longer exists is a retried
    /// delete that already succeeded.
    async fn delete_server(&self, org: &OrgId) -> Result<(), CloudError>;
}

/// The DNS zone orgs are served under.
#[async_trait]
pub trait DnsProvider: Send + Sync + 'static {
    async fn create_record(&self, org: &OrgId, ip: &str) -> Result<(), CloudError>;
    async fn delete_record(&self, org: &OrgId) -> Result<(), CloudError>;
}

/// The step that logs into a fresh server and installs the software stack.
/// Opaque, idempotent and internally retried; invoked once per transition
/// into `Running`.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn provision(&self, org: &OrgId, ip: &str) -> anyhow::Result<()>;
}

/// Every adapter handle the loop needs, bundled so components take one
/// constructor parameter instead of reaching for globals.
pub struct CloudSet {
    providers: Vec<Arc<dyn ServerProvider>>,
    dns: Arc<dyn DnsProvider>,
    provisioner: Arc<dyn Provisioner>,
}

impl CloudSet {
    pub fn new(
        providers: Vec<Arc<dyn ServerProvider>>,
        dns: Arc<dyn DnsProvider>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            providers,
            dns,
            provisioner,
        }
    }

    /// Reserve a VPS from a uniformly random configured provider and return
    /// `(provider tag, ip)`. With a single configured provider the
    /// randomness is a no-op.
    pub async fn reserve_server(&self, org: &OrgId) -> Result<(String, String), CloudError> {
        let provider = self
            .providers
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| CloudError::Api {
                api: "cloud",
                message: "no server providers configured".into(),
            })?;
        let ip = provider.create_server(org).await?;
        Ok((provider.name().to_string(), ip))
    }

    /// Create the org's A record; a pre-existing record is success.
    pub async fn ensure_dns(&self, org: &OrgId, ip: &str) -> Result<(), CloudError> {
        match self.dns.create_record(org, ip).await {
            Err(CloudError::AlreadyExists(record)) => {
                tracing::debug!(%org, record, "dns record already present");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn provision(&self, org: &OrgId, ip: &str) -> anyhow::Result<()> {
        self.provisioner.provision(org, ip).await
    }

    /// Tear down everything created for the org: the VPS, then the DNS
    /// record. A provider tag nothing is configured for is an invariant
    /// violation.
    pub async fn terminate_org(&self, org: &OrgId, provider: &str) -> anyhow::Result<()> {
        let Some(target) = self.providers.iter().find(|p| p.name() == provider) else {
            anyhow::bail!("no configured provider `{provider}` owns org {org}");
        };
        target
            .delete_server(org)
            .await
            .with_context(|| format!("deleting server for org {org}"))?;
        self.dns
            .delete_record(org)
            .await
            .with_context(|| format!("deleting dns record for org {org}"))?;
        tracing::info!(%org, provider, "cloud resources terminated");
        Ok(())
    }
}
