//! Recording fakes for the adapter traits, shared by the worker, dispatcher
//! and scheduler tests.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use blockhost_types::OrgId;
use parking_lot::Mutex;

use super::{CloudError, CloudSet, DnsProvider, Provisioner, ServerProvider};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateServer(OrgId),
    DeleteServer(OrgId),
    CreateRecord(OrgId, String),
    DeleteRecord(OrgId),
    Provision(OrgId, String),
}

/// One fake standing in for all three adapters, recording every effectful
/// call and failing on demand.
#[derive(Debug, Default)]
pub struct MockCloud {
    calls: Mutex<Vec<Call>>,
    pub fail_create_server: AtomicBool,
    pub fail_provision: AtomicBool,
    pub dns_already_exists: AtomicBool,
}

impl MockCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn cloud_set(self: &Arc<Self>) -> Arc<CloudSet> {
        Arc::new(CloudSet::new(
            vec![Arc::clone(self) as Arc<dyn ServerProvider>],
            Arc::clone(self) as Arc<dyn DnsProvider>,
            Arc::clone(self) as Arc<dyn Provisioner>,
        ))
    }
}

#[async_trait]
impl ServerProvider for MockCloud {
    fn name(&self) -> &'static str {
        "hetzner"
    }

    async fn create_server(&self, org: &OrgId) -> Result<String, CloudError> {
        self.calls.lock().push(Call::CreateServer(*org));
        if self.fail_create_server.load(Ordering::Relaxed) {
            return Err(CloudError::Api {
                api: "mock",
                message: "server creation refused".into(),
            });
        }
        Ok("1.2.3.4".into())
    }

    async fn delete_server(&self, org: &OrgId) -> Result<(), CloudError> {
        self.calls.lock().push(Call::DeleteServer(*org));
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for MockCloud {
    async fn create_record(&self, org: &OrgId, ip: &str) -> Result<(), CloudError> {
        self.calls.lock().push(Call::CreateRecord(*org, ip.into()));
        if self.dns_already_exists.load(Ordering::Relaxed) {
            return Err(CloudError::AlreadyExists(org.to_string()));
        }
        Ok(())
    }

    async fn delete_record(&self, org: &OrgId) -> Result<(), CloudError> {
        self.calls.lock().push(Call::DeleteRecord(*org));
        Ok(())
    }
}

#[async_trait]
impl Provisioner for MockCloud {
    async fn provision(&self, org: &OrgId, ip: &str) -> anyhow::Result<()> {
        self.calls.lock().push(Call::Provision(*org, ip.into()));
        if self.fail_provision.load(Ordering::Relaxed) {
            anyhow::bail!("playbook refused to converge");
        }
        Ok(())
    }
}
