//! In-memory persistence, mirroring the Postgres backend's semantics for
//! tests and local experiments.

use anyhow::Result;
use async_trait::async_trait;
use blockhost_types::{Deployment, DeploymentStatus, Event, OrgId};
use parking_lot::Mutex;

use super::Persistence;

#[derive(Clone, Debug)]
struct StoredEvent {
    event: Event,
    processed: bool,
}

#[derive(Debug, Default)]
struct State {
    deployments: Vec<Deployment>,
    events: Vec<StoredEvent>,
}

#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<State>,
}

impl MemStore {
    /// Test hook: the org's deployment row, if any.
    pub fn deployment(&self, org: &OrgId) -> Option<Deployment> {
        self.state
            .lock()
            .deployments
            .iter()
            .find(|d| d.org == *org)
            .cloned()
    }

    /// Test hook: processed flag of the event with this identity.
    pub fn event_processed(&self, block_and_tx: &[u8]) -> Option<bool> {
        self.state
            .lock()
            .events
            .iter()
            .find(|s| s.event.block_and_tx == block_and_tx)
            .map(|s| s.processed)
    }

    /// Test hook: number of stored events, removed ones included.
    pub fn stored_events(&self) -> usize {
        self.state.lock().events.len()
    }
}

#[async_trait]
impl Persistence for MemStore {
    async fn upsert_event(&self, event: &Event) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(stored) = state
            .events
            .iter_mut()
            .find(|s| s.event.block_and_tx == event.block_and_tx)
        {
            stored.event.removed = event.removed;
            return Ok(());
        }
        state.events.push(StoredEvent {
            event: event.clone(),
            processed: false,
        });
        Ok(())
    }

    async fn mark_event_processed(&self, block_and_tx: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(stored) = state
            .events
            .iter_mut()
            .find(|s| s.event.block_and_tx == block_and_tx)
        {
            stored.processed = true;
        }
        Ok(())
    }

    async fn upsert_deployment(
        &self,
        event: &Event,
    ) -> Result<(String, String, DeploymentStatus)> {
        let mut state = self.state.lock();
        if let Some(dep) = state.deployments.iter_mut().find(|d| d.org == event.org) {
            let prior = (dep.provider.clone(), dep.ip.clone(), dep.status);
            dep.expiry = event.expiry;
            return Ok(prior);
        }
        state.deployments.push(Deployment {
            org: event.org,
            expiry: event.expiry,
            provider: String::new(),
            ip: String::new(),
            status: DeploymentStatus::Initial,
        });
        Ok((String::new(), String::new(), DeploymentStatus::Initial))
    }

    async fn update_org_server(&self, org: &OrgId, ip: &str, provider: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(dep) = state.deployments.iter_mut().find(|d| d.org == *org) {
            dep.ip = ip.into();
            dep.provider = provider.into();
            dep.status = DeploymentStatus::Allocated;
        }
        Ok(())
    }

    async fn set_status(&self, org: &OrgId, status: DeploymentStatus) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(dep) = state.deployments.iter_mut().find(|d| d.org == *org) {
            dep.status = status;
        }
        Ok(())
    }

    async fn get_provider(&self, org: &OrgId) -> Result<String> {
        self.state
            .lock()
            .deployments
            .iter()
            .find(|d| d.org == *org)
            .map(|d| d.provider.clone())
            .ok_or_else(|| anyhow::anyhow!("no deployment for org {org}"))
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        let mut deployments = self.state.lock().deployments.clone();
        deployments.sort_by_key(|d| d.expiry);
        Ok(deployments)
    }

    async fn list_org_events(&self, org: &OrgId) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .state
            .lock()
            .events
            .iter()
            .filter(|s| s.event.org == *org && !s.event.removed)
            .map(|s| s.event.clone())
            .collect();
        events.sort_by(|a, b| b.emitted_at.cmp(&a.emitted_at));
        Ok(events)
    }

    async fn delete_org_events_before(&self, org: &OrgId, emitted_at: u64) -> Result<()> {
        self.state
            .lock()
            .events
            .retain(|s| s.event.org != *org || s.event.emitted_at >= emitted_at);
        Ok(())
    }

    async fn delete_org(&self, org: &OrgId) -> Result<()> {
        let mut state = self.state.lock();
        state.deployments.retain(|d| d.org != *org);
        state.events.retain(|s| s.event.org != *org);
        Ok(())
    }

    async fn last_processed_block(&self, fallback: u64) -> Result<u64> {
        let state = self.state.lock();
        if let Some(block) = state
            .events
            .iter()
            .filter(|s| !s.processed || s.event.removed)
            .map(|s| s.event.emitted_at)
            .min()
        {
            return Ok(block);
        }
        Ok(state
            .events
            .iter()
            .filter(|s| s.processed)
            .map(|s| s.event.emitted_at)
            .max()
            .map(|block| block + 1)
            .unwrap_or(fallback))
    }
}
