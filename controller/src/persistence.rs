//! The store the control loop recovers from.
//!
//! Events are persisted before they are dispatched and deployments track the
//! cloud-world state per org, so that a killed and restarted process can
//! recompute its ingestion resume point and reload the expiry schedule. The
//! production backend is Postgres ([`sql`]); [`mem`] backs tests.

use anyhow::Result;
use async_trait::async_trait;
use blockhost_types::{Deployment, DeploymentStatus, Event, OrgId};

pub mod mem;
pub mod sql;

#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Record an event. Idempotent on `block_and_tx`: a re-delivered copy
    /// only overwrites the `removed` flag.
    async fn upsert_event(&self, event: &Event) -> Result<()>;

    async fn mark_event_processed(&self, block_and_tx: &[u8]) -> Result<()>;

    /// Upsert `{org, expiry}` and return `(provider, ip, status)` as the row
    /// stood *before* the write (`("", "", Initial)` when absent), so the
    /// caller can tell a fresh org from a pure extension.
    async fn upsert_deployment(
        &self,
        event: &Event,
    ) -> Result<(String, String, DeploymentStatus)>;

    /// Record the reserved server; moves the deployment to `Allocated`.
    async fn update_org_server(&self, org: &OrgId, ip: &str, provider: &str) -> Result<()>;

    async fn set_status(&self, org: &OrgId, status: DeploymentStatus) -> Result<()>;

    /// Provider tag of the org's deployment; an org without a deployment is
    /// an error.
    async fn get_provider(&self, org: &OrgId) -> Result<String>;

    /// All deployments, ascending by expiry.
    async fn list_deployments(&self) -> Result<Vec<Deployment>>;

    /// The org's events that still stand (`removed = false`), newest first.
    async fn list_org_events(&self, org: &OrgId) -> Result<Vec<Event>>;

    async fn delete_org_events_before(&self, org: &OrgId, emitted_at: u64) -> Result<()>;

    /// Delete the org's deployment and, cascading, its events.
    async fn delete_org(&self, org: &OrgId) -> Result<()>;

    /// Resume point for the ingestor: the smallest unprocessed (or removed)
    /// `emitted_at`, else the largest processed one plus one, else
    /// `fallback` (normally the current head).
    async fn last_processed_block(&self, fallback: u64) -> Result<u64>;
}

#[cfg(test)]
mod test {
    use alloy::primitives::Address;
    use blockhost_types::EventKind;

    use super::{mem::MemStore, *};

    fn org(n: u8) -> OrgId {
        Address::repeat_byte(n).into()
    }

    fn top_up(org: OrgId, expiry: u64, emitted_at: u64) -> Event {
        Event {
            org,
            kind: EventKind::TopUp,
            expiry,
            emitted_at,
            block_and_tx: [emitted_at.to_be_bytes(), expiry.to_be_bytes()].concat(),
            removed: false,
        }
    }

    #[tokio::test]
    async fn upsert_event_is_idempotent() {
        let store = MemStore::default();
        let org = org(1);
        let event = top_up(org, 100, 10);

        store.upsert_event(&event).await.unwrap();
        store.upsert_event(&event).await.unwrap();
        assert_eq!(store.list_org_events(&org).await.unwrap(), vec![event.clone()]);

        // the re-delivered copy flips only the removed flag
        let mut removed = event.clone();
        removed.removed = true;
        store.upsert_event(&removed).await.unwrap();
        assert!(store.list_org_events(&org).await.unwrap().is_empty());
        assert_eq!(store.stored_events(), 1);
    }

    #[tokio::test]
    async fn upsert_deployment_returns_pre_write_state() {
        let store = MemStore::default();
        let org = org(2);

        let (provider, ip, status) =
            store.upsert_deployment(&top_up(org, 100, 10)).await.unwrap();
        assert_eq!(
            (provider.as_str(), ip.as_str(), status),
            ("", "", DeploymentStatus::Initial)
        );

        store.update_org_server(&org, "1.2.3.4", "hetzner").await.unwrap();
        store.set_status(&org, DeploymentStatus::Running).await.unwrap();

        // second top-up observes the pre-write row but still bumps expiry
        let (provider, ip, status) =
            store.upsert_deployment(&top_up(org, 200, 50)).await.unwrap();
        assert_eq!(
            (provider.as_str(), ip.as_str(), status),
            ("hetzner", "1.2.3.4", DeploymentStatus::Running)
        );
        let deployments = store.list_deployments().await.unwrap();
        assert_eq!(deployments[0].expiry, 200);
        assert_eq!(deployments[0].status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn deployments_list_ascending_by_expiry() {
        let store = MemStore::default();
        store.upsert_deployment(&top_up(org(1), 300, 1)).await.unwrap();
        store.upsert_deployment(&top_up(org(2), 100, 2)).await.unwrap();
        store.upsert_deployment(&top_up(org(3), 200, 3)).await.unwrap();

        let expiries: Vec<u64> = store
            .list_deployments()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.expiry)
            .collect();
        assert_eq!(expiries, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn delete_org_cascades_to_events() {
        let store = MemStore::default();
        let org = org(4);
        store.upsert_event(&top_up(org, 100, 10)).await.unwrap();
        store.upsert_deployment(&top_up(org, 100, 10)).await.unwrap();

        store.delete_org(&org).await.unwrap();
        assert!(store.list_deployments().await.unwrap().is_empty());
        assert_eq!(store.stored_events(), 0);
        assert!(store.get_provider(&org).await.is_err());
    }

    #[tokio::test]
    async fn recovery_prefers_smallest_unprocessed() {
        let store = MemStore::default();
        let org = org(5);

        // nothing stored: fall back to the current head
        assert_eq!(store.last_processed_block(77).await.unwrap(), 77);

        let early = top_up(org, 100, 10);
        let late = top_up(org, 200, 20);
        store.upsert_event(&early).await.unwrap();
        store.upsert_event(&late).await.unwrap();
        assert_eq!(store.last_processed_block(77).await.unwrap(), 10);

        store.mark_event_processed(&early.block_and_tx).await.unwrap();
        assert_eq!(store.last_processed_block(77).await.unwrap(), 20);

        // everything processed: resume just past the newest processed event
        store.mark_event_processed(&late.block_and_tx).await.unwrap();
        assert_eq!(store.last_processed_block(77).await.unwrap(), 21);

        // a reorged-out event re-opens its block even though it was processed
        let mut removed = early.clone();
        removed.removed = true;
        store.upsert_event(&removed).await.unwrap();
        assert_eq!(store.last_processed_block(77).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn org_events_newest_first_and_prunable() {
        let store = MemStore::default();
        let org = org(6);
        store.upsert_event(&top_up(org, 100, 10)).await.unwrap();
        store.upsert_event(&top_up(org, 150, 12)).await.unwrap();
        store.upsert_event(&top_up(org, 200, 15)).await.unwrap();

        let emitted: Vec<u64> = store
            .list_org_events(&org)
            .await
            .unwrap()
            .iter()
            .map(|e| e.emitted_at)
            .collect();
        assert_eq!(emitted, vec![15, 12, 10]);

        store.delete_org_events_before(&org, 15).await.unwrap();
        let emitted: Vec<u64> = store
            .list_org_events(&org)
            .await
            .unwrap()
            .iter()
            .map(|e| e.emitted_at)
            .collect();
        assert_eq!(emitted, vec![15]);
    }
}
