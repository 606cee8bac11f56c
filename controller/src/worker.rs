//! Per-org workers: each drains its org's queue serially and drives the
//! provisioning state machine for every event.

use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use blockhost_types::{DeploymentStatus, Event, EventKind, OrgId};
use tokio::{sync::mpsc, time::sleep};

use crate::{
    cloud::CloudSet,
    expiry::StateUpdate,
    persistence::Persistence,
    queue::{OrgQueue, QueueMap},
};

/// Worker-level retries of a failed event before the process gives up.
const MAX_RETRIES: u32 = 3;

/// Everything a worker needs besides its queue.
pub struct WorkerCtx {
    pub store: Arc<dyn Persistence>,
    pub cloud: Arc<CloudSet>,
    pub queues: Arc<QueueMap>,
    pub updates: mpsc::Sender<StateUpdate>,
    pub retry_delay: Duration,
}

#[derive(Debug)]
enum ProcessError {
    /// Transient; the event is retried after a delay.
    Retry(anyhow::Error),
    /// Persistence failure or invariant violation; the process must surface.
    Fatal(anyhow::Error),
}

fn retry(err: impl Into<anyhow::Error>) -> ProcessError {
    ProcessError::Retry(err.into())
}

/// Drain the org's queue FIFO until it runs dry and the worker can retire.
///
/// An error return is fatal: either persistence failed, an invariant broke,
/// or an event kept failing past its retry budget. The event then blocks its
/// org and human attention is required, so the caller aborts the process.
pub async fn run(ctx: Arc<WorkerCtx>, org: OrgId, queue: Arc<OrgQueue>) -> anyhow::Result<()> {
    loop {
        let Some(event) = queue.pop() else {
            if ctx.queues.try_retire(&org, &queue) {
                tracing::debug!(%org, "org worker retiring");
                return Ok(());
            }
            // a publish won the race; keep draining
            continue;
        };

        let mut failures = 0;
        loop {
            match process_event(&ctx, &event).await {
                Ok(()) => break,
                Err(ProcessError::Fatal(err)) => {
                    return Err(err.context(format!("processing event for org {org}")));
                }
                Err(ProcessError::Retry(err)) => {
                    failures += 1;
                    if failures > MAX_RETRIES {
                        return Err(err.context(format!(
                            "giving up on event for org {org} after {failures} attempts"
                        )));
                    }
                    tracing::warn!(%org, %err, failures, "event processing failed, retrying");
                    sleep(ctx.retry_delay).await;
                }
            }
        }
    }
}

async fn process_event(ctx: &WorkerCtx, event: &Event) -> Result<(), ProcessError> {
    tracing::info!(
        org = %event.org,
        kind = %event.kind,
        expiry = event.expiry,
        "processing event",
    );
    match event.kind {
        EventKind::DeploymentStopped => process_stop(ctx, event).await,
        EventKind::TopUp => process_top_up(ctx, event).await,
    }
}

/// A stop only announces the teardown; the scheduler performs it.
async fn process_stop(ctx: &WorkerCtx, event: &Event) -> Result<(), ProcessError> {
    let provider = ctx
        .store
        .get_provider(&event.org)
        .await
        .map_err(ProcessError::Fatal)?;
    announce(
        ctx,
        StateUpdate::Stop {
            org: event.org,
            provider,
        },
    )
    .await
}

async fn process_top_up(ctx: &WorkerCtx, event: &Event) -> Result<(), ProcessError> {
    let org = event.org;
    let (provider, ip, status) = ctx
        .store
        .upsert_deployment(event)
        .await
        .map_err(ProcessError::Fatal)?;

    if status == DeploymentStatus::Running {
        if provider.is_empty() {
            return Err(ProcessError::Fatal(anyhow!(
                "running deployment for org {org} has no provider"
            )));
        }
        // pure extension: just move the deadline
        return announce(
            ctx,
            StateUpdate::Extend {
                org,
                expiry: event.expiry,
                provider,
            },
        )
        .await;
    }

    // Initial: reserve a server and record where it lives
    let (provider, ip) = if status == DeploymentStatus::Initial {
        let (provider, ip) = ctx.cloud.reserve_server(&org).await.map_err(retry)?;
        ctx.store
            .update_org_server(&org, &ip, &provider)
            .await
            .map_err(ProcessError::Retry)?;
        (provider, ip)
    } else {
        (provider, ip)
    };

    // up to Allocated: the org's A record may not exist yet
    if matches!(
        status,
        DeploymentStatus::Initial | DeploymentStatus::Allocated
    ) {
        ctx.cloud.ensure_dns(&org, &ip).await.map_err(retry)?;
    }

    // everything short of Running falls through to provisioning
    match ctx.cloud.provision(&org, &ip).await {
        Ok(()) => {
            ctx.store
                .set_status(&org, DeploymentStatus::Running)
                .await
                .map_err(ProcessError::Retry)?;
            tracing::info!(%org, ip, "org configured and running");
            announce(
                ctx,
                StateUpdate::Extend {
                    org,
                    expiry: event.expiry,
                    provider,
                },
            )
            .await?;
            // provisioning success counts as processing success; the mark is
            // re-derived by the recovery query if it does not stick
            if let Err(err) = ctx.store.mark_event_processed(&event.block_and_tx).await {
                tracing::warn!(%org, %err, "failed to mark event processed");
            }
            Ok(())
        }
        Err(err) => {
            // terminal for this event: the deployment surfaces as
            // setup-failed and the loop moves on
            tracing::error!(%org, ip, %err, "configuration failed");
            if let Err(err) = ctx
                .store
                .set_status(&org, DeploymentStatus::SetupFailed)
                .await
            {
                tracing::error!(%org, %err, "failed to record setup-failed status");
            }
            Ok(())
        }
    }
}

async fn announce(ctx: &WorkerCtx, update: StateUpdate) -> Result<(), ProcessError> {
    ctx.updates
        .send(update)
        .await
        .map_err(|_| ProcessError::Fatal(anyhow!("expiry scheduler inbox closed")))
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use alloy::primitives::Address;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        cloud::mock::{Call, MockCloud},
        persistence::mem::MemStore,
    };

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

    struct Harness {
        store: Arc<MemStore>,
        cloud: Arc<MockCloud>,
        ctx: Arc<WorkerCtx>,
        updates: mpsc::Receiver<StateUpdate>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemStore::default());
        let cloud = MockCloud::new();
        let (updates_tx, updates) = mpsc::channel(16);
        let ctx = Arc::new(WorkerCtx {
            store: Arc::clone(&store) as Arc<dyn Persistence>,
            cloud: cloud.cloud_set(),
            queues: Arc::new(QueueMap::default()),
            updates: updates_tx,
            retry_delay: Duration::from_millis(10),
        });
        Harness {
            store,
            cloud,
            ctx,
            updates,
        }
    }

    #[tokio::test]
    async fn fresh_top_up_provisions_end_to_end() {
        let mut h = harness();
        let event = top_up(org(1), 100, 10);

        h.store.upsert_event(&event).await.unwrap();
        process_event(&h.ctx, &event).await.unwrap();

        let dep = h.store.deployment(&org(1)).unwrap();
        assert_eq!(dep.expiry, 100);
        assert_eq!(dep.provider, "hetzner");
        assert_eq!(dep.ip, "1.2.3.4");
        assert_eq!(dep.status, DeploymentStatus::Running);
        assert_eq!(h.store.event_processed(&event.block_and_tx), Some(true));

        assert_eq!(
            h.cloud.calls(),
            vec![
                Call::CreateServer(org(1)),
                Call::CreateRecord(org(1), "1.2.3.4".into()),
                Call::Provision(org(1), "1.2.3.4".into()),
            ]
        );
        match h.updates.recv().await.unwrap() {
            StateUpdate::Extend {
                org: o,
                expiry,
                provider,
            } => {
                assert_eq!((o, expiry, provider.as_str()), (org(1), 100, "hetzner"));
            }
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_top_up_is_a_pure_extension() {
        let mut h = harness();
        let first = top_up(org(2), 100, 10);
        process_event(&h.ctx, &first).await.unwrap();
        let calls_after_first = h.cloud.calls().len();

        let second = top_up(org(2), 200, 50);
        process_event(&h.ctx, &second).await.unwrap();

        // no second server reservation, no second dns or playbook run
        assert_eq!(h.cloud.calls().len(), calls_after_first);
        assert_eq!(h.store.deployment(&org(2)).unwrap().expiry, 200);

        h.updates.recv().await.unwrap();
        match h.updates.recv().await.unwrap() {
            StateUpdate::Extend { expiry, .. } => assert_eq!(expiry, 200),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_existing_dns_record_is_success() {
        let h = harness();
        h.cloud.dns_already_exists.store(true, Ordering::Relaxed);

        process_event(&h.ctx, &top_up(org(3), 100, 10))
            .await
            .unwrap();
        assert_eq!(
            h.store.deployment(&org(3)).unwrap().status,
            DeploymentStatus::Running
        );
    }

    #[tokio::test]
    async fn stop_announces_teardown() {
        let mut h = harness();
        process_event(&h.ctx, &top_up(org(4), 100, 10))
            .await
            .unwrap();
        h.updates.recv().await.unwrap();

        let stop = Event {
            kind: EventKind::DeploymentStopped,
            ..top_up(org(4), 30, 30)
        };
        process_event(&h.ctx, &stop).await.unwrap();

        match h.updates.recv().await.unwrap() {
            StateUpdate::Stop { org: o, provider } => {
                assert_eq!((o, provider.as_str()), (org(4), "hetzner"));
            }
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_provisioner_is_a_setup_failure() {
        let h = harness();
        h.cloud.fail_provision.store(true, Ordering::Relaxed);
        let event = top_up(org(5), 100, 10);
        h.store.upsert_event(&event).await.unwrap();

        // the event ends without error; the failure is visible in the status
        process_event(&h.ctx, &event).await.unwrap();
        let dep = h.store.deployment(&org(5)).unwrap();
        assert_eq!(dep.status, DeploymentStatus::SetupFailed);
        assert_eq!(h.store.event_processed(&event.block_and_tx), Some(false));

        // the next top-up resumes from setup-failed: no new server, another
        // provisioning attempt
        h.cloud.fail_provision.store(false, Ordering::Relaxed);
        process_event(&h.ctx, &top_up(org(5), 150, 20))
            .await
            .unwrap();
        let dep = h.store.deployment(&org(5)).unwrap();
        assert_eq!(dep.status, DeploymentStatus::Running);
        let creates = h
            .cloud
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::CreateServer(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn worker_aborts_after_retry_budget() {
        let h = harness();
        h.cloud.fail_create_server.store(true, Ordering::Relaxed);

        let queue = h.ctx.queues.publish(top_up(org(6), 100, 10)).unwrap();
        let result = timeout(
            Duration::from_secs(5),
            run(Arc::clone(&h.ctx), org(6), queue),
        )
        .await
        .expect("worker should give up quickly");
        assert!(result.is_err());

        // initial attempt plus three retries
        assert_eq!(h.cloud.calls().len(), 1 + MAX_RETRIES as usize);
    }

    #[tokio::test]
    async fn events_for_one_org_are_processed_in_order() {
        let mut h = harness();
        let queue = h.ctx.queues.publish(top_up(org(7), 100, 10)).unwrap();
        assert!(h.ctx.queues.publish(top_up(org(7), 200, 11)).is_none());
        assert!(h.ctx.queues.publish(top_up(org(7), 300, 12)).is_none());

        timeout(
            Duration::from_secs(5),
            run(Arc::clone(&h.ctx), org(7), queue),
        )
        .await
        .unwrap()
        .unwrap();

        // the last write wins only if the queue drained FIFO
        assert_eq!(h.store.deployment(&org(7)).unwrap().expiry, 300);
        let expiries: Vec<u64> = std::iter::from_fn(|| h.updates.try_recv().ok())
            .map(|update| match update {
                StateUpdate::Extend { expiry, .. } => expiry,
                other => panic!("unexpected update {other:?}"),
            })
            .collect();
        assert_eq!(expiries, vec![100, 200, 300]);
    }
}
