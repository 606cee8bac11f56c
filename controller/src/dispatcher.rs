//! The dispatcher: drains the ingress channel, persists every event,
//! applies reorg correction to retracted ones, and routes each event to its
//! org's serial worker, spawning one when needed.

use std::sync::Arc;

use anyhow::Context;
use blockhost_types::{Event, EventKind};
use tokio::sync::mpsc;

use crate::{chain::ChainHead, persistence::Persistence, queue::QueueMap, worker};

pub struct Dispatcher {
    store: Arc<dyn Persistence>,
    queues: Arc<QueueMap>,
    worker_ctx: Arc<worker::WorkerCtx>,
    head: Arc<ChainHead>,
    finality_depth: u64,
    /// Workers outlive the dispatcher loop; their fatal errors surface here.
    worker_fatal: mpsc::UnboundedSender<anyhow::Error>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Persistence>,
        queues: Arc<QueueMap>,
        worker_ctx: Arc<worker::WorkerCtx>,
        head: Arc<ChainHead>,
        finality_depth: u64,
        worker_fatal: mpsc::UnboundedSender<anyhow::Error>,
    ) -> Self {
        Self {
            store,
            queues,
            worker_ctx,
            head,
            finality_depth,
            worker_fatal,
        }
    }

    pub async fn run(self, mut ingress: mpsc::Receiver<Event>) -> anyhow::Result<()> {
        while let Some(mut event) = ingress.recv().await {
            // refusing to silently drop events: a failed upsert is fatal
            self.store
                .upsert_event(&event)
                .await
                .context("persisting event")?;

            if event.removed {
                self.correct_after_removal(&mut event)
                    .await
                    .with_context(|| format!("reorg correction for org {}", event.org))?;
            }

            self.route(event);
        }
        Ok(())
    }

    /// Hand the event to its org's worker, spawning a fresh one if the org
    /// has none (or its last one just retired).
    fn route(&self, event: Event) {
        let org = event.org;
        if let Some(queue) = self.queues.publish(event) {
            tracing::debug!(%org, "spawning org worker");
            let ctx = Arc::clone(&self.worker_ctx);
            let fatal = self.worker_fatal.clone();
            tokio::spawn(async move {
                if let Err(err) = worker::run(ctx, org, queue).await {
                    let _ = fatal.send(err);
                }
            });
        }
    }

    /// The event's hosting block was reorganised away. Rewrite it in place
    /// to the org's effective on-chain state:
    ///
    /// 1. If a surviving event still promises a future expiry, adopt it (the
    ///    event becomes a plain extension), and once that survivor is deep
    ///    enough to be final, garbage-collect everything older.
    /// 2. Otherwise nothing valid remains: convert to a stop at the current
    ///    head so the scheduler tears down on its next tick.
    async fn correct_after_removal(&self, event: &mut Event) -> anyhow::Result<()> {
        let head = self.head.get();
        let survivors = self.store.list_org_events(&event.org).await?;

        if let Some(latest) = survivors.first() {
            if latest.expiry > head {
                tracing::info!(
                    org = %event.org,
                    expiry = latest.expiry,
                    emitted_at = latest.emitted_at,
                    "reorg: surviving event still valid",
                );
                event.kind = EventKind::TopUp;
                event.expiry = latest.expiry;
                if latest.emitted_at + self.finality_depth <= head {
                    if let Err(err) = self
                        .store
                        .delete_org_events_before(&event.org, latest.emitted_at)
                        .await
                    {
                        tracing::warn!(org = %event.org, %err, "failed to prune stale events");
                    }
                }
                return Ok(());
            }
        }

        tracing::info!(org = %event.org, head, "reorg: no surviving event, stopping deployment");
        event.kind = EventKind::DeploymentStopped;
        event.expiry = head;
        Ok(())
    }
}
