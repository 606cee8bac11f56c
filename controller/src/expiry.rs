//! The expiry scheduler: owns the expiry index, fires terminations when the
//! chain head crosses a deadline, and applies state updates announced by the
//! org workers.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use blockhost_types::{ExpiryEntry, ExpiryIndex, OrgId};
use tokio::{sync::mpsc, time::sleep};

use crate::{chain::ChainHead, cloud::CloudSet, persistence::Persistence};

/// Announcements from the org workers. Extensions reschedule the org's
/// teardown; stops tear down synchronously, independent of the head.
#[derive(Clone, Debug)]
pub enum StateUpdate {
    Extend {
        org: OrgId,
        expiry: u64,
        provider: String,
    },
    Stop {
        org: OrgId,
        provider: String,
    },
}

/// Wake at least hourly even with an empty schedule.
const IDLE_WAKE: Duration = Duration::from_secs(3600);
/// Grace between a failed teardown and surfacing it as fatal.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Scheduler {
    store: Arc<dyn Persistence>,
    cloud: Arc<CloudSet>,
    head: Arc<ChainHead>,
    avg_block_time: Duration,
    index: ExpiryIndex,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Persistence>,
        cloud: Arc<CloudSet>,
        head: Arc<ChainHead>,
        avg_block_time: Duration,
    ) -> Self {
        Self {
            store,
            cloud,
            head,
            avg_block_time,
            index: ExpiryIndex::new(),
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<StateUpdate>) -> anyhow::Result<()> {
        // rebuild the schedule from what the store knows
        for dep in self
            .store
            .list_deployments()
            .await
            .context("loading deployments")?
        {
            self.index.add(dep.into());
        }

        loop {
            self.fire_due().await?;

            let next_wake = match self.index.peek() {
                Some(block) => {
                    let blocks_left = block.saturating_sub(self.head.get());
                    self.avg_block_time
                        .saturating_mul(u32::try_from(blocks_left).unwrap_or(u32::MAX))
                }
                None => IDLE_WAKE,
            };

            tokio::select! {
                _ = sleep(next_wake) => {}
                update = inbox.recv() => match update {
                    Some(StateUpdate::Extend { org, expiry, provider }) => {
                        tracing::debug!(%org, expiry, "rescheduling expiry");
                        self.index.add_or_update(ExpiryEntry { org, expiry, provider });
                    }
                    Some(StateUpdate::Stop { org, provider }) => {
                        tracing::info!(%org, "deployment stopped, tearing down");
                        self.index.remove(&org);
                        self.tear_down(&org, &provider).await?;
                    }
                    // inbox closed: the process is shutting down
                    None => return Ok(()),
                }
            }
        }
    }

    /// Terminate every org in every bucket the head has passed.
    async fn fire_due(&mut self) -> anyhow::Result<()> {
        loop {
            let head = self.head.get();
            let Some(block) = self.index.peek() else {
                return Ok(());
            };
            if block > head {
                return Ok(());
            }
            for (org, entry) in self.index.pop_bucket() {
                tracing::info!(%org, expiry = entry.expiry, head, "deployment expired");
                self.tear_down(&org, &entry.provider).await?;
            }
        }
    }

    /// VPS delete, DNS delete, then the org's rows. A failure here means
    /// cleanup can no longer be guaranteed: surface it after a short grace.
    async fn tear_down(&self, org: &OrgId, provider: &str) -> anyhow::Result<()> {
        let result = async {
            self.cloud.terminate_org(org, provider).await?;
            self.store
                .delete_org(org)
                .await
                .context("deleting org records")
        }
        .await;

        if let Err(err) = result {
            tracing::error!(%org, provider, %err, "teardown failed");
            sleep(TEARDOWN_GRACE).await;
            return Err(err.context(format!("tearing down org {org}")));
        }
        Ok(())
    }
}
