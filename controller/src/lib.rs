//! The blockhost controller: a control loop renting VPS instances on behalf
//! of on-chain customers.
//!
//! A payment contract emits `NewTopUp` events extending an org's paid-for
//! deadline and `DeploymentStopped` events ending service. For every org the
//! loop converges the cloud world — a VPS, a DNS record, a provisioned
//! software stack — to the latest on-chain intent, and tears it down when
//! the deadline passes the chain head or the customer stops explicitly.
//!
//! Long-running tasks and how events flow between them:
//!
//! ```text
//! ingestor -> ingress -> dispatcher -> per-org queue -> org worker
//!                                                         |
//!                head tracker -> currentBlock         state updates
//!                                     |                   |
//!                                     v                   v
//!                              expiry scheduler <---------+
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::{sync::mpsc, time::sleep};

pub mod chain;
pub mod cloud;
pub mod dispatcher;
pub mod expiry;
pub mod logging;
pub mod options;
pub mod persistence;
pub mod queue;
pub mod worker;

use chain::ChainHead;
use cloud::{
    cloudflare::Cloudflare, hetzner::Hetzner, provision::AnsibleProvisioner, CloudSet,
    DnsProvider, Provisioner, ServerProvider,
};
use dispatcher::Dispatcher;
use expiry::Scheduler;
use options::Options;
use persistence::{sql::SqlStore, Persistence};
use queue::QueueMap;
use tokio::task::JoinSet;
use worker::WorkerCtx;

const INGRESS_CAPACITY: usize = 256;
const UPDATES_CAPACITY: usize = 256;

/// Run the control loop until something fatal surfaces. Never returns
/// otherwise.
pub async fn run(opt: Options) -> anyhow::Result<()> {
    let store: Arc<dyn Persistence> = Arc::new(SqlStore::connect(&opt.database_url).await?);

    let cloud = Arc::new(CloudSet::new(
        vec![Arc::new(Hetzner::new(
            opt.hetzner_token.clone(),
            opt.hetzner_ssh_key.clone(),
        )) as Arc<dyn ServerProvider>],
        Arc::new(Cloudflare::connect(opt.cloudflare_token.clone(), opt.domain.clone()).await?)
            as Arc<dyn DnsProvider>,
        Arc::new(AnsibleProvisioner::new(
            opt.playbook.clone(),
            opt.ssh_key_path.clone(),
            opt.rpc_url.clone(),
            opt.subgraph_url.clone(),
            opt.domain.clone(),
        )) as Arc<dyn Provisioner>,
    ));

    let head = Arc::new(ChainHead::default());
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // the head tracker comes up first: nothing can be scheduled or ingested
    // without a head
    {
        let head = Arc::clone(&head);
        let url = opt.l1_ws.clone();
        let interval = opt.head_poll_interval;
        tasks.spawn(async move { chain::track_head(url, head, interval).await });
    }
    tokio::select! {
        () = head.wait_until_initialized() => {}
        res = tasks.join_next() => {
            return match res {
                Some(Ok(Ok(()))) => anyhow::bail!("head tracker exited before publishing a head"),
                Some(Ok(Err(err))) => Err(err),
                Some(Err(err)) => Err(err).context("head tracker panicked"),
                None => anyhow::bail!("head tracker was never spawned"),
            };
        }
    }

    let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);
    let (updates_tx, updates_rx) = mpsc::channel(UPDATES_CAPACITY);
    let (worker_fatal_tx, mut worker_fatal_rx) = mpsc::unbounded_channel();

    let queues = Arc::new(QueueMap::default());
    let worker_ctx = Arc::new(WorkerCtx {
        store: Arc::clone(&store),
        cloud: Arc::clone(&cloud),
        queues: Arc::clone(&queues),
        updates: updates_tx,
        retry_delay: opt.retry_delay,
    });

    // ingestor, restarted with a recomputed resume block whenever its
    // subscription drops
    {
        let store = Arc::clone(&store);
        let head = Arc::clone(&head);
        let url = opt.l2_ws.clone();
        let contract = opt.contract_address;
        let reconnect_delay = opt.reconnect_delay;
        tasks.spawn(async move {
            loop {
                let from = store
                    .last_processed_block(head.get())
                    .await
                    .context("computing ingestion resume block")?;
                chain::stream_events(&url, contract, from, &ingress_tx).await?;
                sleep(reconnect_delay).await;
            }
        });
    }

    {
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&cloud),
            Arc::clone(&head),
            opt.avg_block_time,
        );
        tasks.spawn(scheduler.run(updates_rx));
    }

    {
        let dispatcher = Dispatcher::new(
            store,
            queues,
            worker_ctx,
            head,
            opt.finality_depth,
            worker_fatal_tx,
        );
        tasks.spawn(dispatcher.run(ingress_rx));
    }

    // first fatal wins: a core task ending, a core task failing, or a worker
    // giving up on an event
    tokio::select! {
        Some(err) = worker_fatal_rx.recv() => Err(err),
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) => anyhow::bail!("a core task exited unexpectedly"),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(err)) => Err(err).context("a core task panicked"),
            None => anyhow::bail!("no core tasks are running"),
        },
    }
}
