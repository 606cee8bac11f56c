//! Chain-facing tasks: the head tracker and the contract-log ingestor.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::{
    primitives::Address,
    providers::{Provider, ProviderBuilder, WsConnect},
    rpc::types::Filter,
};
use anyhow::Context;
use blockhost_types::Event;
use futures::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use url::Url;

/// Latest observed chain head.
///
/// Single writer (the head tracker), many readers (dispatcher, workers,
/// scheduler). Monotonic non-decreasing over the process lifetime; zero
/// means the tracker has not published yet.
#[derive(Debug, Default)]
pub struct ChainHead(AtomicU64);

impl ChainHead {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Record a newly observed head. An older value never overwrites a
    /// newer one.
    pub fn advance(&self, block: u64) {
        self.0.fetch_max(block, Ordering::Relaxed);
    }

    /// Block until the tracker has published a first head. Nothing can be
    /// scheduled before this resolves.
    pub async fn wait_until_initialized(&self) {
        while self.get() == 0 {
            tracing::info!("waiting for first chain head");
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Poll the chain head every `poll_interval` and publish it. A polling
/// failure is fatal: expiries cannot be scheduled without a head.
pub async fn track_head(
    url: Url,
    head: Arc<ChainHead>,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    let provider = ProviderBuilder::new()
        .on_ws(WsConnect::new(url))
        .await
        .context("connecting head-tracker provider")?;
    loop {
        let block = provider
            .get_block_number()
            .await
            .context("polling chain head")?;
        head.advance(block);
        tracing::info!(block, "chain head");
        sleep(poll_interval).await;
    }
}

/// Replay contract logs from `from`, then forward new ones as they arrive.
///
/// Returns `Ok(())` when the subscription ends (providers drop idle
/// websockets after a few minutes); the supervisor reconnects with a freshly
/// recomputed `from`, and re-delivered logs are absorbed by event-upsert
/// idempotency. Connection and subscription setup failures are fatal.
pub async fn stream_events(
    url: &Url,
    contract: Address,
    from: u64,
    events: &mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    let provider = ProviderBuilder::new()
        .on_ws(WsConnect::new(url.clone()))
        .await
        .context("connecting log-ingestor provider")?;
    let filter = Filter::new().address(contract).from_block(from);

    // history first, so per-org ordering survives restarts
    let history = provider
        .get_logs(&filter)
        .await
        .context("fetching historical contract logs")?;
    for log in &history {
        if let Some(event) = Event::from_log(log) {
            forward(events, event).await?;
        }
    }

    let subscription = provider
        .subscribe_logs(&filter)
        .await
        .context("subscribing to contract logs")?;
    tracing::info!(from, %contract, replayed = history.len(), "contract log stream established");

    let mut stream = subscription.into_stream();
    while let Some(log) = stream.next().await {
        if let Some(event) = Event::from_log(&log) {
            forward(events, event).await?;
        }
    }

    tracing::warn!("contract log stream ended");
    Ok(())
}

async fn forward(events: &mpsc::Sender<Event>, event: Event) -> anyhow::Result<()> {
    tracing::info!(
        org = %event.org,
        kind = %event.kind,
        expiry = event.expiry,
        emitted_at = event.emitted_at,
        removed = event.removed,
        "contract event",
    );
    events
        .send(event)
        .await
        .map_err(|_| anyhow::anyhow!("ingress channel closed"))
}
