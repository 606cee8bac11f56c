//! Postgres persistence.

use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use blockhost_types::{Deployment, DeploymentStatus, Event, EventKind, OrgId};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::time::sleep;

use super::Persistence;

const CONNECT_RETRIES: usize = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct SqlStore {
    pool: PgPool,
}

impl SqlStore {
    /// Connect and migrate. The database frequently comes up after us, so
    /// connection attempts are retried a few times before giving up.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut attempt = 0;
        let pool = loop {
            attempt += 1;
            match PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await
            {
                Ok(pool) => break pool,
                Err(err) if attempt <= CONNECT_RETRIES => {
                    tracing::warn!(attempt, %err, "database not reachable, retrying");
                    sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(err) => return Err(err).context("connecting to postgres"),
            }
        };
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running database migrations")?;
        tracing::info!("database connected");
        Ok(Self { pool })
    }

    fn decode_event(
        org: &OrgId,
        kind: &str,
        emitted_at: i64,
        expiry: i64,
        block_and_tx: Vec<u8>,
        removed: bool,
    ) -> Result<Event> {
        Ok(Event {
            org: *org,
            kind: EventKind::from_str(kind)?,
            expiry: expiry as u64,
            emitted_at: emitted_at as u64,
            block_and_tx,
            removed,
        })
    }
}

#[async_trait]
impl Persistence for SqlStore {
    async fn upsert_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (block_and_tx, type, org, emitted_at, expiry, removed)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (block_and_tx) DO UPDATE SET removed = $6",
        )
        .bind(event.block_and_tx.as_slice())
        .bind(event.kind.as_str())
        .bind(event.org.to_string())
        .bind(i64::try_from(event.emitted_at)?)
        .bind(i64::try_from(event.expiry)?)
        .bind(event.removed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_event_processed(&self, block_and_tx: &[u8]) -> Result<()> {
        sqlx::query("UPDATE events SET processed = TRUE WHERE block_and_tx = $1")
            .bind(block_and_tx)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_deployment(
        &self,
        event: &Event,
    ) -> Result<(String, String, DeploymentStatus)> {
        // the read must observe the row as of before the write
        let mut tx = self.pool.begin().await?;
        let prior: Option<(String, String, String)> =
            sqlx::query_as("SELECT provider, ip, status FROM deployments WHERE org = $1")
                .bind(event.org.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            "INSERT INTO deployments (org, expiry) VALUES ($1, $2)
             ON CONFLICT (org) DO UPDATE SET expiry = $2",
        )
        .bind(event.org.to_string())
        .bind(i64::try_from(event.expiry)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        match prior {
            Some((provider, ip, status)) => Ok((provider, ip, status.parse()?)),
            None => Ok((String::new(), String::new(), DeploymentStatus::Initial)),
        }
    }

    async fn update_org_server(&self, org: &OrgId, ip: &str, provider: &str) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET ip = $2, provider = $3, status = $4 WHERE org = $1",
        )
        .bind(org.to_string())
        .bind(ip)
        .bind(provider)
        .bind(DeploymentStatus::Allocated.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, org: &OrgId, status: DeploymentStatus) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = $2 WHERE org = $1")
            .bind(org.to_string())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_provider(&self, org: &OrgId) -> Result<String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT provider FROM deployments WHERE org = $1")
                .bind(org.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(provider,)| provider)
            .ok_or_else(|| anyhow::anyhow!("no deployment for org {org}"))
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        let rows: Vec<(String, i64, String, String, String)> = sqlx::query_as(
            "SELECT org, expiry, provider, ip, status FROM deployments ORDER BY expiry ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(org, expiry, provider, ip, status)| {
                Ok(Deployment {
                    org: org.parse()?,
                    expiry: expiry as u64,
                    provider,
                    ip,
                    status: status.parse()?,
                })
            })
            .collect()
    }

    async fn list_org_events(&self, org: &OrgId) -> Result<Vec<Event>> {
        let rows: Vec<(String, i64, i64, Vec<u8>)> = sqlx::query_as(
            "SELECT type, emitted_at, expiry, block_and_tx FROM events
             WHERE org = $1 AND removed = FALSE
             ORDER BY emitted_at DESC",
        )
        .bind(org.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(kind, emitted_at, expiry, block_and_tx)| {
                Self::decode_event(org, &kind, emitted_at, expiry, block_and_tx, false)
            })
            .collect()
    }

    async fn delete_org_events_before(&self, org: &OrgId, emitted_at: u64) -> Result<()> {
        sqlx::query("DELETE FROM events WHERE org = $1 AND emitted_at < $2")
            .bind(org.to_string())
            .bind(i64::try_from(emitted_at)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_org(&self, org: &OrgId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM deployments WHERE org = $1")
            .bind(org.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM events WHERE org = $1")
            .bind(org.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn last_processed_block(&self, fallback: u64) -> Result<u64> {
        let unprocessed: Option<(i64,)> = sqlx::query_as(
            "SELECT emitted_at FROM events
             WHERE processed = FALSE OR removed = TRUE
             ORDER BY emitted_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        if let Some((block,)) = unprocessed {
            return Ok(block as u64);
        }

        let processed: Option<(i64,)> = sqlx::query_as(
            "SELECT emitted_at FROM events
             WHERE processed = TRUE
             ORDER BY emitted_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(processed
            .map(|(block,)| block as u64 + 1)
            .unwrap_or(fallback))
    }
}
