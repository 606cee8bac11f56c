//! Hetzner Cloud server adapter.

use std::time::Duration;

use async_trait::async_trait;
use blockhost_types::OrgId;
use serde::Deserialize;
use tokio::time::sleep;

use super::{CloudError, ServerProvider};

const API_BASE: &str = "https://api.hetzner.cloud/v1";
const IMAGE: &str = "docker-ce";
const SERVER_TYPE: &str = "cx11";
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const BOOT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct Server {
    id: u64,
    status: String,
    public_net: PublicNet,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    ipv4: Ipv4,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

pub struct Hetzner {
    http: reqwest::Client,
    token: String,
    ssh_key: String,
    base: String,
}

impl Hetzner {
    pub fn new(token: String, ssh_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            ssh_key,
            base: API_BASE.into(),
        }
    }

    async fn get_by_name(&self, org: &OrgId) -> Result<Option<Server>, CloudError> {
        let list: ServerList = self
            .http
            .get(format!("{}/servers", self.base))
            .query(&[("name", org.to_string())])
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.servers.into_iter().next())
    }

    async fn get_by_id(&self, id: u64) -> Result<Server, CloudError> {
        let envelope: ServerEnvelope = self
            .http
            .get(format!("{}/servers/{id}", self.base))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.server)
    }

    /// Poll until the freshly created server reports `running`, then return
    /// its address.
    async fn wait_until_running(&self, mut server: Server, org: &OrgId) -> Result<String, CloudError> {
        let mut waited = Duration::ZERO;
        while server.status != "running" {
            if waited >= BOOT_TIMEOUT {
                return Err(CloudError::BootTimeout(org.to_string()));
            }
            sleep(BOOT_POLL_INTERVAL).await;
            waited += BOOT_POLL_INTERVAL;
            server = self.get_by_id(server.id).await?;
        }
        tracing::info!(%org, ip = server.public_net.ipv4.ip, "server running");
        Ok(server.public_net.ipv4.ip)
    }
}

#[async_trait]
impl ServerProvider for Hetzner {
    fn name(&self) -> &'static str {
        "hetzner"
    }

    async fn create_server(&self, org: &OrgId) -> Result<String, CloudError> {
        let response = self
            .http
            .post(format!("{}/servers", self.base))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "name": org.to_string(),
                "image": IMAGE,
                "server_type": SERVER_TYPE,
                "ssh_keys": [self.ssh_key],
            }))
            .send()
            .await?;

        if response.status().is_success() {
            let created: ServerEnvelope = response.json().await?;
            tracing::info!(%org, "server created, waiting for boot");
            return self.wait_until_running(created.server, org).await;
        }

        let err: ApiError = response.json().await?;
        if err.error.code == "uniqueness_error" {
            // already reserved for this org; adopt the existing server
            tracing::info!(%org, "server already reserved");
            let existing = self.get_by_name(org).await?.ok_or(CloudError::Api {
                api: "hetzner",
                message: format!("server for {org} exists but cannot be fetched"),
            })?;
            return Ok(existing.public_net.ipv4.ip);
        }
        Err(CloudError::Api {
            api: "hetzner",
            message: err.error.message,
        })
    }

    async fn delete_server(&self, org: &OrgId) -> Result<(), CloudError> {
        let Some(server) = self.get_by_name(org).await? else {
            // gone already: a retried delete that had succeeded
            return Ok(());
        };
        self.http
            .delete(format!("{}/servers/{}", self.base, server.id))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
