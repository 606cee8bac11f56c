//! Software provisioning over SSH, by shelling out to `ansible-playbook`
//! against a one-host inventory.

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use blockhost_types::OrgId;
use tokio::{process::Command, time::sleep};
use url::Url;

use super::Provisioner;

const ATTEMPTS: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct AnsibleProvisioner {
    playbook: PathBuf,
    ssh_key_path: PathBuf,
    rpc_url: Url,
    subgraph_url: Url,
    domain: String,
}

impl AnsibleProvisioner {
    pub fn new(
        playbook: PathBuf,
        ssh_key_path: PathBuf,
        rpc_url: Url,
        subgraph_url: Url,
        domain: String,
    ) -> Self {
        Self {
            playbook,
            ssh_key_path,
            rpc_url,
            subgraph_url,
            domain,
        }
    }

    async fn run_playbook(&self, org: &OrgId, ip: &str) -> anyhow::Result<bool> {
        let extra_vars = serde_json::json!({
            "org": org.to_string(),
            "rpc_url": self.rpc_url,
            "subgraph_url": self.subgraph_url,
            "domain": self.domain,
        });
        let status = Command::new("ansible-playbook")
            .arg("--inventory")
            .arg(format!("{ip},"))
            .arg("--user")
            .arg("root")
            .arg("--ssh-extra-args")
            .arg(format!("-i {}", self.ssh_key_path.display()))
            .arg("--extra-vars")
            .arg(extra_vars.to_string())
            .arg(&self.playbook)
            .status()
            .await
            .context("spawning ansible-playbook")?;
        Ok(status.success())
    }
}

#[async_trait]
impl Provisioner for AnsibleProvisioner {
    async fn provision(&self, org: &OrgId, ip: &str) -> anyhow::Result<()> {
        for attempt in 1..=ATTEMPTS {
            if self.run_playbook(org, ip).await? {
                return Ok(());
            }
            tracing::warn!(%org, ip, attempt, "playbook run failed");
            if attempt < ATTEMPTS {
                sleep(RETRY_DELAY).await;
            }
        }
        anyhow::bail!("configuration of {org} at {ip} did not converge after {ATTEMPTS} attempts")
    }
}
