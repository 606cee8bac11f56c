//! Cloudflare DNS adapter. One non-proxied A record per org,
//! `<org>.<domain>`.

use async_trait::async_trait;
use blockhost_types::OrgId;
use serde::Deserialize;

use super::{CloudError, DnsProvider};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const RECORD_TTL: u32 = 3600;
// Cloudflare's "Record already exists." error code
const CODE_RECORD_EXISTS: u64 = 81057;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: u64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Record {
    id: String,
}

pub struct Cloudflare {
    http: reqwest::Client,
    token: String,
    domain: String,
    zone_id: String,
    base: String,
}

impl Cloudflare {
    /// Resolve the zone id for `domain` and return a ready client.
    pub async fn connect(token: String, domain: String) -> Result<Self, CloudError> {
        let http = reqwest::Client::new();
        let base = API_BASE.to_string();
        let response: ApiResponse<Vec<Zone>> = http
            .get(format!("{base}/zones"))
            .query(&[("name", domain.as_str())])
            .bearer_auth(&token)
            .send()
            .await?
            .json()
            .await?;
        let zone_id = response
            .result
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|zone| zone.id)
            .ok_or_else(|| CloudError::Api {
                api: "cloudflare",
                message: format!("no zone found for domain {domain}"),
            })?;
        Ok(Self {
            http,
            token,
            domain,
            zone_id,
            base,
        })
    }

    fn fqdn(&self, org: &OrgId) -> String {
        format!("{org}.{}", self.domain)
    }

    fn api_error(errors: Vec<ApiMessage>) -> CloudError {
        CloudError::Api {
            api: "cloudflare",
            message: errors
                .into_iter()
                .next()
                .map(|e| format!("{} ({})", e.message, e.code))
                .unwrap_or_else(|| "unknown error".into()),
        }
    }
}

#[async_trait]
impl DnsProvider for Cloudflare {
    async fn create_record(&self, org: &OrgId, ip: &str) -> Result<(), CloudError> {
        let fqdn = self.fqdn(org);
        let response: ApiResponse<Record> = self
            .http
            .post(format!("{}/zones/{}/dns_records", self.base, self.zone_id))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "type": "A",
                "name": fqdn,
                "content": ip,
                "ttl": RECORD_TTL,
                "proxied": false,
            }))
            .send()
            .await?
            .json()
            .await?;

        if response.success {
            tracing::info!(%org, fqdn, ip, "dns record created");
            return Ok(());
        }
        if response.errors.iter().any(|e| e.code == CODE_RECORD_EXISTS) {
            return Err(CloudError::AlreadyExists(fqdn));
        }
        Err(Self::api_error(response.errors))
    }

    async fn delete_record(&self, org: &OrgId) -> Result<(), CloudError> {
        let fqdn = self.fqdn(org);
        let response: ApiResponse<Vec<Record>> = self
            .http
            .get(format!("{}/zones/{}/dns_records", self.base, self.zone_id))
            .query(&[("type", "A"), ("name", fqdn.as_str())])
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;
        if !response.success {
            return Err(Self::api_error(response.errors));
        }
        let Some(record) = response.result.unwrap_or_default().into_iter().next() else {
            // no record left: a retried delete that had succeeded
            return Ok(());
        };

        let response: ApiResponse<Record> = self
            .http
            .delete(format!(
                "{}/zones/{}/dns_records/{}",
                self.base, self.zone_id, record.id
            ))
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;
        if !response.success {
            return Err(Self::api_error(response.errors));
        }
        Ok(())
    }
}
