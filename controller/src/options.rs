use std::{path::PathBuf, time::Duration};

use alloy::primitives::Address;
use clap::Parser;
use url::Url;

use crate::logging;

#[derive(Debug, thiserror::Error)]
#[error("invalid duration `{0}`, expected e.g. `30`, `10s`, `5m` or `1h`")]
pub struct ParseDurationError(String);

/// Parse durations given as bare seconds or with an `s`/`m`/`h` suffix.
pub fn parse_duration(s: &str) -> Result<Duration, ParseDurationError> {
    let err = || ParseDurationError(s.into());
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => s.split_at(split),
        None => (s, "s"),
    };
    let value: u64 = digits.parse().map_err(|_| err())?;
    let seconds = match unit.trim() {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => return Err(err()),
    };
    Ok(Duration::from_secs(seconds))
}

/// Runtime configuration for the blockhost controller. Every knob can be set
/// via the environment; unknown env keys are ignored.
#[derive(Clone, Debug, Parser)]
#[command(version, about = "Control loop renting VPS instances for on-chain orgs")]
pub struct Options {
    /// Websocket endpoint used to track the settlement-chain head.
    #[clap(long, env = "BLOCKHOST_L1_WS")]
    pub l1_ws: Url,

    /// Websocket endpoint the payment-contract logs are read from.
    #[clap(long, env = "BLOCKHOST_L2_WS")]
    pub l2_ws: Url,

    /// Address of the payment contract.
    #[clap(long, env = "BLOCKHOST_CONTRACT_ADDRESS")]
    pub contract_address: Address,

    /// Postgres DSN.
    #[clap(long, env = "BLOCKHOST_DATABASE_URL")]
    pub database_url: String,

    /// Hetzner Cloud API token.
    #[clap(long, env = "BLOCKHOST_HETZNER_TOKEN")]
    pub hetzner_token: String,

    /// Name of the SSH key uploaded to Hetzner, installed on new servers.
    #[clap(long, env = "BLOCKHOST_HETZNER_SSH_KEY")]
    pub hetzner_ssh_key: String,

    /// Cloudflare API token with DNS edit access to the zone.
    #[clap(long, env = "BLOCKHOST_CLOUDFLARE_TOKEN")]
    pub cloudflare_token: String,

    /// DNS zone orgs are served under; org `0xabc…` gets `0xabc….<domain>`.
    #[clap(long, env = "BLOCKHOST_DOMAIN")]
    pub domain: String,

    /// Private key used to reach fresh servers during provisioning.
    #[clap(long, env = "BLOCKHOST_SSH_KEY_PATH")]
    pub ssh_key_path: PathBuf,

    /// Setup playbook run against every fresh server.
    #[clap(long, env = "BLOCKHOST_PLAYBOOK", default_value = "ansible/setup.yml")]
    pub playbook: PathBuf,

    /// RPC url handed to the provisioned software stack.
    #[clap(long, env = "BLOCKHOST_RPC_URL")]
    pub rpc_url: Url,

    /// Subgraph url handed to the provisioned software stack.
    #[clap(long, env = "BLOCKHOST_SUBGRAPH_URL")]
    pub subgraph_url: Url,

    /// Confirmations before a surviving event is treated as final during
    /// reorg correction.
    #[clap(long, env = "BLOCKHOST_FINALITY_DEPTH", default_value = "9")]
    pub finality_depth: u64,

    /// Average block time of the chain, used to compute how long the expiry
    /// scheduler sleeps until the next deadline.
    #[clap(
        long,
        env = "BLOCKHOST_AVG_BLOCK_TIME",
        default_value = "14s",
        value_parser = parse_duration,
    )]
    pub avg_block_time: Duration,

    /// How often the head tracker polls the chain.
    #[clap(
        long,
        env = "BLOCKHOST_HEAD_POLL_INTERVAL",
        default_value = "5m",
        value_parser = parse_duration,
    )]
    pub head_poll_interval: Duration,

    /// Delay between worker-level retries of a failed event.
    #[clap(
        long,
        env = "BLOCKHOST_RETRY_DELAY",
        default_value = "10s",
        value_parser = parse_duration,
    )]
    pub retry_delay: Duration,

    /// Delay before the ingestor reconnects after losing its subscription.
    #[clap(
        long,
        env = "BLOCKHOST_RECONNECT_DELAY",
        default_value = "5s",
        value_parser = parse_duration,
    )]
    pub reconnect_delay: Duration,

    #[clap(flatten)]
    pub logging: logging::Config,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("s").is_err());
    }
}
