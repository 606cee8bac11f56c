use std::{fmt, str::FromStr};

use alloy::{
    primitives::Address,
    rpc::types::Log,
    sol,
    sol_types::SolEvent,
};
use derive_more::Display;

sol! {
    /// Emitted by the payment contract when an org pays for (more) hosting
    /// time. `expiry` is the block number the deployment is now paid up to.
    event NewTopUp(address org, uint64 expiry);

    /// Emitted when an org ends its deployment ahead of its deadline.
    event DeploymentStopped(address org, uint64 expiry);
}

/// A customer, identified by its 20-byte on-chain address.
///
/// Displays (and persists) as the `0x`-prefixed lowercase hex string, the
/// same normalisation used for server names and DNS labels.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0:#x}")] // lowercase hex, not the EIP-55 checksummed form
pub struct OrgId(Address);

impl OrgId {
    pub fn as_address(&self) -> Address {
        self.0
    }
}

impl From<Address> for OrgId {
    fn from(addr: Address) -> Self {
        Self(addr)
    }
}

impl FromStr for OrgId {
    type Err = <Address as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Address::from_str(s)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    TopUp,
    DeploymentStopped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopUp => "NewTopUp",
            Self::DeploymentStopped => "DeploymentStopped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event kind `{0}`")]
pub struct ParseEventKindError(String);

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NewTopUp" => Ok(Self::TopUp),
            "DeploymentStopped" => Ok(Self::DeploymentStopped),
            other => Err(ParseEventKindError(other.into())),
        }
    }
}

/// One decoded payment-contract log.
///
/// `block_and_tx` (block hash ++ transaction hash) is the globally unique
/// identity of the log: two events with the same `block_and_tx` are the same
/// event, which is what makes event persistence idempotent across ingestor
/// restarts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub org: OrgId,
    pub kind: EventKind,
    /// Caller-supplied deadline, as a block number.
    pub expiry: u64,
    /// Block the log was emitted in.
    pub emitted_at: u64,
    pub block_and_tx: Vec<u8>,
    /// True when the hosting block was reorganised away.
    pub removed: bool,
}

impl Event {
    /// Decode a raw contract log into an [`Event`].
    ///
    /// Returns `None` for logs whose topic-0 matches neither payment event,
    /// and for pending logs that have no block or transaction hash yet.
    pub fn from_log(log: &Log) -> Option<Self> {
        let topic0 = log.inner.data.topics().first()?;
        let (org, expiry, kind) = if *topic0 == NewTopUp::SIGNATURE_HASH {
            let decoded = log.log_decode::<NewTopUp>().ok()?;
            let ev = decoded.inner.data;
            (ev.org, ev.expiry, EventKind::TopUp)
        } else if *topic0 == DeploymentStopped::SIGNATURE_HASH {
            let decoded = log.log_decode::<DeploymentStopped>().ok()?;
            let ev = decoded.inner.data;
            (ev.org, ev.expiry, EventKind::DeploymentStopped)
        } else {
            return None;
        };

        let mut block_and_tx = Vec::with_capacity(64);
        block_and_tx.extend_from_slice(log.block_hash?.as_slice());
        block_and_tx.extend_from_slice(log.transaction_hash?.as_slice());

        Some(Self {
            org: org.into(),
            kind,
            expiry,
            emitted_at: log.block_number?,
            block_and_tx,
            removed: log.removed,
        })
    }
}

#[cfg(test)]
mod test {
    use alloy::primitives::{address, B256};

    use super::*;

    fn raw_log(data: alloy::primitives::LogData) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data,
            },
            block_hash: Some(B256::repeat_byte(0xab)),
            block_number: Some(10),
            transaction_hash: Some(B256::repeat_byte(0xcd)),
            ..Default::default()
        }
    }

    #[test]
    fn top_up_round_trip() {
        let org = address!("ceaa01bd5a428d2910c82bbefe1bc7a8cc6207d9");
        let encoded = NewTopUp { org, expiry: 100 }.encode_log_data();
        // the ABI encoding is the fixed 64-byte layout: padded org address
        // word, then the expiry as a big-endian u64 in the second word
        assert_eq!(encoded.data.len(), 64);
        assert_eq!(&encoded.data[12..32], org.as_slice());
        assert_eq!(&encoded.data[56..64], &100u64.to_be_bytes());

        let event = Event::from_log(&raw_log(encoded)).unwrap();
        assert_eq!(event.org, org.into());
        assert_eq!(event.kind, EventKind::TopUp);
        assert_eq!(event.expiry, 100);
        assert_eq!(event.emitted_at, 10);
        assert_eq!(event.block_and_tx.len(), 64);
        assert!(!event.removed);
    }

    #[test]
    fn stop_round_trip() {
        let org = address!("00000000000000000000000000000000000000aa");
        let encoded = DeploymentStopped { org, expiry: 30 }.encode_log_data();
        let event = Event::from_log(&raw_log(encoded)).unwrap();
        assert_eq!(event.kind, EventKind::DeploymentStopped);
        assert_eq!(event.expiry, 30);
    }

    #[test]
    fn foreign_topic_is_skipped() {
        let data = alloy::primitives::LogData::new_unchecked(
            vec![B256::repeat_byte(0x11)],
            vec![0u8; 64].into(),
        );
        assert!(Event::from_log(&raw_log(data)).is_none());
    }

    #[test]
    fn org_display_is_lowercase_hex() {
        let org: OrgId = address!("ceaa01bd5a428d2910c82bbefe1bc7a8cc6207d9").into();
        // lowercase, not the checksummed form `Address` itself displays
        assert_eq!(
            org.to_string(),
            "0xceaa01bd5a428d2910c82bbefe1bc7a8cc6207d9"
        );
        assert_eq!(org.to_string().parse::<OrgId>().unwrap(), org);
    }
}
