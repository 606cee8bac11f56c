use std::{fmt, str::FromStr};

use crate::OrgId;

/// Where a deployment is in its life: freshly recorded, VPS reserved,
/// provisioning given up on, or serving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeploymentStatus {
    #[default]
    Initial,
    Allocated,
    SetupFailed,
    Running,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Allocated => "allocated",
            Self::SetupFailed => "setup-failed",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown deployment status `{0}`")]
pub struct ParseStatusError(String);

impl FromStr for DeploymentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "allocated" => Ok(Self::Allocated),
            "setup-failed" => Ok(Self::SetupFailed),
            "running" => Ok(Self::Running),
            other => Err(ParseStatusError(other.into())),
        }
    }
}

/// The cloud-world state backing one org: a VPS on `provider` at `ip`, a DNS
/// record, and (eventually) an installed software stack.
///
/// Invariants: `Initial` rows have empty `provider` and `ip`; from
/// `Allocated` on, both are set. There is exactly one deployment per org.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub org: OrgId,
    pub expiry: u64,
    pub provider: String,
    pub ip: String,
    pub status: DeploymentStatus,
}
