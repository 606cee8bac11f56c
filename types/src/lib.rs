//! Core data model for the blockhost control loop: payment-contract events,
//! deployment records, and the expiry index the scheduler runs on.
//!
//! Everything in this crate is pure data — no I/O, no async. The controller
//! crate owns the tasks that move these values around.

pub mod deployment;
pub mod event;
pub mod expiry;

pub use deployment::{Deployment, DeploymentStatus};
pub use event::{DeploymentStopped, Event, EventKind, NewTopUp, OrgId};
pub use expiry::{ExpiryEntry, ExpiryIndex};
