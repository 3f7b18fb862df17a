//! Core domain types for the credit ledger.
//!
//! This crate contains the shared, side-effect-free pieces used across all
//! packages:
//! - UserCredits and ExpiringCredit for balances
//! - Pure bucket arithmetic (grant, deduct, expire)
//! - Entitlement payloads and their conversion to grants
//! - Job-completion messages and per-type cost caps
//! - Change events for downstream audit

mod credits;
mod entitlements;
mod events;
mod job;

pub mod arith;

pub use credits::{ExpiringCredit, GrantMap, UserCredits, UserId};
pub use entitlements::{Entitlement, ExpiresSpec, entitlements_to_grant};
pub use events::{BucketDelta, CreditEvent};
pub use job::{CapTable, DEFAULT_COST_CAP_MS, JobComplete};
