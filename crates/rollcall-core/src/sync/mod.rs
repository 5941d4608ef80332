//! Reconciliation of queued events with the remote ledger.
//!
//! `SyncCoordinator` is the only component that talks to the network. It
//! runs one drain cycle at a time, retries transient failures with jittered
//! exponential backoff, and refetches the cache keys a resolved event affects.

pub mod backoff;
pub mod coordinator;

pub use backoff::Backoff;
pub use coordinator::{DrainOutcome, DrainReport, SyncCoordinator, SyncTrigger};
