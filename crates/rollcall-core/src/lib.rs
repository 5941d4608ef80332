//! Offline-first attendance core for rollcall.
//!
//! A user's daily check-in (and party create/join intents) are recorded in a
//! durable local queue, delivered to the remote attendance ledger by a single
//! sync coordinator, and reconciled with a local resource cache that keeps
//! serving reads while the network is unavailable.
//!
//! - `queue`: durable event queue with the one-check-in-per-day rule
//! - `cache`: TTL-bound LRU resource cache with stale-while-revalidate reads
//! - `sync`: drain cycles, exponential backoff, cache reconciliation
//! - `party`: party join code generation and validation
//! - `api`: the `Ledger` contract and its HTTP client
//! - `engine`: `AttendanceCore`, the lifecycle owner for one user

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod engine;
pub mod models;
pub mod party;
pub mod queue;
pub mod store;
pub mod sync;

pub use api::{ApiError, Ledger, LedgerClient};
pub use cache::{CacheRead, Freshness, ResourceCache, ResourceKey};
pub use config::Config;
pub use engine::{AttendanceCore, CoreError};
pub use models::{AttendanceEvent, EventId, EventKind, EventStatus, RejectReason};
pub use party::{PartyCode, PartyCodeResolver, PartyRef, ResolverError};
pub use queue::{ConflictError, EventQueue, QueueError, StatusChange};
pub use sync::{Backoff, DrainOutcome, DrainReport, SyncCoordinator, SyncTrigger};
