//! Remote attendance ledger.
//!
//! `Ledger` is the contract the sync coordinator depends on; `LedgerClient`
//! implements it over HTTP. Every mutating request carries the event's
//! idempotency key so a retried delivery is applied at most once server-side.

pub mod client;
pub mod error;
pub mod ledger;

pub use client::LedgerClient;
pub use error::ApiError;
pub use ledger::Ledger;
