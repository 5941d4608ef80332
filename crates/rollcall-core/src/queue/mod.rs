//! Durable queue of attendance events awaiting server confirmation.
//!
//! Events survive restarts (persisted per user through `JsonStore`); any
//! event interrupted mid-delivery is reset to `Pending` on load and relies on
//! its idempotency key to make the retry harmless.

pub mod error;
pub mod event_queue;

pub use error::{ConflictError, QueueError};
pub use event_queue::{EventQueue, RetryOutcome, StatusChange};
