//! Session handed over by the external identity provider.
//!
//! The core never authenticates by itself: it stores the user identifier and
//! the revocable bearer token it was given, and treats a 401 from the ledger
//! as a permanent `SessionExpired` rejection.

pub mod session;

pub use session::{Session, SessionData};
