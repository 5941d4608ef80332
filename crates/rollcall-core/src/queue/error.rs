use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{EventId, EventStatus};

/// Intent rejected locally before it ever reaches the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Already checked in on {day}")]
    DuplicateCheckIn { user_id: String, day: NaiveDate },

    #[error("Event {0} is already queued")]
    DuplicateEvent(EventId),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Event not found: {0}")]
    NotFound(EventId),

    #[error("Event {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: EventId,
        from: EventStatus,
        to: EventStatus,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
