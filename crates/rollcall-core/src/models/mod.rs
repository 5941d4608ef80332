//! Data models for the attendance core.
//!
//! - `AttendanceEvent`: a queued user intent with its delivery state
//! - Ledger wire types: `CheckInAck`, `PartyCreated`, `PartyJoined`,
//!   `TodayCheckin`, `RankingEntry`, `Streak`, `PartySnapshot`

pub mod event;
pub mod ledger;

pub use event::{AttendanceEvent, EventId, EventKind, EventStatus, RejectReason};
pub use ledger::{
    sort_ranking, CheckInAck, PartyCreated, PartyJoined, PartySnapshot, RankingEntry, Streak,
    TodayCheckin,
};
