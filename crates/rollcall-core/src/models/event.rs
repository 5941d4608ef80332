use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cache::ResourceKey;
use crate::party::PartyCode;

/// Client-generated idempotency key, unique per logical intent.
pub type EventId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CheckIn,
    PartyJoin,
    PartyCreate,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::CheckIn => "check_in",
            EventKind::PartyJoin => "party_join",
            EventKind::PartyCreate => "party_create",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    InFlight,
    Delivered,
    Rejected,
}

impl EventStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, EventStatus::Delivered | EventStatus::Rejected)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventStatus::Pending => "pending",
            EventStatus::InFlight => "in_flight",
            EventStatus::Delivered => "delivered",
            EventStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Why an event ended up `Rejected`. Surfaced to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    AlreadyCheckedIn,
    SessionExpired,
    AccessDenied,
    Validation(String),
    PartyNotFound,
    PartyExpired,
    AlreadyMember,
    InvalidCode,
    MaxAttemptsExceeded,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AlreadyCheckedIn => write!(f, "already checked in today"),
            RejectReason::SessionExpired => write!(f, "session expired, sign in again"),
            RejectReason::AccessDenied => write!(f, "access denied"),
            RejectReason::Validation(msg) => write!(f, "rejected by server: {}", msg),
            RejectReason::PartyNotFound => write!(f, "no party uses that code"),
            RejectReason::PartyExpired => write!(f, "that party has already closed"),
            RejectReason::AlreadyMember => write!(f, "already a member of that party"),
            RejectReason::InvalidCode => write!(f, "party codes are 6 letters or digits"),
            RejectReason::MaxAttemptsExceeded => write!(f, "gave up after repeated sync failures"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: EventId,
    pub kind: EventKind,
    pub user_id: String,
    /// Kind-specific, opaque beyond `code` / `proposed_code` / `party_id`.
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Calendar day of `created_at` in the user's offset.
    pub day: NaiveDate,
    #[serde(default)]
    pub attempts: u32,
    pub status: EventStatus,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejection: Option<RejectReason>,
    /// Server response snapshot once delivered.
    #[serde(default)]
    pub outcome: Option<Value>,
    /// Dependent cache keys have been refetched since resolution.
    #[serde(default)]
    pub cache_refreshed: bool,
}

impl AttendanceEvent {
    pub fn new(
        kind: EventKind,
        user_id: impl Into<String>,
        payload: Value,
        created_at: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id: user_id.into(),
            payload,
            created_at,
            day: created_at.with_timezone(&offset).date_naive(),
            attempts: 0,
            status: EventStatus::Pending,
            next_attempt_at: None,
            rejection: None,
            outcome: None,
            cache_refreshed: false,
        }
    }

    pub fn check_in(user_id: impl Into<String>, now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self::new(EventKind::CheckIn, user_id, Value::Null, now, offset)
    }

    pub fn party_create(
        user_id: impl Into<String>,
        proposed_code: &PartyCode,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Self {
        let payload = json!({ "proposed_code": proposed_code.as_str() });
        Self::new(EventKind::PartyCreate, user_id, payload, now, offset)
    }

    /// `party_id` is filled in when the code is already known locally.
    pub fn party_join(
        user_id: impl Into<String>,
        code: &str,
        party_id: Option<&str>,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Self {
        let mut payload = json!({ "code": code });
        if let Some(party_id) = party_id {
            payload["party_id"] = json!(party_id);
        }
        Self::new(EventKind::PartyJoin, user_id, payload, now, offset)
    }

    /// Join code (for joins) or proposed code (for creates), as entered.
    pub fn party_code(&self) -> Option<&str> {
        let field = match self.kind {
            EventKind::PartyJoin => "code",
            EventKind::PartyCreate => "proposed_code",
            EventKind::CheckIn => return None,
        };
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Party id from the server outcome, falling back to the one known at enqueue.
    pub fn party_id(&self) -> Option<&str> {
        self.outcome
            .as_ref()
            .and_then(|o| o.get("party_id"))
            .or_else(|| self.payload.get("party_id"))
            .and_then(Value::as_str)
    }

    /// Cache keys whose server state this event changes.
    pub fn dependents(&self) -> Vec<ResourceKey> {
        match self.kind {
            EventKind::CheckIn => vec![
                ResourceKey::TodayCheckins,
                ResourceKey::WeeklyRanking,
                ResourceKey::Streak(self.user_id.clone()),
            ],
            EventKind::PartyJoin | EventKind::PartyCreate => self
                .party_id()
                .map(|id| vec![ResourceKey::Party(id.to_string())])
                .unwrap_or_default(),
        }
    }

    /// Pending and not held back by a backoff schedule.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Counts against the one-check-in-per-day rule.
    pub fn holds_daily_slot(&self) -> bool {
        self.kind == EventKind::CheckIn && self.status != EventStatus::Rejected
    }
}
