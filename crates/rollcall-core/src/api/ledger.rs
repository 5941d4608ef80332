use async_trait::async_trait;

use super::ApiError;
use crate::models::{
    CheckInAck, EventId, PartyCreated, PartyJoined, PartySnapshot, RankingEntry, Streak,
    TodayCheckin,
};
use crate::party::PartyCode;

/// Observable contract of the authoritative attendance ledger.
///
/// Mutations take the event's idempotency key: the ledger must answer a
/// repeated key with the outcome of the first application.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn check_in(&self, user_id: &str, key: EventId) -> Result<CheckInAck, ApiError>;

    async fn party_create(
        &self,
        user_id: &str,
        key: EventId,
        proposed_code: Option<&PartyCode>,
    ) -> Result<PartyCreated, ApiError>;

    async fn party_join(
        &self,
        user_id: &str,
        code: &PartyCode,
        key: EventId,
    ) -> Result<PartyJoined, ApiError>;

    async fn today_checkins(&self) -> Result<Vec<TodayCheckin>, ApiError>;

    async fn weekly_ranking(&self) -> Result<Vec<RankingEntry>, ApiError>;

    async fn streak(&self, user_id: &str) -> Result<Streak, ApiError>;

    async fn party(&self, party_id: &str) -> Result<PartySnapshot, ApiError>;
}
