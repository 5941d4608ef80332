//! In-process ledger used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use rollcall_core::config::{CacheConfig, Config, SyncConfig};
use rollcall_core::store::JsonStore;
use rollcall_core::models::{
    CheckInAck, PartyCreated, PartyJoined, PartySnapshot, RankingEntry, Streak, TodayCheckin,
};
use rollcall_core::{
    ApiError, EventId, EventQueue, Ledger, PartyCode, PartyCodeResolver, ResourceCache,
    SyncCoordinator,
};

/// Config with UTC days and no retry delay, so a failed event is due again
/// on the next flush.
pub fn test_config() -> Config {
    Config {
        offline: false,
        sync: SyncConfig {
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_fraction: 0.0,
            max_attempts: 3,
            utc_offset_minutes: Some(0),
            ..SyncConfig::default()
        },
        cache: CacheConfig::default(),
        ..Config::default()
    }
}

#[derive(Debug, Clone)]
enum Ack {
    CheckIn(CheckInAck),
    Created(PartyCreated),
    Joined(PartyJoined),
}

#[derive(Debug, Clone)]
struct FakeParty {
    party_id: String,
    active: bool,
    members: Vec<String>,
}

#[derive(Default)]
struct LedgerState {
    unreachable: bool,
    session_expired: bool,
    /// Answer check-ins as if the user were unknown.
    unknown_user: bool,
    /// Apply the next N mutations but fail their responses.
    drop_acks: u32,
    delay: Option<Duration>,
    acks: HashMap<EventId, Ack>,
    checked_in: HashSet<String>,
    checkins: Vec<TodayCheckin>,
    ranking: Vec<RankingEntry>,
    parties: HashMap<String, FakeParty>,
    mutations: usize,
    fetches: HashMap<&'static str, usize>,
}

/// Ledger that applies each idempotency key once and replays its ack.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    pub fn set_session_expired(&self, expired: bool) {
        self.lock().session_expired = expired;
    }

    pub fn fail_check_ins_with_not_found(&self, fail: bool) {
        self.lock().unknown_user = fail;
    }

    pub fn drop_next_acks(&self, count: u32) {
        self.lock().drop_acks = count;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Record `user_id` as checked in today through some other device.
    pub fn seed_checked_in(&self, user_id: &str) {
        let mut state = self.lock();
        state.checked_in.insert(user_id.to_string());
        let id = format!("seed-{}", state.checkins.len());
        state.checkins.push(TodayCheckin {
            id,
            timestamp: Utc::now(),
            user_ref: user_id.to_string(),
        });
    }

    pub fn seed_party(&self, code: &str, party_id: &str, active: bool) {
        self.lock().parties.insert(
            code.to_string(),
            FakeParty {
                party_id: party_id.to_string(),
                active,
                members: Vec::new(),
            },
        );
    }

    pub fn close_party(&self, code: &str) {
        if let Some(party) = self.lock().parties.get_mut(code) {
            party.active = false;
        }
    }

    pub fn set_ranking(&self, ranking: Vec<RankingEntry>) {
        self.lock().ranking = ranking;
    }

    pub fn members(&self, code: &str) -> Vec<String> {
        self.lock()
            .parties
            .get(code)
            .map(|p| p.members.clone())
            .unwrap_or_default()
    }

    pub fn is_checked_in(&self, user_id: &str) -> bool {
        self.lock().checked_in.contains(user_id)
    }

    pub fn checkin_count(&self) -> usize {
        self.lock().checkins.len()
    }

    /// Mutating calls that reached the ledger, replays included.
    pub fn mutation_calls(&self) -> usize {
        self.lock().mutations
    }

    pub fn fetch_calls(&self, resource: &str) -> usize {
        self.lock().fetches.get(resource).copied().unwrap_or(0)
    }

    async fn pause(&self) {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn gate(state: &LedgerState) -> Result<(), ApiError> {
        if state.unreachable {
            return Err(ApiError::ServerError("unreachable".to_string()));
        }
        if state.session_expired {
            return Err(ApiError::SessionExpired);
        }
        Ok(())
    }

    /// Replay a stored ack, or apply `mutate` once and store its ack.
    async fn mutate(
        &self,
        key: EventId,
        mutate: impl FnOnce(&mut LedgerState) -> Result<Ack, ApiError>,
    ) -> Result<Ack, ApiError> {
        self.pause().await;
        let mut state = self.lock();
        Self::gate(&state)?;
        state.mutations += 1;
        if let Some(ack) = state.acks.get(&key) {
            return Ok(ack.clone());
        }
        let ack = mutate(&mut state)?;
        state.acks.insert(key, ack.clone());
        if state.drop_acks > 0 {
            state.drop_acks -= 1;
            return Err(ApiError::ServerError("connection reset".to_string()));
        }
        Ok(ack)
    }

    async fn read<T>(
        &self,
        resource: &'static str,
        read: impl FnOnce(&LedgerState) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        self.pause().await;
        let mut state = self.lock();
        Self::gate(&state)?;
        *state.fetches.entry(resource).or_insert(0) += 1;
        read(&state)
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn check_in(&self, user_id: &str, key: EventId) -> Result<CheckInAck, ApiError> {
        if self.lock().unknown_user {
            return Err(ApiError::NotFound(format!("user {user_id}")));
        }
        let ack = self
            .mutate(key, |state| {
                let already = !state.checked_in.insert(user_id.to_string());
                if !already {
                    state.checkins.push(TodayCheckin {
                        id: key.to_string(),
                        timestamp: Utc::now(),
                        user_ref: user_id.to_string(),
                    });
                }
                Ok(Ack::CheckIn(CheckInAck {
                    already_checked_in: already,
                }))
            })
            .await?;
        match ack {
            Ack::CheckIn(ack) => Ok(ack),
            other => Err(ApiError::InvalidResponse(format!("{other:?}"))),
        }
    }

    async fn party_create(
        &self,
        user_id: &str,
        key: EventId,
        proposed_code: Option<&PartyCode>,
    ) -> Result<PartyCreated, ApiError> {
        let ack = self
            .mutate(key, |state| {
                let serial = state.parties.len() + 1;
                let code = match proposed_code {
                    Some(code) if !state.parties.contains_key(code.as_str()) => code.to_string(),
                    _ => format!("SRV{serial:03}"),
                };
                let party_id = format!("party-{serial}");
                state.parties.insert(
                    code.clone(),
                    FakeParty {
                        party_id: party_id.clone(),
                        active: true,
                        members: vec![user_id.to_string()],
                    },
                );
                Ok(Ack::Created(PartyCreated { party_id, code }))
            })
            .await?;
        match ack {
            Ack::Created(created) => Ok(created),
            other => Err(ApiError::InvalidResponse(format!("{other:?}"))),
        }
    }

    async fn party_join(
        &self,
        user_id: &str,
        code: &PartyCode,
        key: EventId,
    ) -> Result<PartyJoined, ApiError> {
        let ack = self
            .mutate(key, |state| {
                let party = state
                    .parties
                    .get_mut(code.as_str())
                    .ok_or_else(|| ApiError::NotFound(code.to_string()))?;
                if !party.active {
                    return Err(ApiError::Expired(code.to_string()));
                }
                if party.members.iter().any(|m| m == user_id) {
                    return Err(ApiError::AlreadyMember);
                }
                party.members.push(user_id.to_string());
                Ok(Ack::Joined(PartyJoined {
                    party_id: party.party_id.clone(),
                }))
            })
            .await?;
        match ack {
            Ack::Joined(joined) => Ok(joined),
            other => Err(ApiError::InvalidResponse(format!("{other:?}"))),
        }
    }

    async fn today_checkins(&self) -> Result<Vec<TodayCheckin>, ApiError> {
        // Newest first, to check that the client orders them.
        self.read("today_checkins", |state| {
            Ok(state.checkins.iter().rev().cloned().collect())
        })
        .await
    }

    async fn weekly_ranking(&self) -> Result<Vec<RankingEntry>, ApiError> {
        self.read("weekly_ranking", |state| Ok(state.ranking.clone())).await
    }

    async fn streak(&self, user_id: &str) -> Result<Streak, ApiError> {
        self.read("streak", |state| {
            let current = u32::from(state.checked_in.contains(user_id));
            Ok(Streak {
                current,
                longest: current,
                last_check_in: None,
            })
        })
        .await
    }

    async fn party(&self, party_id: &str) -> Result<PartySnapshot, ApiError> {
        self.read("party", |state| {
            state
                .parties
                .iter()
                .find(|(_, p)| p.party_id == party_id)
                .map(|(code, p)| PartySnapshot {
                    party_id: p.party_id.clone(),
                    code: code.clone(),
                    active: p.active,
                    members: p.members.clone(),
                })
                .ok_or_else(|| ApiError::NotFound(party_id.to_string()))
        })
        .await
    }
}

/// Coordinator wired to in-memory parts, driven directly by the test.
pub struct Harness {
    pub queue: Arc<EventQueue>,
    pub cache: Arc<ResourceCache>,
    pub parties: Arc<PartyCodeResolver>,
    pub ledger: Arc<FakeLedger>,
    pub coordinator: SyncCoordinator,
}

impl Harness {
    pub fn new(config: &Config) -> Self {
        Self::assemble(
            config,
            EventQueue::in_memory(config.sync.max_attempts),
            ResourceCache::new(config.cache.capacity),
        )
    }

    /// Queue and cache persisted for `user_id` below `root`.
    pub fn with_store(config: &Config, root: &Path, user_id: &str) -> Self {
        let store = JsonStore::open(root, user_id).unwrap();
        Self::assemble(
            config,
            EventQueue::open(store.clone(), config.sync.max_attempts).unwrap(),
            ResourceCache::open(store, config.cache.capacity).unwrap(),
        )
    }

    fn assemble(config: &Config, queue: EventQueue, cache: ResourceCache) -> Self {
        let ledger = FakeLedger::new();
        let queue = Arc::new(queue);
        let cache = Arc::new(cache);
        let parties = Arc::new(PartyCodeResolver::new());
        let coordinator = SyncCoordinator::new(
            queue.clone(),
            cache.clone(),
            parties.clone(),
            ledger.clone(),
            config,
            config.sync.utc_offset(),
        );
        Self {
            queue,
            cache,
            parties,
            ledger,
            coordinator,
        }
    }
}
