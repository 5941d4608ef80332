use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::Backoff;
use crate::api::{ApiError, Ledger};
use crate::cache::{RefreshClaim, RefreshTicket, ResourceCache, ResourceKey};
use crate::config::{CacheConfig, Config};
use crate::models::{sort_ranking, AttendanceEvent, EventKind, RejectReason};
use crate::party::{PartyCode, PartyCodeResolver, ResolverError};
use crate::queue::{EventQueue, RetryOutcome};

/// Floor for backoff wakeups so an overdue event cannot spin the loop.
const MIN_DUE_WAIT: Duration = Duration::from_millis(100);

/// What asked for a drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    ConnectivityRestored,
    Periodic,
    Flush,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub cycles: u32,
    pub delivered: usize,
    pub rejected: usize,
    pub retried: usize,
    pub refreshed: usize,
    pub purged: usize,
}

impl DrainReport {
    /// Nothing was delivered, retried, refreshed or purged.
    pub fn is_idle(&self) -> bool {
        self.delivered == 0
            && self.rejected == 0
            && self.retried == 0
            && self.refreshed == 0
            && self.purged == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain was running; it will run once more on our behalf.
    Coalesced,
    Offline,
}

enum Delivery {
    Delivered(Value),
    Rejected(RejectReason),
    Transient(ApiError),
}

#[derive(Debug, Default)]
struct DrainGate {
    running: bool,
    rerun: bool,
}

fn lock_gate(gate: &Mutex<DrainGate>) -> MutexGuard<'_, DrainGate> {
    gate.lock().unwrap_or_else(|e| e.into_inner())
}

/// Held by the one active drain. Dropping it without `finish_or_rerun`
/// (cancellation) still releases the gate.
struct GateGuard<'a> {
    gate: &'a Mutex<DrainGate>,
    released: bool,
}

impl<'a> GateGuard<'a> {
    fn enter(gate: &'a Mutex<DrainGate>) -> Option<Self> {
        let mut state = lock_gate(gate);
        if state.running {
            state.rerun = true;
            return None;
        }
        state.running = true;
        Some(Self {
            gate,
            released: false,
        })
    }

    /// Returns true if a trigger arrived meanwhile and the drain must go again;
    /// otherwise releases the gate under the same lock.
    fn finish_or_rerun(&mut self) -> bool {
        let mut state = lock_gate(self.gate);
        if state.rerun {
            state.rerun = false;
            return true;
        }
        state.running = false;
        self.released = true;
        false
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let mut state = lock_gate(self.gate);
            state.running = false;
            state.rerun = false;
        }
    }
}

/// Releases a fetch claim if the fetching future is dropped midway.
struct ClaimGuard<'a> {
    cache: &'a ResourceCache,
    key: &'a ResourceKey,
    settled: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.refresh_failed(self.key);
        }
    }
}

pub struct SyncCoordinator {
    queue: Arc<EventQueue>,
    cache: Arc<ResourceCache>,
    parties: Arc<PartyCodeResolver>,
    ledger: Arc<dyn Ledger>,
    backoff: Backoff,
    batch_size: usize,
    request_timeout: Duration,
    periodic_interval: Duration,
    cache_config: CacheConfig,
    utc_offset: FixedOffset,
    online: AtomicBool,
    gate: Mutex<DrainGate>,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<EventQueue>,
        cache: Arc<ResourceCache>,
        parties: Arc<PartyCodeResolver>,
        ledger: Arc<dyn Ledger>,
        config: &Config,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            queue,
            cache,
            parties,
            ledger,
            backoff: Backoff::from_config(&config.sync),
            batch_size: config.sync.batch_size.max(1),
            request_timeout: config.sync.request_timeout(),
            periodic_interval: config.sync.periodic_interval(),
            cache_config: config.cache.clone(),
            utc_offset,
            online: AtomicBool::new(true),
            gate: Mutex::new(DrainGate::default()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns true when this call brought the coordinator back online.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            info!(online, "Connectivity changed");
        }
        online && !was_online
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.utc_offset).date_naive()
    }

    /// Run drain cycles until no trigger is left. Concurrent callers do not
    /// start a second drain; they mark the running one to go again.
    pub async fn flush(&self) -> DrainOutcome {
        if !self.is_online() {
            return DrainOutcome::Offline;
        }
        let Some(mut guard) = GateGuard::enter(&self.gate) else {
            debug!("Drain already running, coalescing");
            return DrainOutcome::Coalesced;
        };

        let mut report = DrainReport::default();
        loop {
            report.cycles += 1;
            self.drain_cycle(&mut report).await;
            if !guard.finish_or_rerun() {
                break;
            }
        }
        DrainOutcome::Completed(report)
    }

    async fn drain_cycle(&self, report: &mut DrainReport) {
        let batch = self.queue.next_batch(self.batch_size);
        if !batch.is_empty() {
            debug!(events = batch.len(), "Draining event queue");
        }
        for event in batch {
            if !self.is_online() {
                debug!("Went offline mid-drain");
                return;
            }
            self.deliver(event, report).await;
        }
        self.settle(report).await;
    }

    async fn deliver(&self, event: AttendanceEvent, report: &mut DrainReport) {
        if let Err(e) = self.queue.mark_in_flight(event.id) {
            warn!(id = %event.id, error = %e, "Could not take event for delivery");
            return;
        }

        let delivery = match self.precheck(&event) {
            Some(reason) => Delivery::Rejected(reason),
            None => self.send(&event).await,
        };

        let recorded = match delivery {
            Delivery::Delivered(outcome) => self
                .queue
                .mark_delivered(event.id, outcome)
                .map(|()| report.delivered += 1),
            Delivery::Rejected(reason) => self
                .queue
                .mark_rejected(event.id, reason)
                .map(|()| report.rejected += 1),
            Delivery::Transient(err) => {
                let delay = self.backoff.delay(event.attempts);
                let not_before = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
                warn!(
                    id = %event.id,
                    kind = %event.kind,
                    attempts = event.attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Delivery failed, will retry"
                );
                match self.queue.mark_retry(event.id, not_before) {
                    Ok(RetryOutcome::Exhausted { .. }) => {
                        report.rejected += 1;
                        Ok(())
                    }
                    Ok(RetryOutcome::Scheduled { .. }) => {
                        report.retried += 1;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = recorded {
            error!(id = %event.id, error = %e, "Failed to record delivery result");
            // The ledger deduplicates on the event id, so resending is safe.
            self.queue.release_in_flight(event.id);
        }
    }

    /// Local rejection for joins the resolver already knows cannot succeed.
    fn precheck(&self, event: &AttendanceEvent) -> Option<RejectReason> {
        if event.kind != EventKind::PartyJoin {
            return None;
        }
        match event.party_code().map(|code| self.parties.validate(code)) {
            None | Some(Err(ResolverError::Malformed(_))) => Some(RejectReason::InvalidCode),
            Some(Err(ResolverError::Expired { .. })) => Some(RejectReason::PartyExpired),
            _ => None,
        }
    }

    async fn send(&self, event: &AttendanceEvent) -> Delivery {
        match tokio::time::timeout(self.request_timeout, self.call_ledger(event)).await {
            Err(_) => Delivery::Transient(ApiError::Timeout),
            Ok(Ok(delivery)) => delivery,
            Ok(Err(e)) if e.is_transient() => Delivery::Transient(e),
            Ok(Err(e)) => {
                if let (EventKind::PartyJoin, ApiError::Expired(_)) = (event.kind, &e) {
                    if let Some(code) = event.party_code().and_then(|c| PartyCode::parse(c).ok()) {
                        if let Err(err) = self.parties.expire(&code) {
                            warn!(code = %code, error = %err, "Failed to record expired party");
                        }
                    }
                }
                Delivery::Rejected(e.reject_reason(event.kind))
            }
        }
    }

    /// Deliver using the event id as the ledger's deduplication token.
    async fn call_ledger(&self, event: &AttendanceEvent) -> Result<Delivery, ApiError> {
        match event.kind {
            EventKind::CheckIn => {
                let ack = self.ledger.check_in(&event.user_id, event.id).await?;
                if ack.already_checked_in {
                    Ok(Delivery::Rejected(RejectReason::AlreadyCheckedIn))
                } else {
                    Ok(Delivery::Delivered(json!({ "already_checked_in": false })))
                }
            }
            EventKind::PartyCreate => {
                let proposed = event.party_code().and_then(|c| PartyCode::parse(c).ok());
                let created = self
                    .ledger
                    .party_create(&event.user_id, event.id, proposed.as_ref())
                    .await?;
                let code = PartyCode::parse(&created.code).map_err(|_| {
                    ApiError::InvalidResponse(format!("Malformed party code {:?}", created.code))
                })?;
                self.register_party(code, &created.party_id);
                Ok(Delivery::Delivered(
                    json!({ "party_id": created.party_id, "code": created.code }),
                ))
            }
            EventKind::PartyJoin => {
                let code = event
                    .party_code()
                    .and_then(|c| PartyCode::parse(c).ok())
                    .ok_or_else(|| ApiError::Validation("Malformed party code".to_string()))?;
                let joined = self.ledger.party_join(&event.user_id, &code, event.id).await?;
                self.register_party(code.clone(), &joined.party_id);
                Ok(Delivery::Delivered(
                    json!({ "party_id": joined.party_id, "code": code.as_str() }),
                ))
            }
        }
    }

    fn register_party(&self, code: PartyCode, party_id: &str) {
        if let Err(e) = self.parties.register(code, party_id) {
            warn!(party = %party_id, error = %e, "Failed to record party code");
        }
    }

    /// Invalidate and refetch the cache keys of resolved events, then purge
    /// the events whose keys all refreshed.
    async fn settle(&self, report: &mut DrainReport) {
        let awaiting = self.queue.awaiting_refresh();
        if !awaiting.is_empty() {
            let keys: BTreeSet<ResourceKey> = awaiting.iter().flat_map(|e| e.dependents()).collect();
            for key in &keys {
                self.cache.invalidate(key);
            }

            let results = join_all(keys.iter().map(|key| async move {
                (key, self.refresh(key).await.is_ok())
            }))
            .await;
            let failed: BTreeSet<&ResourceKey> = results
                .into_iter()
                .filter(|(_, ok)| !ok)
                .map(|(key, _)| key)
                .collect();

            // Refetched entries reach disk before the events depending on them
            // can be purged.
            self.persist_cache();

            for event in &awaiting {
                if event.dependents().iter().any(|key| failed.contains(key)) {
                    continue;
                }
                match self.queue.mark_cache_refreshed(event.id) {
                    Ok(()) => report.refreshed += 1,
                    Err(e) => warn!(id = %event.id, error = %e, "Failed to mark cache refreshed"),
                }
            }
        }

        match self.queue.purge_settled(self.today()) {
            Ok(purged) => report.purged += purged,
            Err(e) => warn!(error = %e, "Failed to purge settled events"),
        }
        self.cache.set_pinned(self.queue.pinned_keys());
    }

    /// Fetch `key` from the ledger and store it in the cache. Only one fetch
    /// per key runs at a time; other callers wait for it and fetch again only
    /// if it failed or the key was invalidated while it ran.
    pub async fn refresh(&self, key: &ResourceKey) -> Result<(), ApiError> {
        loop {
            match self.cache.begin_refresh(key) {
                RefreshClaim::Claimed(ticket) => return self.fetch_claimed(key, ticket).await,
                RefreshClaim::Busy => {
                    debug!(key = %key, "Refresh already running, waiting");
                    self.cache.refresh_settled(key).await;
                    if self.cache.is_fresh(key) {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn fetch_claimed(&self, key: &ResourceKey, ticket: RefreshTicket) -> Result<(), ApiError> {
        let mut claim = ClaimGuard {
            cache: &self.cache,
            key,
            settled: false,
        };
        let fetched = match tokio::time::timeout(self.request_timeout, self.fetch(key)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        };
        claim.settled = true;
        match fetched {
            Ok(value) => {
                self.cache
                    .complete_refresh(key.clone(), value, self.cache_config.ttl_for(key), ticket);
                debug!(key = %key, "Cache entry refreshed");
                Ok(())
            }
            Err(e) => {
                self.cache.refresh_failed(key);
                debug!(key = %key, error = %e, "Cache refresh failed");
                Err(e)
            }
        }
    }

    fn persist_cache(&self) {
        if let Err(e) = self.cache.persist_if_dirty() {
            warn!(error = %e, "Failed to persist resource cache");
        }
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<Value, ApiError> {
        let value = match key {
            ResourceKey::TodayCheckins => {
                let mut checkins = self.ledger.today_checkins().await?;
                checkins.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
                serde_json::to_value(checkins)
            }
            ResourceKey::WeeklyRanking => {
                let mut ranking = self.ledger.weekly_ranking().await?;
                sort_ranking(&mut ranking);
                serde_json::to_value(ranking)
            }
            ResourceKey::Streak(user_id) => serde_json::to_value(self.ledger.streak(user_id).await?),
            ResourceKey::Party(party_id) => {
                let snapshot = self.ledger.party(party_id).await?;
                if let Ok(code) = PartyCode::parse(&snapshot.code) {
                    if let Err(e) = self.parties.sync_party(code, &snapshot.party_id, snapshot.active) {
                        warn!(party = %snapshot.party_id, error = %e, "Failed to sync party code");
                    }
                }
                serde_json::to_value(snapshot)
            }
        };
        value.map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Serve a refresh requested by a stale cache read, unless something else
    /// already took it over.
    pub async fn handle_refresh_request(&self, key: ResourceKey) {
        if !self.cache.is_refresh_requested(&key) {
            return;
        }
        if !self.is_online() {
            self.cache.cancel_refresh_request(&key);
            return;
        }
        if self.refresh(&key).await.is_ok() {
            self.persist_cache();
        }
    }

    fn log_outcome(outcome: &DrainOutcome) {
        match outcome {
            DrainOutcome::Completed(report) if !report.is_idle() => {
                info!(
                    cycles = report.cycles,
                    delivered = report.delivered,
                    rejected = report.rejected,
                    retried = report.retried,
                    refreshed = report.refreshed,
                    purged = report.purged,
                    "Drain finished"
                );
            }
            other => debug!(outcome = ?other, "Drain finished"),
        }
    }

    /// Background loop: drains on triggers, on the periodic timer, when a
    /// backed-off event becomes due, and serves stale-read refreshes.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<SyncTrigger>,
        mut refresh_rx: mpsc::UnboundedReceiver<ResourceKey>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.periodic_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Sync coordinator started");

        loop {
            let due_in = if self.is_online() {
                self.queue.next_due_at().map(|at| {
                    (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .max(MIN_DUE_WAIT)
                })
            } else {
                None
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(trigger) = triggers.recv() => {
                    debug!(trigger = ?trigger, "Sync triggered");
                    if trigger == SyncTrigger::ConnectivityRestored {
                        self.set_online(true);
                    }
                    Self::log_outcome(&self.flush().await);
                }
                Some(key) = refresh_rx.recv() => {
                    self.handle_refresh_request(key).await;
                }
                _ = ticker.tick() => {
                    Self::log_outcome(&self.flush().await);
                }
                _ = tokio::time::sleep(due_in.unwrap_or(MIN_DUE_WAIT)), if due_in.is_some() => {
                    Self::log_outcome(&self.flush().await);
                }
            }
        }

        info!("Sync coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_coalesces_second_entry() {
        let gate = Mutex::new(DrainGate::default());
        let mut first = GateGuard::enter(&gate).unwrap();
        assert!(GateGuard::enter(&gate).is_none());
        assert!(GateGuard::enter(&gate).is_none());

        // Both re-entries collapse into one extra pass.
        assert!(first.finish_or_rerun());
        assert!(!first.finish_or_rerun());
        drop(first);
        assert!(GateGuard::enter(&gate).is_some());
    }

    #[test]
    fn test_gate_released_on_drop() {
        let gate = Mutex::new(DrainGate::default());
        let guard = GateGuard::enter(&gate).unwrap();
        assert!(GateGuard::enter(&gate).is_none());
        drop(guard);

        let state = lock_gate(&gate);
        assert!(!state.running);
        assert!(!state.rerun);
    }
}
