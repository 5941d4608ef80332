use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{ConflictError, QueueError};
use crate::cache::ResourceKey;
use crate::models::{AttendanceEvent, EventId, EventKind, EventStatus, RejectReason};
use crate::store::JsonStore;

/// Store file holding the queue.
const QUEUE_FILE: &str = "queue";

/// Buffered status notifications per subscriber before it starts lagging.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Broadcast whenever an event changes status.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub id: EventId,
    pub kind: EventKind,
    pub status: EventStatus,
    pub reason: Option<RejectReason>,
}

impl From<&AttendanceEvent> for StatusChange {
    fn from(event: &AttendanceEvent) -> Self {
        Self {
            id: event.id,
            kind: event.kind,
            status: event.status,
            reason: event.rejection.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled {
        attempts: u32,
        not_before: DateTime<Utc>,
    },
    /// Attempt ceiling exceeded; the event is now `Rejected`.
    Exhausted { attempts: u32 },
}

pub struct EventQueue {
    events: Mutex<Vec<AttendanceEvent>>,
    store: Option<JsonStore>,
    max_attempts: u32,
    status_tx: broadcast::Sender<StatusChange>,
}

impl EventQueue {
    pub fn in_memory(max_attempts: u32) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            events: Mutex::new(Vec::new()),
            store: None,
            max_attempts,
            status_tx,
        }
    }

    /// Load the persisted queue. Events left `InFlight` by an interrupted
    /// delivery have an unknown outcome and go back to `Pending`.
    pub fn open(store: JsonStore, max_attempts: u32) -> anyhow::Result<Self> {
        let mut events: Vec<AttendanceEvent> = store.load(QUEUE_FILE)?.unwrap_or_default();

        let mut reset = 0;
        for event in events.iter_mut().filter(|e| e.status == EventStatus::InFlight) {
            event.status = EventStatus::Pending;
            event.next_attempt_at = None;
            reset += 1;
        }
        if reset > 0 {
            info!(count = reset, "Reset interrupted deliveries to pending");
            store.save(QUEUE_FILE, &events)?;
        }
        debug!(events = events.len(), "Loaded event queue");

        let mut queue = Self::in_memory(max_attempts);
        queue.events = Mutex::new(events);
        queue.store = Some(store);
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AttendanceEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, events: &[AttendanceEvent]) -> anyhow::Result<()> {
        match self.store {
            Some(ref store) => store.save(QUEUE_FILE, &events),
            None => Ok(()),
        }
    }

    fn notify(&self, event: &AttendanceEvent) {
        // No receivers is fine
        let _ = self.status_tx.send(StatusChange::from(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    /// Persist a new event. The duplicate check and the insert happen under
    /// one lock, so two rapid taps cannot both pass.
    pub fn enqueue(&self, event: AttendanceEvent) -> Result<EventId, QueueError> {
        let mut events = self.lock();

        if events.iter().any(|e| e.id == event.id) {
            return Err(ConflictError::DuplicateEvent(event.id).into());
        }
        if event.holds_daily_slot()
            && events
                .iter()
                .any(|e| e.holds_daily_slot() && e.user_id == event.user_id && e.day == event.day)
        {
            debug!(user = %event.user_id, day = %event.day, "Duplicate check-in refused");
            return Err(ConflictError::DuplicateCheckIn {
                user_id: event.user_id,
                day: event.day,
            }
            .into());
        }

        let id = event.id;
        events.push(event);
        if let Err(e) = self.persist(&events) {
            events.pop();
            return Err(e.into());
        }
        if let Some(event) = events.last() {
            info!(id = %id, kind = %event.kind, "Queued attendance event");
            self.notify(event);
        }
        Ok(id)
    }

    /// Pending events that are due, oldest first, at most `max`.
    pub fn next_batch(&self, max: usize) -> Vec<AttendanceEvent> {
        self.next_batch_at(max, Utc::now())
    }

    pub fn next_batch_at(&self, max: usize, now: DateTime<Utc>) -> Vec<AttendanceEvent> {
        let events = self.lock();
        let mut ready: Vec<AttendanceEvent> =
            events.iter().filter(|e| e.is_ready(now)).cloned().collect();
        ready.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        ready.truncate(max);
        ready
    }

    /// Apply `apply` to event `id` if its status is in `from`, persist, and
    /// broadcast. The in-memory change is rolled back if persisting fails.
    /// `to` is the target status, or `None` when the status stays as it is.
    fn transition(
        &self,
        id: EventId,
        from: &[EventStatus],
        to: Option<EventStatus>,
        apply: impl FnOnce(&mut AttendanceEvent),
    ) -> Result<AttendanceEvent, QueueError> {
        let mut events = self.lock();
        let index = events
            .iter()
            .position(|e| e.id == id)
            .ok_or(QueueError::NotFound(id))?;

        let current = events[index].status;
        if !from.contains(&current) {
            return Err(QueueError::InvalidTransition {
                id,
                from: current,
                to: to.unwrap_or(current),
            });
        }

        let previous = events[index].clone();
        apply(&mut events[index]);
        if let Err(e) = self.persist(&events) {
            events[index] = previous;
            return Err(e.into());
        }

        let updated = events[index].clone();
        drop(events);
        if updated.status != current {
            self.notify(&updated);
        }
        Ok(updated)
    }

    pub fn mark_in_flight(&self, id: EventId) -> Result<(), QueueError> {
        self.transition(id, &[EventStatus::Pending], Some(EventStatus::InFlight), |e| {
            e.status = EventStatus::InFlight;
        })?;
        Ok(())
    }

    pub fn mark_delivered(&self, id: EventId, outcome: Value) -> Result<(), QueueError> {
        self.transition(id, &[EventStatus::InFlight], Some(EventStatus::Delivered), |e| {
            e.status = EventStatus::Delivered;
            e.outcome = Some(outcome);
            e.next_attempt_at = None;
        })?;
        info!(id = %id, "Event delivered");
        Ok(())
    }

    pub fn mark_rejected(&self, id: EventId, reason: RejectReason) -> Result<(), QueueError> {
        warn!(id = %id, reason = %reason, "Event rejected");
        self.transition(
            id,
            &[EventStatus::Pending, EventStatus::InFlight],
            Some(EventStatus::Rejected),
            |e| {
                e.status = EventStatus::Rejected;
                e.rejection = Some(reason);
                e.next_attempt_at = None;
            },
        )?;
        Ok(())
    }

    /// Count a failed attempt and hold the event back until `not_before`.
    /// Past the attempt ceiling the event is rejected instead.
    pub fn mark_retry(&self, id: EventId, not_before: DateTime<Utc>) -> Result<RetryOutcome, QueueError> {
        let max_attempts = self.max_attempts;
        let updated = self.transition(id, &[EventStatus::InFlight], Some(EventStatus::Pending), |e| {
            e.attempts += 1;
            if e.attempts > max_attempts {
                e.status = EventStatus::Rejected;
                e.rejection = Some(RejectReason::MaxAttemptsExceeded);
                e.next_attempt_at = None;
            } else {
                e.status = EventStatus::Pending;
                e.next_attempt_at = Some(not_before);
            }
        })?;

        if updated.status == EventStatus::Rejected {
            warn!(id = %id, attempts = updated.attempts, "Giving up on event");
            Ok(RetryOutcome::Exhausted {
                attempts: updated.attempts,
            })
        } else {
            debug!(id = %id, attempts = updated.attempts, not_before = %not_before, "Event scheduled for retry");
            Ok(RetryOutcome::Scheduled {
                attempts: updated.attempts,
                not_before,
            })
        }
    }

    /// Hand an `InFlight` event back to the drain after its result could not
    /// be recorded. The change is kept in memory even if persisting fails;
    /// on disk the event is still `InFlight`, which a restart resets anyway.
    /// Returns false if the event was not `InFlight`.
    pub fn release_in_flight(&self, id: EventId) -> bool {
        let mut events = self.lock();
        let Some(event) = events
            .iter_mut()
            .find(|e| e.id == id && e.status == EventStatus::InFlight)
        else {
            return false;
        };
        event.status = EventStatus::Pending;
        event.next_attempt_at = None;
        let released = event.clone();
        if let Err(e) = self.persist(&events) {
            warn!(id = %id, error = %e, "Released event not persisted");
        }
        drop(events);
        debug!(id = %id, "Released in-flight event");
        self.notify(&released);
        true
    }

    /// Record that the dependent cache keys of a resolved event were refetched.
    pub fn mark_cache_refreshed(&self, id: EventId) -> Result<(), QueueError> {
        self.transition(
            id,
            &[EventStatus::Delivered, EventStatus::Rejected],
            None,
            |e| e.cache_refreshed = true,
        )?;
        Ok(())
    }

    /// Resolved events whose dependents still need a refetch.
    pub fn awaiting_refresh(&self) -> Vec<AttendanceEvent> {
        self.lock()
            .iter()
            .filter(|e| e.status.is_resolved() && !e.cache_refreshed)
            .cloned()
            .collect()
    }

    /// Drop resolved events whose cache has been refreshed. Delivered
    /// check-ins for `today` or later are kept so the daily rule still holds.
    pub fn purge_settled(&self, today: NaiveDate) -> Result<usize, QueueError> {
        let mut events = self.lock();
        let before = events.len();
        let keep = |e: &AttendanceEvent| {
            !(e.status.is_resolved() && e.cache_refreshed)
                || (e.kind == EventKind::CheckIn && e.status == EventStatus::Delivered && e.day >= today)
        };
        if events.iter().all(keep) {
            return Ok(0);
        }
        let previous = events.clone();
        events.retain(keep);
        let removed = before - events.len();
        if let Err(e) = self.persist(&events) {
            *events = previous;
            return Err(e.into());
        }
        debug!(removed, "Purged settled events");
        Ok(removed)
    }

    /// Cache keys that queued or not-yet-refreshed events depend on.
    pub fn pinned_keys(&self) -> BTreeSet<ResourceKey> {
        self.lock()
            .iter()
            .filter(|e| !e.status.is_resolved() || !e.cache_refreshed)
            .flat_map(|e| e.dependents())
            .collect()
    }

    /// Events not yet resolved; drives the "pending sync" indicator.
    pub fn pending_count(&self) -> usize {
        self.lock().iter().filter(|e| !e.status.is_resolved()).count()
    }

    /// Earliest backoff deadline among pending events.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .iter()
            .filter(|e| e.status == EventStatus::Pending)
            .filter_map(|e| e.next_attempt_at)
            .min()
    }

    pub fn get(&self, id: EventId) -> Option<AttendanceEvent> {
        self.lock().iter().find(|e| e.id == id).cloned()
    }

    pub fn events(&self) -> Vec<AttendanceEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, FixedOffset, TimeZone};
    use serde_json::json;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, hour, minute, 0).unwrap()
    }

    fn check_in(user: &str, when: DateTime<Utc>) -> AttendanceEvent {
        AttendanceEvent::check_in(user, when, offset())
    }

    #[test]
    fn test_second_check_in_same_day_conflicts() {
        let queue = EventQueue::in_memory(5);
        queue.enqueue(check_in("u1", at(7, 0))).unwrap();

        let result = queue.enqueue(check_in("u1", at(18, 0)));
        assert_matches!(
            result,
            Err(QueueError::Conflict(ConflictError::DuplicateCheckIn { ref user_id, .. })) if user_id == "u1"
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_check_in_other_day_or_user_allowed() {
        let queue = EventQueue::in_memory(5);
        queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        queue.enqueue(check_in("u2", at(7, 0))).unwrap();
        queue
            .enqueue(check_in("u1", at(7, 0) + Duration::days(1)))
            .unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_rejected_check_in_frees_the_day() {
        let queue = EventQueue::in_memory(5);
        let id = queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        queue.mark_rejected(id, RejectReason::SessionExpired).unwrap();

        queue.enqueue(check_in("u1", at(9, 0))).unwrap();
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_delivered_check_in_still_blocks() {
        let queue = EventQueue::in_memory(5);
        let id = queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        queue.mark_in_flight(id).unwrap();
        queue.mark_delivered(id, json!({})).unwrap();

        assert_matches!(
            queue.enqueue(check_in("u1", at(20, 0))),
            Err(QueueError::Conflict(ConflictError::DuplicateCheckIn { .. }))
        );
    }

    #[test]
    fn test_same_id_twice_conflicts() {
        let queue = EventQueue::in_memory(5);
        let event = AttendanceEvent::party_join("u1", "ABC234", None, at(7, 0), offset());
        queue.enqueue(event.clone()).unwrap();
        assert_matches!(
            queue.enqueue(event),
            Err(QueueError::Conflict(ConflictError::DuplicateEvent(_)))
        );
    }

    #[test]
    fn test_next_batch_is_fifo_and_bounded() {
        let queue = EventQueue::in_memory(5);
        let late = queue
            .enqueue(AttendanceEvent::party_join("u1", "BBBBBB", None, at(9, 0), offset()))
            .unwrap();
        let early = queue
            .enqueue(AttendanceEvent::party_join("u1", "AAAAAA", None, at(8, 0), offset()))
            .unwrap();
        let first = queue.enqueue(check_in("u1", at(7, 0))).unwrap();

        let batch = queue.next_batch_at(2, at(10, 0));
        let ids: Vec<EventId> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first, early]);

        let all = queue.next_batch_at(10, at(10, 0));
        assert_eq!(all.last().map(|e| e.id), Some(late));
    }

    #[test]
    fn test_in_flight_not_in_batch() {
        let queue = EventQueue::in_memory(5);
        let id = queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        queue.mark_in_flight(id).unwrap();
        assert!(queue.next_batch_at(10, at(8, 0)).is_empty());
        assert_matches!(
            queue.mark_in_flight(id),
            Err(QueueError::InvalidTransition { from: EventStatus::InFlight, .. })
        );
    }

    #[test]
    fn test_retry_schedules_then_exhausts() {
        let queue = EventQueue::in_memory(2);
        let id = queue.enqueue(check_in("u1", at(7, 0))).unwrap();

        for attempt in 1..=2 {
            queue.mark_in_flight(id).unwrap();
            let not_before = at(7, attempt);
            assert_eq!(
                queue.mark_retry(id, not_before).unwrap(),
                RetryOutcome::Scheduled { attempts: attempt, not_before }
            );
            assert!(queue.next_batch_at(10, not_before - Duration::seconds(1)).is_empty());
            assert_eq!(queue.next_batch_at(10, not_before).len(), 1);
        }

        queue.mark_in_flight(id).unwrap();
        assert_eq!(
            queue.mark_retry(id, at(8, 0)).unwrap(),
            RetryOutcome::Exhausted { attempts: 3 }
        );
        let event = queue.get(id).unwrap();
        assert_eq!(event.status, EventStatus::Rejected);
        assert_eq!(event.rejection, Some(RejectReason::MaxAttemptsExceeded));
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_status_changes_are_broadcast() {
        let queue = EventQueue::in_memory(5);
        let mut rx = queue.subscribe();
        let id = queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        queue.mark_in_flight(id).unwrap();
        queue.mark_rejected(id, RejectReason::AlreadyCheckedIn).unwrap();

        let statuses: Vec<EventStatus> = (0..3).map(|_| rx.try_recv().unwrap().status).collect();
        assert_eq!(
            statuses,
            vec![EventStatus::Pending, EventStatus::InFlight, EventStatus::Rejected]
        );
    }

    #[test]
    fn test_purge_waits_for_cache_refresh() {
        let queue = EventQueue::in_memory(5);
        let today = at(7, 0).date_naive();
        let join = queue
            .enqueue(AttendanceEvent::party_join("u1", "ABCDEF", None, at(7, 0), offset()))
            .unwrap();
        let check = queue.enqueue(check_in("u1", at(7, 5))).unwrap();
        for id in [join, check] {
            queue.mark_in_flight(id).unwrap();
            queue.mark_delivered(id, json!({ "party_id": "p1" })).unwrap();
        }

        assert_eq!(queue.purge_settled(today).unwrap(), 0);
        assert_eq!(queue.awaiting_refresh().len(), 2);

        queue.mark_cache_refreshed(join).unwrap();
        queue.mark_cache_refreshed(check).unwrap();
        assert_eq!(queue.purge_settled(today).unwrap(), 1);

        // Today's delivered check-in stays until the day is over.
        assert_eq!(queue.events().len(), 1);
        assert_eq!(queue.purge_settled(today + Duration::days(1)).unwrap(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pinned_keys_cover_unsettled_events() {
        let queue = EventQueue::in_memory(5);
        queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        let keys = queue.pinned_keys();
        assert!(keys.contains(&ResourceKey::Streak("u1".into())));
        assert!(keys.contains(&ResourceKey::TodayCheckins));
    }

    #[test]
    fn test_restart_resets_in_flight() {
        let root = tempfile::tempdir().unwrap();
        let store = JsonStore::open(root.path(), "u1").unwrap();
        let queue = EventQueue::open(store.clone(), 5).unwrap();
        let id = queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        queue.mark_in_flight(id).unwrap();
        drop(queue);

        let reopened = EventQueue::open(store, 5).unwrap();
        let event = reopened.get(id).unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert_matches!(
            reopened.enqueue(check_in("u1", at(9, 0))),
            Err(QueueError::Conflict(ConflictError::DuplicateCheckIn { .. }))
        );
    }

    #[test]
    fn test_cache_refreshed_requires_resolved_event() {
        let queue = EventQueue::in_memory(5);
        let id = queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        assert_matches!(
            queue.mark_cache_refreshed(id),
            Err(QueueError::InvalidTransition {
                from: EventStatus::Pending,
                to: EventStatus::Pending,
                ..
            })
        );

        queue.mark_in_flight(id).unwrap();
        queue.mark_rejected(id, RejectReason::AlreadyCheckedIn).unwrap();
        queue.mark_cache_refreshed(id).unwrap();
        let event = queue.get(id).unwrap();
        assert_eq!(event.status, EventStatus::Rejected);
        assert!(event.cache_refreshed);
    }

    #[test]
    fn test_release_after_failed_record() {
        let root = tempfile::tempdir().unwrap();
        let store = JsonStore::open(root.path(), "u1").unwrap();
        let queue = EventQueue::open(store.clone(), 5).unwrap();
        let id = queue.enqueue(check_in("u1", at(7, 0))).unwrap();
        queue.mark_in_flight(id).unwrap();

        std::fs::remove_dir_all(store.dir()).unwrap();
        assert_matches!(queue.mark_delivered(id, json!({})), Err(QueueError::Storage(_)));
        assert_eq!(queue.get(id).unwrap().status, EventStatus::InFlight);

        assert!(queue.release_in_flight(id));
        assert!(!queue.release_in_flight(id));
        let batch = queue.next_batch_at(10, at(8, 0));
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![id]);

        std::fs::create_dir_all(store.dir()).unwrap();
        queue.mark_in_flight(id).unwrap();
        queue.mark_delivered(id, json!({})).unwrap();
        assert_eq!(queue.get(id).unwrap().status, EventStatus::Delivered);
    }
}
