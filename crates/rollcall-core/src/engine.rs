//! Lifecycle owner for one user's attendance core.
//!
//! `AttendanceCore::start` loads the user's persisted queue, cache and party
//! codes and spawns the sync coordinator; `shutdown` stops it and persists
//! the cache. Everything the presentation layer needs goes through here.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, Ledger};
use crate::cache::{CacheRead, ResourceCache, ResourceKey};
use crate::config::Config;
use crate::models::{AttendanceEvent, EventId};
use crate::party::{PartyCode, PartyCodeResolver, PartyRef, ResolverError};
use crate::queue::{EventQueue, QueueError, StatusChange};
use crate::store::JsonStore;
use crate::sync::{DrainOutcome, SyncCoordinator, SyncTrigger};

/// Buffer size for sync triggers. Extra triggers are redundant while one is queued.
const TRIGGER_CHANNEL_SIZE: usize = 8;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

pub struct AttendanceCore {
    user_id: String,
    utc_offset: FixedOffset,
    queue: Arc<EventQueue>,
    cache: Arc<ResourceCache>,
    parties: Arc<PartyCodeResolver>,
    coordinator: Arc<SyncCoordinator>,
    triggers: mpsc::Sender<SyncTrigger>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AttendanceCore {
    /// Open `user_id`'s persisted state under the configured data directory
    /// and start syncing. Must be called from within a tokio runtime.
    pub fn start(config: &Config, user_id: &str, ledger: Arc<dyn Ledger>) -> Result<Self> {
        let store = JsonStore::open(&config.data_dir()?, user_id)?;
        let queue = EventQueue::open(store.clone(), config.sync.max_attempts)
            .context("Failed to open event queue")?;
        let cache = ResourceCache::open(store.clone(), config.cache.capacity)
            .context("Failed to open resource cache")?;
        let parties = PartyCodeResolver::open(store).context("Failed to open party codes")?;
        Ok(Self::assemble(config, user_id, ledger, queue, cache, parties))
    }

    /// Start with nothing persisted.
    pub fn start_in_memory(config: &Config, user_id: &str, ledger: Arc<dyn Ledger>) -> Self {
        Self::assemble(
            config,
            user_id,
            ledger,
            EventQueue::in_memory(config.sync.max_attempts),
            ResourceCache::new(config.cache.capacity),
            PartyCodeResolver::new(),
        )
    }

    fn assemble(
        config: &Config,
        user_id: &str,
        ledger: Arc<dyn Ledger>,
        queue: EventQueue,
        cache: ResourceCache,
        parties: PartyCodeResolver,
    ) -> Self {
        let utc_offset = config.sync.utc_offset();
        let queue = Arc::new(queue);
        let cache = Arc::new(cache);
        let parties = Arc::new(parties);
        cache.set_pinned(queue.pinned_keys());

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        cache.attach_refresher(refresh_tx);
        let (triggers, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            cache.clone(),
            parties.clone(),
            ledger,
            config,
            utc_offset,
        ));
        coordinator.set_online(!config.offline);
        let task = tokio::spawn(coordinator.clone().run(trigger_rx, refresh_rx, shutdown_rx));

        info!(
            user = %user_id,
            pending = queue.pending_count(),
            online = !config.offline,
            "Attendance core started"
        );

        Self {
            user_id: user_id.to_string(),
            utc_offset,
            queue,
            cache,
            parties,
            coordinator,
            triggers,
            shutdown_tx,
            task: Some(task),
        }
    }

    fn request_sync(&self, trigger: SyncTrigger) {
        if let Err(e) = self.triggers.try_send(trigger) {
            debug!(trigger = ?trigger, error = %e, "Sync trigger dropped");
        }
    }

    fn submit(&self, event: AttendanceEvent) -> Result<EventId, CoreError> {
        let id = self.queue.enqueue(event)?;
        self.cache.set_pinned(self.queue.pinned_keys());
        self.request_sync(SyncTrigger::Flush);
        Ok(id)
    }

    /// Record today's check-in. Fails with a conflict if one is already
    /// queued or delivered for today.
    pub fn check_in(&self) -> Result<EventId, CoreError> {
        self.check_in_at(Utc::now())
    }

    pub fn check_in_at(&self, now: DateTime<Utc>) -> Result<EventId, CoreError> {
        self.submit(AttendanceEvent::check_in(&self.user_id, now, self.utc_offset))
    }

    /// Queue a party creation with a locally generated code proposal.
    pub fn create_party(&self) -> Result<(EventId, PartyCode), CoreError> {
        let code = self.parties.generate()?;
        let event = AttendanceEvent::party_create(&self.user_id, &code, Utc::now(), self.utc_offset);
        Ok((self.submit(event)?, code))
    }

    /// Queue a join. Malformed codes and codes known to be expired fail
    /// immediately; unknown codes are left for the ledger to judge.
    pub fn join_party(&self, input: &str) -> Result<EventId, CoreError> {
        let party_id = match self.parties.validate(input) {
            Ok(party) => Some(party.party_id),
            Err(ResolverError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let code = PartyCode::parse(input)?;
        let event = AttendanceEvent::party_join(
            &self.user_id,
            code.as_str(),
            party_id.as_deref(),
            Utc::now(),
            self.utc_offset,
        );
        self.submit(event)
    }

    /// Drain the queue now.
    pub async fn flush(&self) -> DrainOutcome {
        self.coordinator.flush().await
    }

    pub fn set_online(&self, online: bool) {
        if self.coordinator.set_online(online) {
            self.request_sync(SyncTrigger::ConnectivityRestored);
        }
    }

    pub fn is_online(&self) -> bool {
        self.coordinator.is_online()
    }

    pub fn cache_get(&self, key: &ResourceKey) -> CacheRead {
        self.cache.get(key)
    }

    pub fn cache_put(&self, key: ResourceKey, value: Value, ttl: Duration) {
        self.cache.put(key, value, ttl);
    }

    pub fn cache_invalidate(&self, key: &ResourceKey) -> bool {
        self.cache.invalidate(key)
    }

    /// Ask the coordinator to fetch `key`, e.g. after a `Missing` read.
    pub fn request_refresh(&self, key: &ResourceKey) -> bool {
        self.cache.request_refresh(key)
    }

    /// Fetch `key` now and wait for it.
    pub async fn refresh(&self, key: &ResourceKey) -> Result<(), ApiError> {
        self.coordinator.refresh(key).await
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.queue.subscribe()
    }

    pub fn generate_code(&self) -> Result<PartyCode, ResolverError> {
        self.parties.generate()
    }

    pub fn validate_code(&self, input: &str) -> Result<PartyRef, ResolverError> {
        self.parties.validate(input)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn parties(&self) -> &PartyCodeResolver {
        &self.parties
    }

    /// Stop the coordinator and persist the cache.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.await.context("Sync coordinator task failed")?;
        }
        self.cache.detach_refresher();
        self.cache.persist()?;
        info!(user = %self.user_id, pending = self.queue.pending_count(), "Attendance core stopped");
        Ok(())
    }
}

impl Drop for AttendanceCore {
    fn drop(&mut self) {
        if self.task.is_some() {
            warn!(user = %self.user_id, "Attendance core dropped without shutdown");
            let _ = self.shutdown_tx.send(true);
            if let Err(e) = self.cache.persist_if_dirty() {
                warn!(error = %e, "Failed to persist resource cache");
            }
        }
    }
}
