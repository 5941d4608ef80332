use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::PartyCode;
use crate::store::JsonStore;

/// Store file holding known party codes.
const PARTIES_FILE: &str = "parties";

/// Generation attempts before giving up with `ExhaustedCodeSpace`.
const DEFAULT_MAX_GENERATE_ATTEMPTS: u32 = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("Party codes are 6 letters or digits, got {0:?}")]
    Malformed(String),

    #[error("No party uses code {0}")]
    NotFound(PartyCode),

    #[error("Party {code} has already closed")]
    Expired { code: PartyCode, party_id: String },

    #[error("Could not find a free party code - try again later")]
    ExhaustedCodeSpace,

    #[error("Failed to save party codes: {0}")]
    Storage(String),
}

/// A resolved, active party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRef {
    pub party_id: String,
    pub code: PartyCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartyRecord {
    party_id: String,
    active: bool,
    updated_at: DateTime<Utc>,
}

/// Known party codes and whether their party is still open.
pub struct PartyCodeResolver {
    parties: Mutex<HashMap<PartyCode, PartyRecord>>,
    store: Option<JsonStore>,
    max_attempts: u32,
}

impl Default for PartyCodeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PartyCodeResolver {
    pub fn new() -> Self {
        Self {
            parties: Mutex::new(HashMap::new()),
            store: None,
            max_attempts: DEFAULT_MAX_GENERATE_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn open(store: JsonStore) -> anyhow::Result<Self> {
        let records: Vec<(PartyCode, PartyRecord)> = store.load(PARTIES_FILE)?.unwrap_or_default();
        debug!(parties = records.len(), "Loaded party codes");
        let mut resolver = Self::new();
        resolver.parties = Mutex::new(records.into_iter().collect());
        resolver.store = Some(store);
        Ok(resolver)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PartyCode, PartyRecord>> {
        self.parties.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, parties: &HashMap<PartyCode, PartyRecord>) -> Result<(), ResolverError> {
        let Some(ref store) = self.store else {
            return Ok(());
        };
        let mut records: Vec<(&PartyCode, &PartyRecord)> = parties.iter().collect();
        records.sort_by(|a, b| a.0.cmp(b.0));
        store
            .save(PARTIES_FILE, &records)
            .map_err(|e| ResolverError::Storage(e.to_string()))
    }

    /// A fresh code not used by any active party.
    pub fn generate(&self) -> Result<PartyCode, ResolverError> {
        self.generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<PartyCode, ResolverError> {
        let parties = self.lock();
        for attempt in 1..=self.max_attempts {
            let code = PartyCode::random(rng);
            match parties.get(&code) {
                Some(record) if record.active => {
                    debug!(code = %code, attempt, "Generated code collides with an active party");
                }
                _ => return Ok(code),
            }
        }
        warn!(attempts = self.max_attempts, active = parties.len(), "Party code space exhausted");
        Err(ResolverError::ExhaustedCodeSpace)
    }

    /// Normalize `input` and resolve it to an active party, telling apart
    /// codes never seen from codes whose party has closed.
    pub fn validate(&self, input: &str) -> Result<PartyRef, ResolverError> {
        let code = PartyCode::parse(input)?;
        let parties = self.lock();
        match parties.get(&code) {
            Some(record) if record.active => Ok(PartyRef {
                party_id: record.party_id.clone(),
                code,
            }),
            Some(record) => Err(ResolverError::Expired {
                party_id: record.party_id.clone(),
                code,
            }),
            None => Err(ResolverError::NotFound(code)),
        }
    }

    /// Record `code` as belonging to an active party.
    pub fn register(&self, code: PartyCode, party_id: impl Into<String>) -> Result<(), ResolverError> {
        self.sync_party(code, party_id, true)
    }

    /// Apply the ledger's view of a party.
    pub fn sync_party(
        &self,
        code: PartyCode,
        party_id: impl Into<String>,
        active: bool,
    ) -> Result<(), ResolverError> {
        let party_id = party_id.into();
        let mut parties = self.lock();
        info!(code = %code, party = %party_id, active, "Party code updated");
        parties.insert(
            code,
            PartyRecord {
                party_id,
                active,
                updated_at: Utc::now(),
            },
        );
        self.persist(&parties)
    }

    /// Mark a known code's party as closed. Returns false for unknown codes.
    pub fn expire(&self, code: &PartyCode) -> Result<bool, ResolverError> {
        let mut parties = self.lock();
        let Some(record) = parties.get_mut(code) else {
            return Ok(false);
        };
        if !record.active {
            return Ok(true);
        }
        record.active = false;
        record.updated_at = Utc::now();
        info!(code = %code, "Party code expired");
        self.persist(&parties)?;
        Ok(true)
    }

    pub fn active_codes(&self) -> Vec<PartyCode> {
        let mut codes: Vec<PartyCode> = self
            .lock()
            .iter()
            .filter(|(_, record)| record.active)
            .map(|(code, _)| code.clone())
            .collect();
        codes.sort();
        codes
    }
}
