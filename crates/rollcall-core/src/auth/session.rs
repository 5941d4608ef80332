use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::JsonStore;

/// Store file holding the active session, shared by all users of the device.
const SESSION_FILE: &str = "session";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub user_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    /// Provider-supplied expiry, if it announced one.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionData {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn expiring_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.created_at + ttl);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.map(|at| at - Utc::now())
    }
}

/// The signed-in user, persisted next to (not inside) the per-user stores.
pub struct Session {
    store: JsonStore,
    pub data: Option<SessionData>,
}

impl Session {
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            store: JsonStore::in_dir(data_dir)?,
            data: None,
        })
    }

    /// Returns true if a usable session was found. An expired one is dropped.
    pub fn load(&mut self) -> Result<bool> {
        let data: Option<SessionData> = self
            .store
            .load(SESSION_FILE)
            .context("Failed to load session")?;
        self.data = data.filter(|d| {
            if d.is_expired() {
                debug!(user = %d.user_id, "Stored session has expired");
            }
            !d.is_expired()
        });
        Ok(self.data.is_some())
    }

    pub fn save(&self) -> Result<()> {
        match self.data {
            Some(ref data) => {
                self.store.save(SESSION_FILE, data)?;
                info!(user = %data.user_id, "Session saved");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.data = None;
        self.store.remove(SESSION_FILE)
    }

    pub fn update(&mut self, data: SessionData) {
        self.data = Some(data);
    }

    pub fn token(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.token.as_str())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.user_id.as_str())
    }

    pub fn is_valid(&self) -> bool {
        self.data.as_ref().is_some_and(|d| !d.is_expired())
    }
}
