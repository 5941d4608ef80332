//! Application configuration management.
//!
//! Configuration is computed once at startup and handed to the components
//! that need it. It is stored at `~/.config/rollcall/config.json`, and a few
//! values may be overridden from the environment (`ROLLCALL_API_URL`,
//! `ROLLCALL_DATA_DIR`, `ROLLCALL_OFFLINE`, `ROLLCALL_UTC_OFFSET_MINUTES`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Local, Offset};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::ResourceKey;

/// Application name used for config/data directory paths
const APP_NAME: &str = "rollcall";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default attendance ledger endpoint
pub const DEFAULT_API_BASE_URL: &str = "https://api.rollcall.gym/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_base_url: String,
    /// Overrides the platform data directory for queue/cache persistence.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub last_user: Option<String>,
    /// Start with the network considered unavailable.
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            data_dir: None,
            last_user: None,
            offline: false,
            sync: SyncConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
    /// Retry ceiling; the event is rejected once attempts exceed it.
    pub max_attempts: u32,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
    pub periodic_interval_secs: u64,
    /// Offset used to decide which calendar day a check-in belongs to.
    /// `None` means the host's local offset at startup.
    pub utc_offset_minutes: Option<i32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_fraction: 0.2,
            max_attempts: 5,
            batch_size: 16,
            request_timeout_secs: 10,
            periodic_interval_secs: 30,
            utc_offset_minutes: None,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs.max(1))
    }

    /// Resolve the calendar-day offset once.
    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
            .unwrap_or_else(|| Local::now().offset().fix())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub today_checkins_ttl_secs: i64,
    pub weekly_ranking_ttl_secs: i64,
    pub streak_ttl_secs: i64,
    pub party_ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            today_checkins_ttl_secs: 60,
            weekly_ranking_ttl_secs: 5 * 60,
            streak_ttl_secs: 15 * 60,
            party_ttl_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, key: &ResourceKey) -> chrono::Duration {
        let secs = match key {
            ResourceKey::TodayCheckins => self.today_checkins_ttl_secs,
            ResourceKey::WeeklyRanking => self.weekly_ranking_ttl_secs,
            ResourceKey::Streak(_) => self.streak_ttl_secs,
            ResourceKey::Party(_) => self.party_ttl_secs,
        };
        chrono::Duration::seconds(secs.max(0))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Root directory for per-user persisted state.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("ROLLCALL_API_URL") {
            self.api_base_url = url;
        }
        if let Ok(dir) = std::env::var("ROLLCALL_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(raw) = std::env::var("ROLLCALL_OFFLINE") {
            self.offline = matches!(raw.trim(), "1" | "true" | "yes");
        }
        if let Ok(raw) = std::env::var("ROLLCALL_UTC_OFFSET_MINUTES") {
            match raw.parse::<i32>() {
                Ok(minutes) => self.sync.utc_offset_minutes = Some(minutes),
                Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid ROLLCALL_UTC_OFFSET_MINUTES"),
            }
        }
    }
}
