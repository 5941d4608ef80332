//! CLI command definitions and dispatch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::warn;

use rollcall_core::auth::{Session, SessionData};
use rollcall_core::{
    AttendanceCore, Config, DrainOutcome, EventId, EventStatus, Freshness, LedgerClient,
    ResourceKey,
};

/// Pause before asking again when another drain was already running.
const COALESCED_RETRY_WAIT: Duration = Duration::from_millis(50);

/// rollcall - offline-first gym attendance
#[derive(Debug, Parser)]
#[command(name = "rollcall", version, about, long_about = None)]
pub struct Cli {
    /// Treat the network as unavailable for this run
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Store the session handed over by the identity provider
    Login {
        #[arg(long)]
        user: String,
        #[arg(long)]
        token: String,
        /// Token lifetime announced by the provider
        #[arg(long)]
        expires_in_minutes: Option<i64>,
    },
    /// Forget the stored session
    Logout,
    /// Record today's check-in
    CheckIn,
    /// Create a party and print its join code
    CreateParty,
    /// Join a party by its six-character code
    Join { code: String },
    /// Deliver queued events now
    Flush,
    /// Show queued events and cached resources
    Status,
    /// Print a cached resource: today_checkins, weekly_ranking, streak:<user>, party:<id>
    Show { key: String },
    /// Stay offline until `online` is run
    Offline,
    /// Go back online
    Online,
}

impl Cli {
    pub async fn execute(&self, mut config: Config) -> Result<()> {
        match &self.command {
            Commands::Login {
                user,
                token,
                expires_in_minutes,
            } => login(&mut config, user, token, *expires_in_minutes),
            Commands::Logout => logout(&config),
            Commands::Offline => set_offline(&mut config, true),
            Commands::Online => set_offline(&mut config, false),
            Commands::CheckIn => {
                let core = open_core(&config)?;
                let id = core.check_in()?;
                drain(&core).await;
                print_event(&core, id, "Check-in");
                core.shutdown().await
            }
            Commands::CreateParty => {
                let core = open_core(&config)?;
                let (id, proposed) = core.create_party()?;
                drain(&core).await;
                // The ledger may assign a different code than the one proposed.
                let code = core
                    .queue()
                    .get(id)
                    .and_then(|e| e.outcome)
                    .and_then(|o| o.get("code").and_then(|c| c.as_str()).map(str::to_string))
                    .unwrap_or_else(|| proposed.to_string());
                println!("Party code: {}", code);
                print_event(&core, id, "Party");
                core.shutdown().await
            }
            Commands::Join { code } => {
                let core = open_core(&config)?;
                let id = core.join_party(code)?;
                drain(&core).await;
                print_event(&core, id, "Join");
                core.shutdown().await
            }
            Commands::Flush => {
                let core = open_core(&config)?;
                match drain(&core).await {
                    DrainOutcome::Completed(report) => println!(
                        "Delivered {}, rejected {}, retrying {}; {} pending",
                        report.delivered,
                        report.rejected,
                        report.retried,
                        core.pending_count()
                    ),
                    _ => println!("Offline; {} event(s) waiting", core.pending_count()),
                }
                core.shutdown().await
            }
            Commands::Status => {
                let core = open_core(&config)?;
                print_status(&core);
                core.shutdown().await
            }
            Commands::Show { key } => {
                let key: ResourceKey = key.parse()?;
                let core = open_core(&config)?;
                show(&core, &key).await?;
                core.shutdown().await
            }
        }
    }
}

fn login(config: &mut Config, user: &str, token: &str, expires_in_minutes: Option<i64>) -> Result<()> {
    let mut data = SessionData::new(user, token);
    if let Some(minutes) = expires_in_minutes {
        data = data.expiring_in(chrono::Duration::minutes(minutes));
    }
    let mut session = Session::open(config.data_dir()?)?;
    session.update(data);
    session.save().context("Failed to save session")?;
    config.last_user = Some(user.to_string());
    config.save().context("Failed to save config")?;
    println!("Signed in as {}", user);
    Ok(())
}

fn logout(config: &Config) -> Result<()> {
    let mut session = Session::open(config.data_dir()?)?;
    session.clear()?;
    println!("Signed out. Queued events are kept until you sign in again.");
    Ok(())
}

fn set_offline(config: &mut Config, offline: bool) -> Result<()> {
    config.offline = offline;
    config.save().context("Failed to save config")?;
    println!("{}", if offline { "Offline" } else { "Online" });
    Ok(())
}

fn open_core(config: &Config) -> Result<AttendanceCore> {
    let mut session = Session::open(config.data_dir()?)?;
    if !session.load()? {
        bail!("Not signed in. Run `rollcall login --user <id> --token <token>` first.");
    }
    let Some(data) = session.data else {
        bail!("Not signed in");
    };

    let client = LedgerClient::new(&config.api_base_url, config.sync.request_timeout())?
        .with_token(data.token);
    AttendanceCore::start(config, &data.user_id, Arc::new(client))
}

/// Flush, waiting out a drain the background coordinator already started.
async fn drain(core: &AttendanceCore) -> DrainOutcome {
    loop {
        match core.flush().await {
            DrainOutcome::Coalesced => tokio::time::sleep(COALESCED_RETRY_WAIT).await,
            outcome => return outcome,
        }
    }
}

fn print_event(core: &AttendanceCore, id: EventId, label: &str) {
    let Some(event) = core.queue().get(id) else {
        println!("{} synced", label);
        return;
    };
    match event.status {
        EventStatus::Delivered => println!("{} synced", label),
        EventStatus::Rejected => match event.rejection {
            Some(reason) => println!("{} rejected: {}", label, reason),
            None => println!("{} rejected", label),
        },
        EventStatus::Pending | EventStatus::InFlight => {
            println!("{} saved; it will sync when the network is back", label)
        }
    }
}

fn print_status(core: &AttendanceCore) {
    println!("User:    {}", core.user_id());
    println!("Network: {}", if core.is_online() { "online" } else { "offline" });
    println!("Pending: {}", core.pending_count());

    for event in core.queue().events() {
        let created = event.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
        let mut line = format!(
            "  {}  {:<12} {:<10} {}",
            created,
            event.kind.to_string(),
            event.status.to_string(),
            event.id
        );
        if event.attempts > 0 {
            line.push_str(&format!("  attempts={}", event.attempts));
        }
        if let Some(reason) = &event.rejection {
            line.push_str(&format!("  ({})", reason));
        }
        println!("{}", line);
    }

    let keys = core.cache().keys();
    if !keys.is_empty() {
        println!("Cache:");
        for key in keys {
            let age = core.cache().age_display(&key).unwrap_or_default();
            println!("  {:<24} {}", key.to_string(), age);
        }
    }
}

async fn show(core: &AttendanceCore, key: &ResourceKey) -> Result<()> {
    if core.is_online() {
        if let Err(e) = core.refresh(key).await {
            warn!(key = %key, error = %e, "Refresh failed, showing cached copy");
        }
    }

    let read = core.cache_get(key);
    let Some(value) = read.value else {
        bail!("Nothing cached for {} yet", key);
    };
    if read.freshness == Freshness::Stale {
        let age = core.cache().age_display(key).unwrap_or_default();
        eprintln!("(cached {}, may be out of date)", age);
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
