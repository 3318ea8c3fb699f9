//! PARLOR: community economy and gambling ledger engine
//!
//! Entry point. Loads configuration, initialises structured logging, opens
//! the ledger store, wires up the economy and game services, and runs the
//! weekly jobs and session reaper until shutdown.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use parlor::config::{self, StorageBackend};
use parlor::dashboard::{self, DashboardState};
use parlor::economy::scheduler::{next_weekly_run, run_weekly_jobs, until_next_run};
use parlor::economy::{Bank, LoanDesk};
use parlor::gambling::{BlackjackTables, RaceTrack, RngSource, Settlement};
use parlor::storage::{self, LedgerStore, MemoryStore};

const BANNER: &str = r#"
 ____   _    ____  _     ___  ____
|  _ \ / \  |  _ \| |   / _ \|  _ \
| |_) / _ \ | |_) | |  | | | | |_) |
|  __/ ___ \|  _ <| |__| |_| |  _ <
|_| /_/   \_\_| \_\_____\___/|_| \_\

  Community economy and gambling ledger
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("PARLOR_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        config = %config_path,
        backend = ?cfg.storage.backend,
        bank_account = %cfg.economy.bank_account_id,
        "PARLOR starting up"
    );

    // -- Storage ---------------------------------------------------------

    // Keep a concrete handle on the memory store so it can be snapshotted
    // on shutdown.
    let memory = match cfg.storage.backend {
        StorageBackend::Memory => Some(Arc::new(MemoryStore::load_snapshot(&cfg.storage.snapshot_path)?)),
        StorageBackend::Sqlite => None,
    };
    let store: Arc<dyn LedgerStore> = match &memory {
        Some(m) => m.clone() as Arc<dyn LedgerStore>,
        None => storage::open(&cfg.storage).await?,
    };

    // -- Services --------------------------------------------------------

    let bank_id = cfg.economy.bank_account_id.clone();
    let bank = Bank::new(store.clone(), cfg.economy.clone());
    let loans = LoanDesk::new(store.clone(), cfg.loans.clone(), &bank_id);

    let rng = Arc::new(RngSource::new(cfg.gambling.rng_seed));
    if cfg.gambling.rng_seed.is_some() {
        warn!("Gambling RNG is seeded: outcomes are reproducible");
    }
    let settlement = Arc::new(Settlement::new(store.clone(), cfg.gambling.clone(), &bank_id));
    let track = Arc::new(RaceTrack::new(settlement.clone(), cfg.racing.clone(), rng.clone()));
    let tables = Arc::new(BlackjackTables::new(settlement.clone(), cfg.blackjack.clone(), rng));

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(store.clone(), track.clone(), tables.clone()));
        if let Err(e) = dashboard::spawn_dashboard(state, cfg.dashboard.port).await {
            error!(error = %e, "Dashboard failed to start, continuing without it");
        }
    }

    // -- Main loop -------------------------------------------------------

    let mut reap_interval = tokio::time::interval(Duration::from_secs(cfg.scheduler.reap_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let weekly = tokio::time::sleep(until_next_run(Utc::now()));
    tokio::pin!(weekly);

    info!(
        next_weekly_run = %next_weekly_run(Utc::now()),
        scheduler = cfg.scheduler.enabled,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = &mut weekly, if cfg.scheduler.enabled => {
                let report = run_weekly_jobs(&bank, &loans).await;
                info!(
                    interest_paid = ?report.interest.as_ref().map(|r| format!("${:.2}", r.total_interest)),
                    loans_accrued = ?report.accrual.as_ref().map(|r| r.loans_accrued),
                    "Weekly jobs complete"
                );
                weekly.as_mut().reset(tokio::time::Instant::now() + until_next_run(Utc::now()));
                persist(memory.as_deref(), &cfg.storage.snapshot_path).await;
            }
            _ = reap_interval.tick() => {
                let now = Utc::now();
                let races = track.reap_stale(now).await;
                let games = tables.expire_idle(now).await;
                if races + games > 0 {
                    info!(races, games, "Reaped orphaned sessions");
                }
                persist(memory.as_deref(), &cfg.storage.snapshot_path).await;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    if let Some(m) = &memory {
        m.save_snapshot(&cfg.storage.snapshot_path).await?;
    }
    info!(
        active_races = track.active_count(),
        active_games = tables.active_count(),
        "PARLOR shut down cleanly."
    );

    Ok(())
}

/// Write the memory backend's snapshot. A failed write is logged and the
/// loop carries on; the next tick retries.
async fn persist(memory: Option<&MemoryStore>, path: &str) {
    if let Some(m) = memory {
        if let Err(e) = m.save_snapshot(path).await {
            warn!(error = %e, path, "Failed to save ledger snapshot");
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parlor=info"));

    let json_logging = std::env::var("PARLOR_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
