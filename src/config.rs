//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section carries defaults matching the live bot, so a partial
//! (or empty) file is valid and tests can use `AppConfig::default()`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub economy: EconomyConfig,
    pub loans: LoanConfig,
    pub gambling: GamblingConfig,
    pub racing: RacingConfig,
    pub blackjack: BlackjackConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EconomyConfig {
    /// Cash granted to a newly registered account.
    pub starting_cash: f64,
    /// Reserved counterparty id used on every bank-side transaction record.
    pub bank_account_id: String,
    /// Weekly interest paid on bank balances (0.005 = 0.5%).
    pub bank_interest_rate: f64,
    /// Smallest accepted deposit/withdrawal.
    pub min_transfer: f64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            starting_cash: 1000.0,
            bank_account_id: "bank".to_string(),
            bank_interest_rate: 0.005,
            min_transfer: 1.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoanConfig {
    /// Base APR in percentage units, before the credit-score modifier.
    pub base_apr: f64,
    pub min_amount: f64,
    pub max_amount: f64,
    pub min_weeks: u32,
    pub max_weeks: u32,
    pub default_weeks: u32,
    /// Ceiling on the sum of all active loan balances.
    pub max_total_debt: f64,
    /// Below this score no loan is granted.
    pub min_credit_score: i32,
    pub origination_score_delta: i32,
    pub payoff_score_delta: i32,
    /// A remaining balance at or under this is treated as paid off.
    pub paid_off_threshold: f64,
    pub max_accrual_penalty: i32,
    pub accrual_penalty_per_week: i32,
}

impl Default for LoanConfig {
    fn default() -> Self {
        Self {
            base_apr: 15.0,
            min_amount: 100.0,
            max_amount: 5000.0,
            min_weeks: 2,
            max_weeks: 12,
            default_weeks: 4,
            max_total_debt: 10_000.0,
            min_credit_score: 350,
            origination_score_delta: -5,
            payoff_score_delta: 20,
            paid_off_threshold: 0.01,
            max_accrual_penalty: 5,
            accrual_penalty_per_week: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GamblingConfig {
    pub min_bet: f64,
    pub max_bet: f64,
    /// Fixed seed for reproducible outcomes. Unset in production.
    pub rng_seed: Option<u64>,
}

impl Default for GamblingConfig {
    fn default() -> Self {
        Self {
            min_bet: 10.0,
            max_bet: 1000.0,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RacingConfig {
    pub betting_window_secs: u64,
    pub min_bettors: usize,
    pub distance: f64,
    pub tick_millis: u64,
    /// Reported alongside results; payouts do not depend on it.
    pub house_rake: f64,
    /// Sessions older than this are considered orphaned and reaped.
    pub session_ttl_secs: u64,
}

impl Default for RacingConfig {
    fn default() -> Self {
        Self {
            betting_window_secs: 60,
            min_bettors: 2,
            distance: 100.0,
            tick_millis: 1500,
            house_rake: 0.10,
            session_ttl_secs: 900,
        }
    }
}

impl RacingConfig {
    pub fn betting_window(&self) -> Duration {
        Duration::from_secs(self.betting_window_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BlackjackConfig {
    pub idle_timeout_secs: u64,
}

impl Default for BlackjackConfig {
    fn default() -> Self {
        Self { idle_timeout_secs: 120 }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: String,
    pub max_connections: u32,
    /// JSON snapshot file for the memory backend.
    pub snapshot_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_url: "sqlite://parlor.db".to_string(),
            max_connections: 5,
            snapshot_path: "parlor_state.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub reap_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reap_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config() {
        // Runs against the repository's config.toml when the working
        // directory is the crate root; skipped silently otherwise.
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert_eq!(cfg.loans.base_apr, 15.0);
            assert_eq!(cfg.loans.max_total_debt, 10_000.0);
            assert_eq!(cfg.racing.min_bettors, 2);
            assert!(cfg.gambling.min_bet < cfg.gambling.max_bet);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.economy.starting_cash, 1000.0);
        assert_eq!(cfg.loans.min_amount, 100.0);
        assert_eq!(cfg.loans.max_amount, 5000.0);
        assert_eq!(cfg.loans.min_credit_score, 350);
        assert_eq!(cfg.blackjack.idle_timeout_secs, 120);
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn test_partial_section_overrides() {
        let cfg = AppConfig::parse(
            r#"
            [loans]
            base_apr = 20.0

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.loans.base_apr, 20.0);
        // Untouched fields in the same section keep their defaults.
        assert_eq!(cfg.loans.max_weeks, 12);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = AppConfig::parse("[storage]\nbackend = \"mongo\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_durations() {
        let cfg = RacingConfig::default();
        assert_eq!(cfg.betting_window(), Duration::from_secs(60));
        assert_eq!(cfg.tick(), Duration::from_millis(1500));
    }
}
