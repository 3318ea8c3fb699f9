//! Flaky ledger store for integration testing.
//!
//! Wraps a `MemoryStore` and, once armed, fails every `commit` with a
//! forced error, so callers' failure paths can be driven from tests while
//! reads keep working.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use parlor::storage::{HistoryFilter, LedgerStore, MemoryStore, TransactionFilter, UnitOfWork};
use parlor::types::{Account, GamblingHistoryRecord, TransactionRecord};

pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    /// If set, every commit returns this error.
    force_error: Mutex<Option<String>>,
    failed_commits: Mutex<usize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStore::new()),
            force_error: Mutex::new(None),
            failed_commits: Mutex::new(0),
        }
    }

    /// Fail all subsequent commits.
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn failed_commits(&self) -> usize {
        *self.failed_commits.lock().unwrap()
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn find_account(&self, id: &str) -> Result<Option<Account>> {
        self.inner.find_account(id).await
    }

    async fn insert_account(&self, account: Account) -> Result<bool> {
        self.inner.insert_account(account).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.inner.list_accounts().await
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<()> {
        let forced = self.force_error.lock().unwrap().clone();
        if let Some(msg) = forced {
            *self.failed_commits.lock().unwrap() += 1;
            return Err(anyhow!(msg));
        }
        self.inner.commit(unit).await
    }

    async fn find_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>> {
        self.inner.find_transactions(filter).await
    }

    async fn find_history(&self, filter: &HistoryFilter) -> Result<Vec<GamblingHistoryRecord>> {
        self.inner.find_history(filter).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parlor::config::{EconomyConfig, GamblingConfig, LoanConfig, RacingConfig};
    use parlor::economy::scheduler::run_weekly_jobs;
    use parlor::economy::{Bank, LoanDesk};
    use parlor::gambling::racing::BetType;
    use parlor::gambling::{RaceTrack, RngSource, Settlement};

    async fn flaky_with(players: &[&str]) -> Arc<FlakyStore> {
        let store = Arc::new(FlakyStore::new());
        for p in players {
            store.insert_account(Account::new(p, p, p, 1000.0)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_failed_loan_commit_changes_nothing() {
        let store = flaky_with(&["a"]).await;
        let desk = LoanDesk::new(store.clone(), LoanConfig::default(), "bank");

        store.set_error("write refused");
        let err = desk.request_loan("a", 500.0, 4).await.unwrap_err();
        assert!(!err.is_rejection());
        assert_eq!(store.failed_commits(), 1);

        let acct = store.find_account("a").await.unwrap().unwrap();
        assert_eq!(acct.cash, 1000.0);
        assert_eq!(acct.total_debt, 0.0);
        assert!(acct.debts.is_empty());
        assert!(store.inner.snapshot().await.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_weekly_jobs_survive_store_failure() {
        let store = flaky_with(&["a"]).await;
        let bank = Bank::new(store.clone(), EconomyConfig::default());
        let desk = LoanDesk::new(store.clone(), LoanConfig::default(), "bank");
        bank.deposit("a", 500.0).await.unwrap();
        desk.request_loan("a", 1000.0, 4).await.unwrap();

        store.set_error("disk full");
        let report = run_weekly_jobs(&bank, &desk).await;
        assert_eq!(report.interest.unwrap().failures, 1);
        // The loan is less than a week old, so nothing accrues yet.
        assert_eq!(report.accrual.unwrap().loans_accrued, 0);

        let next_week = chrono::Utc::now() + chrono::Duration::days(8);
        let accrual = desk.weekly_accrual_at(next_week).await.unwrap();
        assert_eq!(accrual.failures, 1);
        assert_eq!(accrual.loans_accrued, 0);

        let acct = store.find_account("a").await.unwrap().unwrap();
        assert_eq!(acct.bank, 500.0);
        assert_eq!(acct.credit_score, 495);
    }

    #[tokio::test]
    async fn test_failed_race_settlement_keeps_session_for_reaper() {
        let store = flaky_with(&["a", "b"]).await;
        let settlement = Arc::new(Settlement::new(store.clone(), GamblingConfig::default(), "bank"));
        let track = RaceTrack::new(
            settlement,
            RacingConfig {
                betting_window_secs: 0,
                tick_millis: 0,
                ..RacingConfig::default()
            },
            Arc::new(RngSource::new(Some(17))),
        );

        track.start_race("g", "c").unwrap();
        track.place_bet("g", "a", BetType::Win, vec![1], 100.0).await.unwrap();
        track.place_bet("g", "b", BetType::Win, vec![2], 100.0).await.unwrap();

        store.set_error("connection lost");
        let report = track.run_lifecycle("g").await.unwrap().unwrap();
        assert_eq!(report.settlement_failures, 2);
        assert_eq!(track.active_count(), 1);

        // Once the store recovers, the reaper refunds the unsettled stakes.
        store.clear_error();
        let later = chrono::Utc::now() + chrono::Duration::hours(1);
        assert_eq!(track.reap_stale(later).await, 1);
        for p in ["a", "b"] {
            assert_eq!(store.find_account(p).await.unwrap().unwrap().cash, 1000.0);
        }
    }
}
