//! Persistence layer.
//!
//! The engine talks to storage only through [`LedgerStore`]. Every
//! money-moving operation builds one [`UnitOfWork`] (account updates plus
//! the records describing them) and hands it to `commit`, which applies
//! all of it or none of it. Two backends ship: an in-memory store with
//! JSON snapshots, and SQLite via `sqlx`.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::types::{
    Account, GamblingHistoryRecord, GameType, Loan, TransactionKind, TransactionRecord,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Account updates
// ---------------------------------------------------------------------------

/// Field increments. Zero means untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Increments {
    pub cash: f64,
    pub bank: f64,
    pub total_debt: f64,
    pub wins: u64,
    pub losses: u64,
}

/// Field overwrites.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignments {
    pub credit_score: Option<i32>,
    pub total_debt: Option<f64>,
    pub debts: Option<Vec<Loan>>,
}

/// One `{set, push, inc}` update against a single account document.
///
/// Applied in that order: overwrites first, then appended loans, then
/// increments. An update that overwrites `total_debt` and also increments
/// it ends at `set + inc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountUpdate {
    pub set: Assignments,
    pub push: Vec<Loan>,
    pub inc: Increments,
}

impl AccountUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cash(mut self, delta: f64) -> Self {
        self.inc.cash += delta;
        self
    }

    pub fn add_bank(mut self, delta: f64) -> Self {
        self.inc.bank += delta;
        self
    }

    pub fn add_debt(mut self, delta: f64) -> Self {
        self.inc.total_debt += delta;
        self
    }

    pub fn add_win(mut self) -> Self {
        self.inc.wins += 1;
        self
    }

    pub fn add_loss(mut self) -> Self {
        self.inc.losses += 1;
        self
    }

    pub fn set_credit_score(mut self, score: i32) -> Self {
        self.set.credit_score = Some(score);
        self
    }

    pub fn set_total_debt(mut self, value: f64) -> Self {
        self.set.total_debt = Some(value);
        self
    }

    /// Replace the whole loan list.
    pub fn set_debts(mut self, debts: Vec<Loan>) -> Self {
        self.set.debts = Some(debts);
        self
    }

    pub fn push_loan(mut self, loan: Loan) -> Self {
        self.push.push(loan);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to an account document in place.
    pub fn apply(&self, account: &mut Account) {
        if let Some(score) = self.set.credit_score {
            account.credit_score = score;
        }
        if let Some(debt) = self.set.total_debt {
            account.total_debt = debt;
        }
        if let Some(debts) = &self.set.debts {
            account.debts = debts.clone();
        }

        account.debts.extend(self.push.iter().cloned());

        account.cash += self.inc.cash;
        account.bank += self.inc.bank;
        account.total_debt += self.inc.total_debt;
        account.wins += self.inc.wins;
        account.losses += self.inc.losses;
    }
}

// ---------------------------------------------------------------------------
// Unit of work
// ---------------------------------------------------------------------------

/// An append-only record produced alongside an account update.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Transaction(TransactionRecord),
    History(GamblingHistoryRecord),
}

/// Everything one operation changes. Committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOfWork {
    pub updates: Vec<(String, AccountUpdate)>,
    pub records: Vec<Record>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(mut self, account_id: &str, update: AccountUpdate) -> Self {
        self.updates.push((account_id.to_string(), update));
        self
    }

    pub fn transaction(mut self, tx: TransactionRecord) -> Self {
        self.records.push(Record::Transaction(tx));
        self
    }

    pub fn history(mut self, record: GamblingHistoryRecord) -> Self {
        self.records.push(Record::History(record));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.records.is_empty()
    }

    pub fn transactions(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.records.iter().filter_map(|r| match r {
            Record::Transaction(tx) => Some(tx),
            Record::History(_) => None,
        })
    }

    pub fn histories(&self) -> impl Iterator<Item = &GamblingHistoryRecord> {
        self.records.iter().filter_map(|r| match r {
            Record::History(h) => Some(h),
            Record::Transaction(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Matches records where the account is either side.
    pub account_id: Option<String>,
    pub related_loan_id: Option<String>,
    pub kind: Option<TransactionKind>,
}

impl TransactionFilter {
    pub fn for_account(account_id: &str) -> Self {
        Self {
            account_id: Some(account_id.to_string()),
            ..Self::default()
        }
    }

    pub fn for_loan(loan_id: &str) -> Self {
        Self {
            related_loan_id: Some(loan_id.to_string()),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, tx: &TransactionRecord) -> bool {
        if let Some(id) = &self.account_id {
            if !tx.involves(id) {
                return false;
            }
        }
        if let Some(loan) = &self.related_loan_id {
            if tx.related_loan_id.as_deref() != Some(loan.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if tx.kind != kind {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub player_id: Option<String>,
    pub guild_id: Option<String>,
    pub game_type: Option<GameType>,
}

impl HistoryFilter {
    pub fn for_player(player_id: &str) -> Self {
        Self {
            player_id: Some(player_id.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &GamblingHistoryRecord) -> bool {
        self.player_id.as_ref().map_or(true, |p| &record.player_id == p)
            && self.guild_id.as_ref().map_or(true, |g| &record.guild_id == g)
            && self.game_type.map_or(true, |t| record.game_type == t)
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Document store holding accounts and the two append-only collections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Short backend name for logs and the status endpoint.
    fn backend(&self) -> &'static str;

    async fn find_account(&self, id: &str) -> Result<Option<Account>>;

    /// Insert a new account. Returns false (and changes nothing) if the id exists.
    async fn insert_account(&self, account: Account) -> Result<bool>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Apply every update and append every record, or fail without changes.
    /// An update naming an unknown account fails the whole unit.
    async fn commit(&self, unit: UnitOfWork) -> Result<()>;

    /// Matching transactions in insertion order.
    async fn find_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>>;

    /// Matching history records in insertion order.
    async fn find_history(&self, filter: &HistoryFilter) -> Result<Vec<GamblingHistoryRecord>>;
}

/// Open the backend selected in configuration.
pub async fn open(cfg: &StorageConfig) -> Result<Arc<dyn LedgerStore>> {
    let store: Arc<dyn LedgerStore> = match cfg.backend {
        StorageBackend::Sqlite => {
            Arc::new(SqliteStore::connect(&cfg.database_url, cfg.max_connections).await?)
        }
        StorageBackend::Memory => Arc::new(MemoryStore::load_snapshot(&cfg.snapshot_path)?),
    };
    Ok(store)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GameResult, LoanStatus};
    use chrono::Utc;

    fn loan(id: &str) -> Loan {
        Loan {
            loan_id: id.to_string(),
            principal: 100.0,
            remaining_balance: 100.0,
            apr: 15.0,
            weekly_payment: 50.0,
            num_weeks: 2,
            weeks_remaining: 2,
            total_interest: 0.2,
            created_at: Utc::now(),
            last_accrual: Utc::now(),
            status: LoanStatus::Active,
        }
    }

    #[test]
    fn test_update_apply_order() {
        let mut acct = Account::new("1", "u", "U", 50.0);
        acct.total_debt = 999.0;
        acct.debts.push(loan("old"));

        AccountUpdate::new()
            .set_total_debt(100.0)
            .add_debt(25.0)
            .set_debts(Vec::new())
            .push_loan(loan("new"))
            .add_cash(-20.0)
            .add_win()
            .apply(&mut acct);

        assert_eq!(acct.total_debt, 125.0);
        assert_eq!(acct.debts.len(), 1);
        assert_eq!(acct.debts[0].loan_id, "new");
        assert_eq!(acct.cash, 30.0);
        assert_eq!(acct.wins, 1);
    }

    #[test]
    fn test_empty_update() {
        assert!(AccountUpdate::new().is_empty());
        assert!(!AccountUpdate::new().add_loss().is_empty());
        assert!(UnitOfWork::new().is_empty());
    }

    #[test]
    fn test_transaction_filter() {
        let tx = TransactionRecord::new(TransactionKind::LoanPayment, "7", "bank", 10.0, "pay")
            .with_loan("abc");
        assert!(TransactionFilter::for_account("7").matches(&tx));
        assert!(TransactionFilter::for_account("bank").matches(&tx));
        assert!(!TransactionFilter::for_account("8").matches(&tx));
        assert!(TransactionFilter::for_loan("abc").matches(&tx));
        assert!(!TransactionFilter::for_loan("abd").matches(&tx));
        assert!(!TransactionFilter::for_account("7")
            .kind(TransactionKind::Deposit)
            .matches(&tx));
    }

    #[test]
    fn test_history_filter() {
        let rec = GamblingHistoryRecord {
            id: "h1".into(),
            player_id: "7".into(),
            guild_id: "g".into(),
            game_type: GameType::Slots,
            result: GameResult::Loss,
            bet_amount: 10.0,
            payout_amount: 0.0,
            timestamp: Utc::now(),
            game_data: serde_json::Value::Null,
        };
        assert!(HistoryFilter::default().matches(&rec));
        assert!(HistoryFilter::for_player("7").matches(&rec));
        let mut f = HistoryFilter::for_player("7");
        f.game_type = Some(GameType::Racing);
        assert!(!f.matches(&rec));
    }

    #[test]
    fn test_unit_record_iterators() {
        let unit = UnitOfWork::new()
            .transaction(TransactionRecord::new(TransactionKind::Deposit, "1", "bank", 5.0, "d"))
            .update("1", AccountUpdate::new().add_bank(5.0));
        assert_eq!(unit.transactions().count(), 1);
        assert_eq!(unit.histories().count(), 0);
        assert_eq!(unit.updates.len(), 1);
    }
}
