//! Banking operations: registration, balances, deposits, withdrawals,
//! admin adjustments and weekly savings interest.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::EconomyConfig;
use crate::error::{EngineResult, Rejection};
use crate::storage::{AccountUpdate, LedgerStore, UnitOfWork};
use crate::types::{Account, TransactionKind, TransactionRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSummary {
    pub cash: f64,
    pub bank: f64,
    pub total_debt: f64,
    pub credit_score: i32,
    pub net_worth: f64,
}

impl From<&Account> for BalanceSummary {
    fn from(a: &Account) -> Self {
        Self {
            cash: a.cash,
            bank: a.bank,
            total_debt: a.total_debt,
            credit_score: a.credit_score,
            net_worth: a.net_worth(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterestReport {
    pub accounts_paid: usize,
    pub total_interest: f64,
    pub failures: usize,
}

pub struct Bank {
    store: Arc<dyn LedgerStore>,
    config: EconomyConfig,
}

impl Bank {
    pub fn new(store: Arc<dyn LedgerStore>, config: EconomyConfig) -> Self {
        Self { store, config }
    }

    /// Reserved counterparty id for bank-side records.
    pub fn bank_id(&self) -> &str {
        &self.config.bank_account_id
    }

    async fn account(&self, account_id: &str) -> EngineResult<Account> {
        self.store
            .find_account(account_id)
            .await?
            .ok_or_else(|| Rejection::AccountNotFound.into())
    }

    /// Create the account on first sight. Returns whether it was created.
    pub async fn register_account(
        &self,
        account_id: &str,
        username: &str,
        display_name: &str,
    ) -> anyhow::Result<bool> {
        let account = Account::new(account_id, username, display_name, self.config.starting_cash);
        let created = self.store.insert_account(account).await?;
        if created {
            info!(account_id, username, cash = self.config.starting_cash, "Account registered");
        }
        Ok(created)
    }

    pub async fn balance(&self, account_id: &str) -> EngineResult<BalanceSummary> {
        Ok(BalanceSummary::from(&self.account(account_id).await?))
    }

    fn check_transfer(&self, amount: f64, available: f64) -> Result<(), Rejection> {
        if amount < self.config.min_transfer {
            return Err(Rejection::BelowMinimum {
                minimum: self.config.min_transfer,
            });
        }
        if amount > available {
            return Err(Rejection::InsufficientFunds { available });
        }
        Ok(())
    }

    /// Move cash into the bank.
    pub async fn deposit(&self, account_id: &str, amount: f64) -> EngineResult<BalanceSummary> {
        let mut account = self.account(account_id).await?;
        self.check_transfer(amount, account.cash)?;

        let update = AccountUpdate::new().add_cash(-amount).add_bank(amount);
        let tx = TransactionRecord::new(
            TransactionKind::Deposit,
            account_id,
            self.bank_id(),
            amount,
            "Deposit to bank",
        );
        self.store
            .commit(UnitOfWork::new().update(account_id, update.clone()).transaction(tx))
            .await?;

        update.apply(&mut account);
        info!(account_id, amount = format!("${amount:.2}"), "Deposit");
        Ok(BalanceSummary::from(&account))
    }

    /// Move bank funds back to cash.
    pub async fn withdraw(&self, account_id: &str, amount: f64) -> EngineResult<BalanceSummary> {
        let mut account = self.account(account_id).await?;
        self.check_transfer(amount, account.bank)?;

        let update = AccountUpdate::new().add_bank(-amount).add_cash(amount);
        let tx = TransactionRecord::new(
            TransactionKind::Withdrawal,
            self.bank_id(),
            account_id,
            amount,
            "Withdrawal from bank",
        );
        self.store
            .commit(UnitOfWork::new().update(account_id, update.clone()).transaction(tx))
            .await?;

        update.apply(&mut account);
        info!(account_id, amount = format!("${amount:.2}"), "Withdrawal");
        Ok(BalanceSummary::from(&account))
    }

    /// Unconditional signed adjustment by an administrator.
    pub async fn admin_adjust(
        &self,
        actor_id: &str,
        target_id: &str,
        cash_delta: f64,
        bank_delta: f64,
    ) -> EngineResult<BalanceSummary> {
        let mut account = self.account(target_id).await?;

        let update = AccountUpdate::new().add_cash(cash_delta).add_bank(bank_delta);
        let tx = TransactionRecord::new(
            TransactionKind::AdminAdjustment,
            actor_id,
            target_id,
            cash_delta.abs() + bank_delta.abs(),
            format!("Admin adjustment: cash {cash_delta:+.2}, bank {bank_delta:+.2}"),
        );
        self.store
            .commit(UnitOfWork::new().update(target_id, update.clone()).transaction(tx))
            .await?;

        update.apply(&mut account);
        info!(actor_id, target_id, cash_delta, bank_delta, "Admin adjustment");
        Ok(BalanceSummary::from(&account))
    }

    /// Pay savings interest on every positive bank balance.
    pub async fn apply_weekly_interest(&self) -> anyhow::Result<InterestReport> {
        let rate = self.config.bank_interest_rate;
        let mut report = InterestReport::default();

        for account in self.store.list_accounts().await? {
            if account.bank <= 0.0 {
                continue;
            }
            let interest = account.bank * rate;
            let tx = TransactionRecord::new(
                TransactionKind::BankInterest,
                self.bank_id(),
                &account.id,
                interest,
                format!("Weekly interest ({:.2}%)", rate * 100.0),
            );
            let unit = UnitOfWork::new()
                .update(&account.id, AccountUpdate::new().add_bank(interest))
                .transaction(tx);

            match self.store.commit(unit).await {
                Ok(()) => {
                    report.accounts_paid += 1;
                    report.total_interest += interest;
                }
                Err(e) => {
                    error!(account_id = %account.id, error = %e, "Bank interest failed for account");
                    report.failures += 1;
                }
            }
        }

        info!(
            accounts = report.accounts_paid,
            total = format!("${:.2}", report.total_interest),
            failures = report.failures,
            "Weekly bank interest paid"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::storage::{MemoryStore, TransactionFilter};

    async fn bank() -> (Arc<MemoryStore>, Bank) {
        let store = Arc::new(MemoryStore::new());
        let bank = Bank::new(store.clone(), EconomyConfig::default());
        bank.register_account("1", "alice", "Alice").await.unwrap();
        (store, bank)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (_, bank) = bank().await;
        assert!(!bank.register_account("1", "alice", "Alice").await.unwrap());
        let summary = bank.balance("1").await.unwrap();
        assert_eq!(summary.cash, 1000.0);
        assert_eq!(summary.credit_score, 500);
        assert_eq!(summary.net_worth, 1000.0);
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let (store, bank) = bank().await;

        let after = bank.deposit("1", 400.0).await.unwrap();
        assert_eq!(after.cash, 600.0);
        assert_eq!(after.bank, 400.0);

        let after = bank.withdraw("1", 150.0).await.unwrap();
        assert_eq!(after.cash, 750.0);
        assert_eq!(after.bank, 250.0);

        let stored = bank.balance("1").await.unwrap();
        assert_eq!(stored, after);

        let txs = store.find_transactions(&TransactionFilter::for_account("1")).await.unwrap();
        let kinds: Vec<_> = txs.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TransactionKind::Deposit, TransactionKind::Withdrawal]);
    }

    #[tokio::test]
    async fn test_transfer_rejections() {
        let (_, bank) = bank().await;
        let err = bank.deposit("1", 1000.01).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::InsufficientFunds { available: 1000.0 }));

        let err = bank.withdraw("1", 5.0).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::InsufficientFunds { available: 0.0 }));

        let err = bank.deposit("1", 0.5).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::BelowMinimum { minimum: 1.0 }));

        let err = bank.deposit("ghost", 10.0).await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(Rejection::AccountNotFound)));
    }

    #[tokio::test]
    async fn test_admin_adjust_can_go_negative() {
        let (store, bank) = bank().await;
        let after = bank.admin_adjust("admin", "1", -1500.0, 20.0).await.unwrap();
        assert_eq!(after.cash, -500.0);
        assert_eq!(after.bank, 20.0);

        let txs = store
            .find_transactions(&TransactionFilter::for_account("1").kind(TransactionKind::AdminAdjustment))
            .await
            .unwrap();
        assert_eq!(txs[0].amount, 1520.0);
        assert_eq!(txs[0].from_account, "admin");
    }

    #[tokio::test]
    async fn test_weekly_interest_only_on_positive_balances() {
        let (store, bank) = bank().await;
        bank.register_account("2", "bob", "Bob").await.unwrap();
        bank.deposit("1", 1000.0).await.unwrap();

        let report = bank.apply_weekly_interest().await.unwrap();
        assert_eq!(report.accounts_paid, 1);
        assert!((report.total_interest - 5.0).abs() < 1e-9);

        let acct = store.find_account("1").await.unwrap().unwrap();
        assert!((acct.bank - 1005.0).abs() < 1e-9);
        let bob = store.find_account("2").await.unwrap().unwrap();
        assert_eq!(bob.bank, 0.0);
    }
}
