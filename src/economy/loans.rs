//! Loan engine.
//!
//! Loans amortize weekly. Origination, payment and accrual each build one
//! unit of work against the borrower's account, so the loan list, the
//! debt total, cash, credit score and the transaction record always move
//! together or not at all.
//!
//! Every write to an account's loan list happens under that account's
//! lock in the desk, since payment and accrual replace the list wholesale.
//!
//! Lifecycle per loan: `active → paid_off`. Paid-off loans are kept in the
//! account's list with their last payment figures frozen.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::config::LoanConfig;
use crate::economy::credit::{apr_modifier, clamp_score};
use crate::error::{EngineResult, Rejection};
use crate::storage::{AccountUpdate, LedgerStore, UnitOfWork};
use crate::types::{
    generate_short_id, Account, Loan, LoanStatus, TransactionKind, TransactionRecord,
    MIN_CREDIT_SCORE,
};

// ---------------------------------------------------------------------------
// Amortization
// ---------------------------------------------------------------------------

/// Level weekly payment that retires `principal` in `weeks` at `apr_percent`.
///
/// With a zero rate this is plain `principal / weeks`. `weeks` must be ≥ 1.
pub fn weekly_payment(principal: f64, apr_percent: f64, weeks: u32) -> f64 {
    let n = f64::from(weeks);
    if apr_percent == 0.0 {
        return principal / n;
    }
    let rate = apr_percent / 100.0 / 52.0;
    let growth = (1.0 + rate).powf(n);
    principal * rate * growth / (growth - 1.0)
}

/// Interest paid over the life of the loan at the level payment.
pub fn total_interest(principal: f64, weekly_payment: f64, weeks: u32) -> f64 {
    weekly_payment * f64::from(weeks) - principal
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Terms a borrower would get, without taking the loan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanQuote {
    pub principal: f64,
    pub weeks: u32,
    pub apr: f64,
    pub weekly_payment: f64,
    pub total_interest: f64,
    pub total_repayment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReceipt {
    pub loan_id: String,
    pub amount: f64,
    pub remaining_balance: f64,
    pub weeks_remaining: u32,
    pub paid_off: bool,
    pub credit_score: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccrualReport {
    pub accounts_processed: usize,
    pub loans_accrued: usize,
    pub interest_added: f64,
    pub penalty_points: i64,
    pub failures: usize,
}

// ---------------------------------------------------------------------------
// Loan desk
// ---------------------------------------------------------------------------

/// Loan origination, repayment and the weekly accrual job.
pub struct LoanDesk {
    store: Arc<dyn LedgerStore>,
    config: LoanConfig,
    bank_id: String,
    /// Per-account write locks, keyed by account id.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LoanDesk {
    pub fn new(store: Arc<dyn LedgerStore>, config: LoanConfig, bank_id: &str) -> Self {
        Self {
            store,
            config,
            bank_id: bank_id.to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LoanConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold the account's loan lock until the guard drops.
    async fn lock_account(&self, account_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .registry()
            .entry(account_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn account(&self, account_id: &str) -> EngineResult<Account> {
        self.store
            .find_account(account_id)
            .await?
            .ok_or_else(|| Rejection::AccountNotFound.into())
    }

    /// `base_apr` scaled by the account's credit modifier. Falls back to
    /// `base_apr` when the account is unknown.
    pub async fn compute_apr(&self, account_id: &str, base_apr: f64) -> EngineResult<f64> {
        Ok(match self.store.find_account(account_id).await? {
            Some(account) => base_apr * apr_modifier(account.credit_score),
            None => base_apr,
        })
    }

    /// Eligibility rules, first failure wins: account exists, score floor,
    /// debt ceiling, amount range.
    pub fn check_eligibility(&self, account: Option<&Account>, amount: f64) -> Result<(), Rejection> {
        let account = account.ok_or(Rejection::AccountNotFound)?;

        if account.credit_score < self.config.min_credit_score {
            return Err(Rejection::CreditScoreTooLow {
                minimum: self.config.min_credit_score,
            });
        }
        if account.total_debt + amount > self.config.max_total_debt {
            return Err(Rejection::DebtCeilingExceeded {
                limit: self.config.max_total_debt,
            });
        }
        if amount < self.config.min_amount || amount > self.config.max_amount {
            return Err(Rejection::LoanAmountOutOfRange {
                min: self.config.min_amount,
                max: self.config.max_amount,
            });
        }
        Ok(())
    }

    pub async fn can_take_loan(&self, account_id: &str, amount: f64) -> EngineResult<()> {
        let account = self.store.find_account(account_id).await?;
        self.check_eligibility(account.as_ref(), amount)?;
        Ok(())
    }

    fn check_term(&self, weeks: u32) -> Result<(), Rejection> {
        if weeks < self.config.min_weeks || weeks > self.config.max_weeks {
            return Err(Rejection::LoanTermOutOfRange {
                min: self.config.min_weeks,
                max: self.config.max_weeks,
            });
        }
        Ok(())
    }

    /// The terms `request_loan` would offer. No side effects.
    pub async fn quote(&self, account_id: &str, amount: f64, weeks: u32) -> EngineResult<LoanQuote> {
        self.check_term(weeks)?;
        let apr = self.compute_apr(account_id, self.config.base_apr).await?;
        let payment = weekly_payment(amount, apr, weeks);
        let interest = total_interest(amount, payment, weeks);
        Ok(LoanQuote {
            principal: amount,
            weeks,
            apr,
            weekly_payment: payment,
            total_interest: interest,
            total_repayment: amount + interest,
        })
    }

    /// Term check, eligibility, pricing, then origination.
    pub async fn request_loan(&self, account_id: &str, amount: f64, weeks: u32) -> EngineResult<Loan> {
        self.check_term(weeks)?;
        let _guard = self.lock_account(account_id).await;
        self.can_take_loan(account_id, amount).await?;
        let apr = self.compute_apr(account_id, self.config.base_apr).await?;
        self.originate(account_id, amount, apr, weeks).await
    }

    /// Originate a loan: append it, raise the debt total, credit the
    /// principal, apply the origination score delta and record the
    /// disbursement. Eligibility is the caller's concern.
    pub async fn create_loan(
        &self,
        account_id: &str,
        principal: f64,
        apr: f64,
        weeks: u32,
    ) -> EngineResult<Loan> {
        let _guard = self.lock_account(account_id).await;
        self.originate(account_id, principal, apr, weeks).await
    }

    /// `create_loan` with the account lock already held.
    async fn originate(&self, account_id: &str, principal: f64, apr: f64, weeks: u32) -> EngineResult<Loan> {
        if principal <= 0.0 {
            return Err(Rejection::NonPositiveAmount.into());
        }
        if weeks == 0 {
            return Err(Rejection::LoanTermOutOfRange {
                min: self.config.min_weeks,
                max: self.config.max_weeks,
            }
            .into());
        }
        let account = self.account(account_id).await?;

        let now = Utc::now();
        let payment = weekly_payment(principal, apr, weeks);
        let loan = Loan {
            loan_id: generate_short_id(),
            principal,
            remaining_balance: principal,
            apr,
            weekly_payment: payment,
            num_weeks: weeks,
            weeks_remaining: weeks,
            total_interest: total_interest(principal, payment, weeks),
            created_at: now,
            last_accrual: now,
            status: LoanStatus::Active,
        };

        let new_score = clamp_score(account.credit_score, self.config.origination_score_delta);
        let tx = TransactionRecord::new(
            TransactionKind::LoanDisbursement,
            &self.bank_id,
            account_id,
            principal,
            format!("Loan disbursement ({weeks} weeks @ {apr:.2}% APR)"),
        )
        .with_loan(&loan.loan_id);

        let unit = UnitOfWork::new()
            .update(
                account_id,
                AccountUpdate::new()
                    .push_loan(loan.clone())
                    .add_debt(principal)
                    .add_cash(principal)
                    .set_credit_score(new_score),
            )
            .transaction(tx);
        self.store.commit(unit).await?;

        info!(
            account_id,
            loan_id = %loan.loan_id,
            principal = format!("${principal:.2}"),
            apr = format!("{apr:.2}%"),
            weeks,
            weekly_payment = format!("${payment:.2}"),
            credit_score = new_score,
            "Loan created"
        );
        Ok(loan)
    }

    /// Apply a payment to an active loan.
    ///
    /// Checked in order: account, active loan, positive amount, cash on
    /// hand, remaining balance. A balance at or under the paid-off
    /// threshold closes the loan and earns the payoff score bonus.
    pub async fn make_payment(
        &self,
        account_id: &str,
        loan_id: &str,
        amount: f64,
    ) -> EngineResult<PaymentReceipt> {
        let _guard = self.lock_account(account_id).await;
        let account = self.account(account_id).await?;
        let index = account
            .debts
            .iter()
            .position(|l| l.loan_id == loan_id && l.is_active())
            .ok_or(Rejection::LoanNotFound)?;

        if amount <= 0.0 {
            return Err(Rejection::NonPositiveAmount.into());
        }
        if amount > account.cash {
            return Err(Rejection::InsufficientFunds { available: account.cash }.into());
        }
        let remaining = account.debts[index].remaining_balance;
        if amount > remaining {
            return Err(Rejection::PaymentExceedsBalance { remaining }.into());
        }

        let mut debts = account.debts.clone();
        let loan = &mut debts[index];
        loan.remaining_balance -= amount;
        loan.weeks_remaining = loan.weeks_remaining.saturating_sub(1);

        let paid_off = loan.remaining_balance <= self.config.paid_off_threshold;
        if paid_off {
            loan.remaining_balance = 0.0;
            loan.status = LoanStatus::PaidOff;
        }
        let receipt_balance = loan.remaining_balance;
        let receipt_weeks = loan.weeks_remaining;

        let mut update = AccountUpdate::new()
            .set_debts(debts)
            .add_cash(-amount)
            .add_debt(-amount);
        let mut credit_score = account.credit_score;
        if paid_off {
            credit_score = clamp_score(account.credit_score, self.config.payoff_score_delta);
            update = update.set_credit_score(credit_score);
        }

        let tx = TransactionRecord::new(
            TransactionKind::LoanPayment,
            account_id,
            &self.bank_id,
            amount,
            if paid_off {
                "Loan payment (paid off)".to_string()
            } else {
                "Loan payment".to_string()
            },
        )
        .with_loan(loan_id);

        self.store
            .commit(UnitOfWork::new().update(account_id, update).transaction(tx))
            .await?;

        info!(
            account_id,
            loan_id,
            amount = format!("${amount:.2}"),
            remaining = format!("${receipt_balance:.2}"),
            paid_off,
            "Loan payment applied"
        );

        Ok(PaymentReceipt {
            loan_id: loan_id.to_string(),
            amount,
            remaining_balance: receipt_balance,
            weeks_remaining: receipt_weeks,
            paid_off,
            credit_score,
        })
    }

    /// Pay one scheduled installment, capped at the remaining balance.
    pub async fn pay_installment(&self, account_id: &str, loan_id: &str) -> EngineResult<PaymentReceipt> {
        let account = self.account(account_id).await?;
        let loan = account.active_loan(loan_id).ok_or(Rejection::LoanNotFound)?;
        let amount = loan.weekly_payment.min(loan.remaining_balance);
        self.make_payment(account_id, loan_id, amount).await
    }

    /// Weekly accrual as of now.
    pub async fn weekly_accrual(&self) -> anyhow::Result<AccrualReport> {
        self.weekly_accrual_at(Utc::now()).await
    }

    /// Accrue interest on every active loan for each whole week elapsed
    /// since its last accrual, penalise the score, and recompute the debt
    /// total. Running it again before another week passes changes nothing.
    ///
    /// A failure on one account is logged and skipped; listing accounts
    /// failing aborts the run.
    pub async fn weekly_accrual_at(&self, now: DateTime<Utc>) -> anyhow::Result<AccrualReport> {
        let accounts = self.store.list_accounts().await?;
        let mut report = AccrualReport::default();

        for listed in accounts {
            if listed.active_loans().next().is_none() {
                continue;
            }
            report.accounts_processed += 1;

            // Re-read under the lock; a payment may have landed since listing.
            let _guard = self.lock_account(&listed.id).await;
            let account = match self.store.find_account(&listed.id).await {
                Ok(Some(account)) => account,
                Ok(None) => continue,
                Err(e) => {
                    error!(account_id = %listed.id, error = %e, "Loan accrual failed for account");
                    report.failures += 1;
                    continue;
                }
            };

            let (unit, stats) = self.accrue_account(&account, now);
            let Some(unit) = unit else { continue };

            match self.store.commit(unit).await {
                Ok(()) => {
                    report.loans_accrued += stats.loans_accrued;
                    report.interest_added += stats.interest_added;
                    report.penalty_points += stats.penalty_points;
                }
                Err(e) => {
                    error!(account_id = %account.id, error = %e, "Loan accrual failed for account");
                    report.failures += 1;
                }
            }
        }

        info!(
            accounts = report.accounts_processed,
            loans = report.loans_accrued,
            interest = format!("${:.2}", report.interest_added),
            penalty_points = report.penalty_points,
            failures = report.failures,
            "Weekly loan accrual complete"
        );
        Ok(report)
    }

    /// The unit of work for one account's accrual, or `None` if nothing
    /// would change.
    fn accrue_account(&self, account: &Account, now: DateTime<Utc>) -> (Option<UnitOfWork>, AccrualReport) {
        let mut stats = AccrualReport::default();
        let mut debts = account.debts.clone();
        let mut score = account.credit_score;

        for loan in debts.iter_mut().filter(|l| l.is_active()) {
            let weeks_passed = (now - loan.last_accrual).num_weeks();
            if weeks_passed < 1 {
                continue;
            }

            let interest = loan.remaining_balance * loan.weekly_rate() * weeks_passed as f64;
            loan.remaining_balance += interest;
            loan.last_accrual = now;
            stats.loans_accrued += 1;
            stats.interest_added += interest;

            if score > MIN_CREDIT_SCORE {
                let per_week = i64::from(self.config.accrual_penalty_per_week);
                let penalty = (weeks_passed * per_week).min(i64::from(self.config.max_accrual_penalty));
                let penalty = i32::try_from(penalty).unwrap_or(i32::MAX);
                let before = score;
                score = clamp_score(score, -penalty);
                stats.penalty_points += i64::from(before - score);
            }

            debug!(
                account_id = %account.id,
                loan_id = %loan.loan_id,
                weeks_passed,
                interest = format!("${interest:.2}"),
                balance = format!("${:.2}", loan.remaining_balance),
                "Loan interest accrued"
            );
        }

        let total_debt: f64 = debts
            .iter()
            .filter(|l| l.is_active())
            .map(|l| l.remaining_balance)
            .sum();

        let debt_drifted = (total_debt - account.total_debt).abs() > f64::EPSILON;
        if stats.loans_accrued == 0 && !debt_drifted {
            return (None, stats);
        }

        let mut update = AccountUpdate::new().set_debts(debts).set_total_debt(total_debt);
        if score != account.credit_score {
            update = update.set_credit_score(score);
        }
        (Some(UnitOfWork::new().update(&account.id, update)), stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
