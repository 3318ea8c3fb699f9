//! Shared types for the PARLOR ledger.
//!
//! These are the persisted entity shapes (account documents with their
//! embedded loans, transaction records, gambling history) used by every
//! engine module. They carry no I/O of their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest possible credit score.
pub const MIN_CREDIT_SCORE: i32 = 300;
/// Highest possible credit score.
pub const MAX_CREDIT_SCORE: i32 = 850;
/// Score assigned to new accounts and assumed when none is recorded.
pub const DEFAULT_CREDIT_SCORE: i32 = 500;

/// A fresh record id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// An 8-character id, used for loans, races and history entries.
pub fn generate_short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn default_credit_score() -> i32 {
    DEFAULT_CREDIT_SCORE
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// A member's economy document. Loans are embedded in origination order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    pub cash: f64,
    pub bank: f64,
    /// Sum of active loans' remaining balances.
    pub total_debt: f64,
    #[serde(default = "default_credit_score")]
    pub credit_score: i32,
    #[serde(default)]
    pub debts: Vec<Loan>,
    #[serde(default)]
    pub wins: u64,
    #[serde(default)]
    pub losses: u64,
    pub joined_at: DateTime<Utc>,
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | cash=${:.2} bank=${:.2} debt=${:.2} score={} (W{}/L{})",
            self.id, self.cash, self.bank, self.total_debt, self.credit_score, self.wins, self.losses,
        )
    }
}

impl Account {
    /// A newly registered account with the default balances.
    pub fn new(id: &str, username: &str, display_name: &str, starting_cash: f64) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            cash: starting_cash,
            bank: 0.0,
            total_debt: 0.0,
            credit_score: DEFAULT_CREDIT_SCORE,
            debts: Vec::new(),
            wins: 0,
            losses: 0,
            joined_at: Utc::now(),
        }
    }

    /// cash + bank − total debt.
    pub fn net_worth(&self) -> f64 {
        self.cash + self.bank - self.total_debt
    }

    pub fn active_loans(&self) -> impl Iterator<Item = &Loan> {
        self.debts.iter().filter(|l| l.is_active())
    }

    /// The active loan with this id, if any.
    pub fn active_loan(&self, loan_id: &str) -> Option<&Loan> {
        self.active_loans().find(|l| l.loan_id == loan_id)
    }

    /// Sum of remaining balances over active loans.
    pub fn outstanding_balance(&self) -> f64 {
        self.active_loans().map(|l| l.remaining_balance).sum()
    }
}

// ---------------------------------------------------------------------------
// Loan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    PaidOff,
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoanStatus::Active => write!(f, "active"),
            LoanStatus::PaidOff => write!(f, "paid_off"),
        }
    }
}

/// An amortized weekly loan, owned by exactly one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub loan_id: String,
    pub principal: f64,
    pub remaining_balance: f64,
    /// Percentage units (15.0 = 15% APR).
    pub apr: f64,
    pub weekly_payment: f64,
    pub num_weeks: u32,
    pub weeks_remaining: u32,
    pub total_interest: f64,
    pub created_at: DateTime<Utc>,
    pub last_accrual: DateTime<Utc>,
    pub status: LoanStatus,
}

impl fmt::Display for Loan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} balance=${:.2} weekly=${:.2} weeks_left={} apr={:.2}%",
            self.loan_id,
            self.status,
            self.remaining_balance,
            self.weekly_payment,
            self.weeks_remaining,
            self.apr,
        )
    }
}

impl Loan {
    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Active
    }

    /// Weekly rate derived from the APR.
    pub fn weekly_rate(&self) -> f64 {
        self.apr / 100.0 / 52.0
    }
}

// ---------------------------------------------------------------------------
// Transaction records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    LoanDisbursement,
    LoanPayment,
    GamblingBet,
    GamblingPayout,
    GamblingRefund,
    BankInterest,
    AdminAdjustment,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::LoanDisbursement => "loan_disbursement",
            TransactionKind::LoanPayment => "loan_payment",
            TransactionKind::GamblingBet => "gambling_bet",
            TransactionKind::GamblingPayout => "gambling_payout",
            TransactionKind::GamblingRefund => "gambling_refund",
            TransactionKind::BankInterest => "bank_interest",
            TransactionKind::AdminAdjustment => "admin_adjustment",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
}

/// Immutable, append-only money movement record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub from_account: String,
    pub to_account: String,
    pub amount: f64,
    pub description: String,
    pub related_loan_id: Option<String>,
    #[serde(default)]
    pub fees_charged: f64,
    pub status: TransactionStatus,
}

impl TransactionRecord {
    pub fn new(
        kind: TransactionKind,
        from_account: &str,
        to_account: &str,
        amount: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            timestamp: Utc::now(),
            kind,
            from_account: from_account.to_string(),
            to_account: to_account.to_string(),
            amount,
            description: description.into(),
            related_loan_id: None,
            fees_charged: 0.0,
            status: TransactionStatus::Completed,
        }
    }

    pub fn with_loan(mut self, loan_id: &str) -> Self {
        self.related_loan_id = Some(loan_id.to_string());
        self
    }

    /// Whether the account is on either side of this record.
    pub fn involves(&self, account_id: &str) -> bool {
        self.from_account == account_id || self.to_account == account_id
    }
}

// ---------------------------------------------------------------------------
// Gambling history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameType {
    Slots,
    Racing,
    Blackjack,
}

impl GameType {
    /// Games whose stake leaves the player's cash before the outcome is known.
    /// Settlement must not collect the bet a second time for these.
    pub fn stake_collected_upfront(&self) -> bool {
        matches!(self, GameType::Racing | GameType::Blackjack)
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameType::Slots => write!(f, "slots"),
            GameType::Racing => write!(f, "racing"),
            GameType::Blackjack => write!(f, "blackjack"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    Win,
    Loss,
    Push,
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameResult::Win => write!(f, "win"),
            GameResult::Loss => write!(f, "loss"),
            GameResult::Push => write!(f, "push"),
        }
    }
}

/// Immutable record of one resolved game for one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamblingHistoryRecord {
    pub id: String,
    pub player_id: String,
    pub guild_id: String,
    pub game_type: GameType,
    pub result: GameResult,
    pub bet_amount: f64,
    pub payout_amount: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub game_data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
