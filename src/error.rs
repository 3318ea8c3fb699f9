//! Error taxonomy for the ledger engine.
//!
//! `Rejection` covers everything a player can cause (bad amounts, missing
//! accounts, illegal game actions). Its `Display` text is shown to the
//! player verbatim. Store failures are not rejections; they travel as
//! `EngineError::Store` and abort the operation before anything commits.

use thiserror::Error;

/// A validation failure or missing entity. Never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("Account not found")]
    AccountNotFound,

    #[error("Loan not found or already paid off")]
    LoanNotFound,

    #[error("Credit score too low (minimum {minimum})")]
    CreditScoreTooLow { minimum: i32 },

    #[error("Would exceed maximum debt limit of ${limit:.0}")]
    DebtCeilingExceeded { limit: f64 },

    #[error("Loan amount must be between ${min:.0} and ${max:.0}")]
    LoanAmountOutOfRange { min: f64, max: f64 },

    #[error("Loan term must be between {min} and {max} weeks")]
    LoanTermOutOfRange { min: u32, max: u32 },

    #[error("Amount must be positive")]
    NonPositiveAmount,

    #[error("Minimum amount is ${minimum:.2}")]
    BelowMinimum { minimum: f64 },

    #[error("Insufficient funds (available: ${available:.2})")]
    InsufficientFunds { available: f64 },

    #[error("Payment exceeds remaining balance of ${remaining:.2}")]
    PaymentExceedsBalance { remaining: f64 },

    #[error("Bet must be between ${min:.0} and ${max:.0}")]
    BetOutOfRange { min: f64, max: f64 },

    #[error("A race is already running in this server")]
    RaceAlreadyActive,

    #[error("No active race in this server")]
    RaceNotFound,

    #[error("Betting is closed for this race")]
    BettingClosed,

    #[error("You already placed a ${amount:.0} bet on this race")]
    DuplicateBet { amount: f64 },

    #[error("A {bet_type} bet needs exactly {expected} horse(s)")]
    WrongHorseCount { bet_type: String, expected: usize },

    #[error("Horse #{0} is not in this race")]
    UnknownHorse(u8),

    #[error("The same horse cannot be picked twice")]
    DuplicateHorse,

    #[error("No blackjack game in progress")]
    GameNotFound,

    #[error("You already have a blackjack game in progress")]
    GameAlreadyActive,

    #[error("Cannot {action}: {reason}")]
    IllegalMove { action: String, reason: String },
}

impl Rejection {
    pub fn illegal(action: &str, reason: &str) -> Self {
        Rejection::IllegalMove {
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Error type returned by every engine operation that touches the store.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("ledger store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// The rejection, if this is one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            EngineError::Rejected(r) => Some(r),
            EngineError::Store(_) => None,
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.rejection().is_some()
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
