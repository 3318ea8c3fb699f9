//! Credit scoring.
//!
//! Scores live in `[300, 850]`. The score sets the APR modifier applied to
//! new loans and moves on loan origination, payoff and missed weeks.

use anyhow::Result;
use tracing::{debug, warn};

use crate::storage::{AccountUpdate, LedgerStore, UnitOfWork};
use crate::types::{MAX_CREDIT_SCORE, MIN_CREDIT_SCORE};

/// APR multiplier for a credit score. Better scores borrow cheaper.
pub fn apr_modifier(score: i32) -> f64 {
    match score {
        s if s >= 750 => 0.5,
        s if s >= 650 => 0.75,
        s if s >= 550 => 1.0,
        s if s >= 450 => 1.5,
        _ => 2.0,
    }
}

/// Human label for a score band.
pub fn rating(score: i32) -> &'static str {
    match score {
        s if s >= 750 => "Excellent",
        s if s >= 650 => "Good",
        s if s >= 550 => "Fair",
        s if s >= 450 => "Poor",
        _ => "Very Poor",
    }
}

/// `current + delta`, clamped into the valid range. Never overflows.
pub fn clamp_score(current: i32, delta: i32) -> i32 {
    let raw = i64::from(current) + i64::from(delta);
    raw.clamp(i64::from(MIN_CREDIT_SCORE), i64::from(MAX_CREDIT_SCORE)) as i32
}

/// Move an account's score by `delta`, clamped.
///
/// A missing account is not an error: it is logged and `None` is returned.
/// Returns the new score otherwise.
pub async fn adjust_score(store: &dyn LedgerStore, account_id: &str, delta: i32) -> Result<Option<i32>> {
    let Some(account) = store.find_account(account_id).await? else {
        warn!(account_id, delta, "Credit score adjustment skipped: account not found");
        return Ok(None);
    };

    let new_score = clamp_score(account.credit_score, delta);
    store
        .commit(UnitOfWork::new().update(account_id, AccountUpdate::new().set_credit_score(new_score)))
        .await?;

    debug!(account_id, old = account.credit_score, new = new_score, "Credit score adjusted");
    Ok(Some(new_score))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
