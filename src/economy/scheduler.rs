//! Weekly economy jobs.
//!
//! Jobs run every Monday at 00:00 UTC: savings interest first, then loan
//! accrual. A failing job is logged and left for the next run. There are
//! no retries.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use super::banking::{Bank, InterestReport};
use super::loans::{AccrualReport, LoanDesk};

/// The next Monday 00:00 UTC strictly after `now`.
pub fn next_weekly_run(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let since_monday = i64::from(today.weekday().num_days_from_monday());
    let this_monday = today - Duration::days(since_monday);
    (this_monday + Duration::days(7)).and_time(NaiveTime::MIN).and_utc()
}

/// Time left until the next run, never negative.
pub fn until_next_run(now: DateTime<Utc>) -> std::time::Duration {
    (next_weekly_run(now) - now).to_std().unwrap_or_default()
}

#[derive(Debug, Default, Serialize)]
pub struct WeeklyJobReport {
    pub interest: Option<InterestReport>,
    pub accrual: Option<AccrualReport>,
}

/// Run both weekly jobs. One failing does not stop the other.
pub async fn run_weekly_jobs(bank: &Bank, loans: &LoanDesk) -> WeeklyJobReport {
    info!("Running weekly economy jobs");
    let mut report = WeeklyJobReport::default();

    match bank.apply_weekly_interest().await {
        Ok(r) => report.interest = Some(r),
        Err(e) => error!(error = %e, "Bank interest job failed, skipping until next run"),
    }

    match loans.weekly_accrual().await {
        Ok(r) => report.accrual = Some(r),
        Err(e) => error!(error = %e, "Loan accrual job failed, skipping until next run"),
    }

    report
}
