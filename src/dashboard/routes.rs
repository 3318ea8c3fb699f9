//! Dashboard API route handlers.
//!
//! All endpoints are read-only and return JSON. State is shared via
//! `Arc<DashboardState>`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::economy::credit;
use crate::economy::BalanceSummary;
use crate::gambling::race_track::RaceSnapshot;
use crate::gambling::settlement::{aggregate_stats, PlayerStats};
use crate::gambling::{BlackjackTables, RaceTrack};
use crate::storage::{HistoryFilter, LedgerStore, TransactionFilter};
use crate::types::{Account, Loan, TransactionRecord};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub store: Arc<dyn LedgerStore>,
    pub track: Arc<RaceTrack>,
    pub tables: Arc<BlackjackTables>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(store: Arc<dyn LedgerStore>, track: Arc<RaceTrack>, tables: Arc<BlackjackTables>) -> Self {
        Self {
            store,
            track,
            tables,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub backend: &'static str,
    pub accounts: usize,
    pub total_cash: f64,
    pub total_bank: f64,
    pub total_debt: f64,
    pub active_loans: usize,
    pub active_races: usize,
    pub active_blackjack_games: usize,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub id: String,
    pub username: String,
    pub display_name: String,
    #[serde(flatten)]
    pub balance: BalanceSummary,
    pub credit_rating: &'static str,
    pub wins: u64,
    pub losses: u64,
    pub active_loans: usize,
    pub joined_at: DateTime<Utc>,
}

impl From<&Account> for AccountResponse {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id.clone(),
            username: a.username.clone(),
            display_name: a.display_name.clone(),
            balance: BalanceSummary::from(a),
            credit_rating: credit::rating(a.credit_score),
            wins: a.wins,
            losses: a.losses,
            active_loans: a.active_loans().count(),
            joined_at: a.joined_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

type ApiResult<T> = Result<Json<T>, StatusCode>;

fn internal(e: anyhow::Error) -> StatusCode {
    error!(error = %e, "Dashboard query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn load_account(state: &DashboardState, id: &str) -> Result<Account, StatusCode> {
    state
        .store
        .find_account(id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let accounts = state.store.list_accounts().await.map_err(internal)?;
    Ok(Json(StatusResponse {
        backend: state.store.backend(),
        accounts: accounts.len(),
        total_cash: accounts.iter().map(|a| a.cash).sum(),
        total_bank: accounts.iter().map(|a| a.bank).sum(),
        total_debt: accounts.iter().map(|a| a.total_debt).sum(),
        active_loans: accounts.iter().map(|a| a.active_loans().count()).sum(),
        active_races: state.track.active_count(),
        active_blackjack_games: state.tables.active_count(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    }))
}

/// GET /api/accounts/:id
pub async fn get_account(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<AccountResponse> {
    let account = load_account(&state, &id).await?;
    Ok(Json(AccountResponse::from(&account)))
}

/// GET /api/accounts/:id/loans
pub async fn get_loans(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<Loan>> {
    let account = load_account(&state, &id).await?;
    Ok(Json(account.debts))
}

/// GET /api/accounts/:id/transactions
pub async fn get_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<TransactionRecord>> {
    load_account(&state, &id).await?;
    let mut txs = state
        .store
        .find_transactions(&TransactionFilter::for_account(&id))
        .await
        .map_err(internal)?;
    // Last 100, newest first.
    txs.reverse();
    txs.truncate(100);
    Ok(Json(txs))
}

/// GET /api/accounts/:id/gambling
pub async fn get_gambling(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<PlayerStats> {
    load_account(&state, &id).await?;
    let records = state
        .store
        .find_history(&HistoryFilter::for_player(&id))
        .await
        .map_err(internal)?;
    Ok(Json(aggregate_stats(&records)))
}

/// GET /api/races
pub async fn get_races(State(state): State<AppState>) -> Json<Vec<RaceSnapshot>> {
    Json(state.track.snapshots())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlackjackConfig, GamblingConfig, RacingConfig};
    use crate::gambling::{RngSource, Settlement};
    use crate::storage::MockLedgerStore;

    fn state_with(store: Arc<dyn LedgerStore>) -> AppState {
        let settlement = Arc::new(Settlement::new(store.clone(), GamblingConfig::default(), "bank"));
        let rng = Arc::new(RngSource::new(Some(1)));
        Arc::new(DashboardState::new(
            store,
            Arc::new(RaceTrack::new(settlement.clone(), RacingConfig::default(), rng.clone())),
            Arc::new(BlackjackTables::new(settlement, BlackjackConfig::default(), rng)),
        ))
    }

    #[test]
    fn test_account_response_serializes_flat() {
        let mut account = Account::new("a", "alice", "Alice", 250.0);
        account.bank = 50.0;
        let json = serde_json::to_value(AccountResponse::from(&account)).unwrap();
        assert_eq!(json["cash"], 250.0);
        assert_eq!(json["net_worth"], 300.0);
        assert_eq!(json["credit_score"], 500);
        assert_eq!(json["active_loans"], 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_500() {
        let mut store = MockLedgerStore::new();
        store
            .expect_find_account()
            .returning(|_| Err(anyhow::anyhow!("disk on fire")));
        let state = state_with(Arc::new(store));
        let err = get_account(State(state), Path("a".into())).await.unwrap_err();
        assert_eq!(err, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_missing_account_is_404() {
        let mut store = MockLedgerStore::new();
        store.expect_find_account().returning(|_| Ok(None));
        let state = state_with(Arc::new(store));
        let err = get_loans(State(state), Path("ghost".into())).await.unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_races_empty() {
        let state = state_with(Arc::new(MockLedgerStore::new()));
        let Json(races) = get_races(State(state)).await;
        assert!(races.is_empty());
    }
}
