//! In-memory ledger store.
//!
//! Whole state sits behind one `RwLock`; `commit` validates and applies a
//! unit under a single write guard. The state can be saved to and loaded
//! from a JSON snapshot file, which is how the memory backend persists
//! across restarts.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{HistoryFilter, LedgerStore, Record, TransactionFilter, UnitOfWork};
use crate::types::{Account, GamblingHistoryRecord, TransactionRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub accounts: BTreeMap<String, Account>,
    pub transactions: Vec<TransactionRecord>,
    pub history: Vec<GamblingHistoryRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<LedgerSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    /// A clone of the current state.
    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.state.read().await.clone()
    }

    /// Write the current state to a JSON file.
    pub async fn save_snapshot(&self, path: &str) -> Result<()> {
        let state = self.state.read().await;
        let json = serde_json::to_string_pretty(&*state)
            .context("Failed to serialise ledger snapshot")?;

        // Write then rename, so a crash mid-write leaves the previous file.
        let tmp = format!("{path}.tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("Failed to write snapshot to {tmp}"))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace snapshot at {path}"))?;

        debug!(path, accounts = state.accounts.len(), "Snapshot saved");
        Ok(())
    }

    /// Load a store from a JSON snapshot, or start empty if the file
    /// doesn't exist.
    pub fn load_snapshot(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            info!(path, "No saved snapshot found, starting fresh");
            return Ok(Self::new());
        }

        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot from {path}"))?;

        let snapshot: LedgerSnapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse snapshot from {path}"))?;

        info!(
            path,
            accounts = snapshot.accounts.len(),
            transactions = snapshot.transactions.len(),
            history = snapshot.history.len(),
            "Snapshot loaded from disk"
        );

        Ok(Self::from_snapshot(snapshot))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn find_account(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.state.read().await.accounts.get(id).cloned())
    }

    async fn insert_account(&self, account: Account) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&account.id) {
            return Ok(false);
        }
        state.accounts.insert(account.id.clone(), account);
        Ok(true)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.state.read().await.accounts.values().cloned().collect())
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<()> {
        let mut state = self.state.write().await;

        // Nothing is applied until every target is known to exist.
        for (id, _) in &unit.updates {
            if !state.accounts.contains_key(id) {
                bail!("commit references unknown account {id}");
            }
        }

        for (id, update) in &unit.updates {
            if let Some(account) = state.accounts.get_mut(id) {
                update.apply(account);
            }
        }

        for record in unit.records {
            match record {
                Record::Transaction(tx) => state.transactions.push(tx),
                Record::History(h) => state.history.push(h),
            }
        }

        Ok(())
    }

    async fn find_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|tx| filter.matches(tx))
            .cloned()
            .collect())
    }

    async fn find_history(&self, filter: &HistoryFilter) -> Result<Vec<GamblingHistoryRecord>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|h| filter.matches(h))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
