//! SQLite ledger store.
//!
//! Accounts are stored as one JSON document per row (loans embedded, as in
//! the in-memory model). Transactions and history are append-only tables
//! with the filterable fields lifted into indexed columns next to the full
//! JSON document. `commit` runs inside one SQL transaction, serialised by a
//! process-local mutex so the read-modify-write of account documents never
//! interleaves between tasks.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use super::{HistoryFilter, LedgerStore, Record, TransactionFilter, UnitOfWork};
use crate::types::{Account, GamblingHistoryRecord, TransactionRecord};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        id   TEXT PRIMARY KEY,
        doc  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transactions (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT NOT NULL UNIQUE,
        kind            TEXT NOT NULL,
        from_account    TEXT NOT NULL,
        to_account      TEXT NOT NULL,
        related_loan_id TEXT,
        timestamp       TEXT NOT NULL,
        doc             TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tx_from ON transactions (from_account)",
    "CREATE INDEX IF NOT EXISTS idx_tx_to ON transactions (to_account)",
    "CREATE INDEX IF NOT EXISTS idx_tx_loan ON transactions (related_loan_id)",
    "CREATE TABLE IF NOT EXISTS gambling_history (
        seq        INTEGER PRIMARY KEY AUTOINCREMENT,
        id         TEXT NOT NULL UNIQUE,
        player_id  TEXT NOT NULL,
        guild_id   TEXT NOT NULL,
        game_type  TEXT NOT NULL,
        timestamp  TEXT NOT NULL,
        doc        TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_history_player ON gambling_history (player_id)",
];

#[derive(sqlx::FromRow)]
struct DocRow {
    doc: String,
}

fn decode<T: serde::de::DeserializeOwned>(row: DocRow, what: &str) -> Result<T> {
    serde_json::from_str(&row.doc).with_context(|| format!("Malformed {what} document"))
}

pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Connect (creating the database file if needed) and ensure the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid SQLite URL: {url}"))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database lives and dies with its connection.
        let in_memory = url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            pool_options.max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database {url}"))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("Failed to create ledger schema")?;
        }

        info!(url, max_connections, "SQLite ledger store ready");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Fresh private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn load_account(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<Option<Account>> {
        let row: Option<DocRow> = sqlx::query_as("SELECT doc FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| decode(r, "account")).transpose()
    }

    async fn insert_record(tx: &mut Transaction<'_, Sqlite>, record: &Record) -> Result<()> {
        match record {
            Record::Transaction(t) => {
                sqlx::query(
                    "INSERT INTO transactions
                        (id, kind, from_account, to_account, related_loan_id, timestamp, doc)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(&t.id)
                .bind(t.kind.to_string())
                .bind(&t.from_account)
                .bind(&t.to_account)
                .bind(&t.related_loan_id)
                .bind(t.timestamp.to_rfc3339())
                .bind(serde_json::to_string(t)?)
                .execute(&mut **tx)
                .await
                .context("Failed to insert transaction record")?;
            }
            Record::History(h) => {
                sqlx::query(
                    "INSERT INTO gambling_history
                        (id, player_id, guild_id, game_type, timestamp, doc)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .bind(&h.id)
                .bind(&h.player_id)
                .bind(&h.guild_id)
                .bind(h.game_type.to_string())
                .bind(h.timestamp.to_rfc3339())
                .bind(serde_json::to_string(h)?)
                .execute(&mut **tx)
                .await
                .context("Failed to insert gambling history record")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn find_account(&self, id: &str) -> Result<Option<Account>> {
        let row: Option<DocRow> = sqlx::query_as("SELECT doc FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query account")?;
        row.map(|r| decode(r, "account")).transpose()
    }

    async fn insert_account(&self, account: Account) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("INSERT OR IGNORE INTO accounts (id, doc) VALUES (?1, ?2)")
            .bind(&account.id)
            .bind(serde_json::to_string(&account)?)
            .execute(&self.pool)
            .await
            .context("Failed to insert account")?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows: Vec<DocRow> = sqlx::query_as("SELECT doc FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list accounts")?;
        rows.into_iter().map(|r| decode(r, "account")).collect()
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Returning early drops `tx`, which rolls it back.
        for (id, update) in &unit.updates {
            let Some(mut account) = Self::load_account(&mut tx, id).await? else {
                bail!("commit references unknown account {id}");
            };
            update.apply(&mut account);
            sqlx::query("UPDATE accounts SET doc = ?2 WHERE id = ?1")
                .bind(id)
                .bind(serde_json::to_string(&account)?)
                .execute(&mut *tx)
                .await
                .context("Failed to update account")?;
        }

        for record in &unit.records {
            Self::insert_record(&mut tx, record).await?;
        }

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(())
    }

    async fn find_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>> {
        let rows: Vec<DocRow> = sqlx::query_as(
            "SELECT doc FROM transactions
             WHERE (?1 IS NULL OR from_account = ?1 OR to_account = ?1)
               AND (?2 IS NULL OR related_loan_id = ?2)
               AND (?3 IS NULL OR kind = ?3)
             ORDER BY seq",
        )
        .bind(&filter.account_id)
        .bind(&filter.related_loan_id)
        .bind(filter.kind.map(|k| k.to_string()))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query transactions")?;
        rows.into_iter().map(|r| decode(r, "transaction")).collect()
    }

    async fn find_history(&self, filter: &HistoryFilter) -> Result<Vec<GamblingHistoryRecord>> {
        let rows: Vec<DocRow> = sqlx::query_as(
            "SELECT doc FROM gambling_history
             WHERE (?1 IS NULL OR player_id = ?1)
               AND (?2 IS NULL OR guild_id = ?2)
               AND (?3 IS NULL OR game_type = ?3)
             ORDER BY seq",
        )
        .bind(&filter.player_id)
        .bind(&filter.guild_id)
        .bind(filter.game_type.map(|g| g.to_string()))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query gambling history")?;
        rows.into_iter().map(|r| decode(r, "history")).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
