//! Local SQLite state: the migrations ledger and the stores for everything
//! that has to survive a payment redirect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use tower_sessions_sqlx_store::SqliteStore;

use crate::models::PaymentProvider;
use crate::payment::{Claim, ClaimAttempt, ClaimOutcome, PendingTransaction, TransactionStore};
use crate::session::{SessionId, TokenPair, TokenStore};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("could not encode record: {0}")]
    Encoding(String),
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("session record error: {0}")]
    Session(#[from] tower_sessions::session::Error),
}

// ── Migrations ──

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_session_tokens",
        "CREATE TABLE IF NOT EXISTS session_tokens (
            session_id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    ),
    (
        "002_pending_transactions",
        "CREATE TABLE IF NOT EXISTS pending_transactions (
            session_id TEXT PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            draft_json TEXT NOT NULL,
            deposit_amount TEXT NOT NULL,
            remaining_amount TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_correlation
            ON pending_transactions(correlation_id)",
    ),
    (
        "003_verification_claims",
        "CREATE TABLE IF NOT EXISTS verification_claims (
            correlation_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            outcome TEXT NOT NULL DEFAULT 'in_progress',
            appointment_id INTEGER,
            detail TEXT,
            claimed_at TEXT NOT NULL DEFAULT (datetime('now')),
            settled_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_claims_session
            ON verification_claims(session_id)",
    ),
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StorageError> {
    // WAL lets the health check read while a verification writes
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    for &(name, sql) in MIGRATIONS {
        let applied: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_one(pool)
            .await?;
        if applied {
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&mut *tx).await?;
            }
        }
        sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!("Applied migration: {}", name);
    }

    // Cookie session records; the store owns its own schema.
    SqliteStore::new(pool.clone()).migrate().await?;

    Ok(())
}

fn corrupt(table: &'static str, detail: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        table,
        detail: detail.into(),
    }
}

fn parse_provider(table: &'static str, raw: &str) -> Result<PaymentProvider, StorageError> {
    PaymentProvider::from_str(raw).map_err(|e| corrupt(table, e))
}

// ── Session tokens ──

#[derive(Clone)]
pub struct SqliteTokenStore {
    pool: SqlitePool,
}

impl SqliteTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn load(&self, session: &SessionId) -> Result<Option<TokenPair>, StorageError> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT access_token, refresh_token FROM session_tokens WHERE session_id = ?",
        )
        .bind(session.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(access, refresh)| TokenPair { access, refresh }))
    }

    async fn save(&self, session: &SessionId, tokens: &TokenPair) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO session_tokens (session_id, access_token, refresh_token, updated_at)
             VALUES (?, ?, ?, datetime('now'))
             ON CONFLICT(session_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                updated_at = excluded.updated_at",
        )
        .bind(session.as_str())
        .bind(&tokens.access)
        .bind(&tokens.refresh)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, session: &SessionId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM session_tokens WHERE session_id = ?")
            .bind(session.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Pending transactions and verification claims ──

#[derive(sqlx::FromRow)]
struct PendingRow {
    session_id: String,
    correlation_id: String,
    provider: String,
    draft_json: String,
    deposit_amount: String,
    remaining_amount: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PendingRow> for PendingTransaction {
    type Error = StorageError;

    fn try_from(row: PendingRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "pending_transactions";
        let amount = |raw: &str| {
            Decimal::from_str(raw).map_err(|e| corrupt(TABLE, format!("amount {raw:?}: {e}")))
        };
        Ok(Self {
            provider: parse_provider(TABLE, &row.provider)?,
            deposit: amount(&row.deposit_amount)?,
            remaining: amount(&row.remaining_amount)?,
            session_id: SessionId::from_raw(row.session_id),
            correlation_id: row.correlation_id,
            draft_json: row.draft_json,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    correlation_id: String,
    session_id: String,
    provider: String,
    outcome: String,
    appointment_id: Option<i64>,
    detail: Option<String>,
}

impl TryFrom<ClaimRow> for Claim {
    type Error = StorageError;

    fn try_from(row: ClaimRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "verification_claims";
        Ok(Self {
            provider: parse_provider(TABLE, &row.provider)?,
            outcome: ClaimOutcome::from_str(&row.outcome).map_err(|e| corrupt(TABLE, e))?,
            correlation_id: row.correlation_id,
            session_id: SessionId::from_raw(row.session_id),
            appointment_id: row.appointment_id,
            detail: row.detail,
        })
    }
}

#[derive(Clone)]
pub struct SqliteTransactionStore {
    pool: SqlitePool,
}

impl SqliteTransactionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for SqliteTransactionStore {
    async fn put_pending(&self, tx: &PendingTransaction) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO pending_transactions
                (session_id, correlation_id, provider, draft_json,
                 deposit_amount, remaining_amount, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tx.session_id.as_str())
        .bind(&tx.correlation_id)
        .bind(tx.provider.as_str())
        .bind(&tx.draft_json)
        .bind(tx.deposit.to_string())
        .bind(tx.remaining.to_string())
        .bind(tx.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending(
        &self,
        session: &SessionId,
    ) -> Result<Option<PendingTransaction>, StorageError> {
        sqlx::query_as::<_, PendingRow>(
            "SELECT session_id, correlation_id, provider, draft_json,
                    deposit_amount, remaining_amount, created_at
             FROM pending_transactions WHERE session_id = ?",
        )
        .bind(session.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(PendingTransaction::try_from)
        .transpose()
    }

    async fn clear_pending(
        &self,
        session: &SessionId,
        correlation_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM pending_transactions WHERE session_id = ? AND correlation_id = ?")
            .bind(session.as_str())
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim(&self, correlation_id: &str) -> Result<Option<Claim>, StorageError> {
        sqlx::query_as::<_, ClaimRow>(
            "SELECT correlation_id, session_id, provider, outcome, appointment_id, detail
             FROM verification_claims WHERE correlation_id = ?",
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Claim::try_from)
        .transpose()
    }

    async fn try_claim(
        &self,
        correlation_id: &str,
        session: &SessionId,
        provider: PaymentProvider,
    ) -> Result<ClaimAttempt, StorageError> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO verification_claims (correlation_id, session_id, provider)
             VALUES (?, ?, ?)",
        )
        .bind(correlation_id)
        .bind(session.as_str())
        .bind(provider.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(ClaimAttempt::Acquired);
        }
        let existing = self
            .claim(correlation_id)
            .await?
            .ok_or_else(|| corrupt("verification_claims", format!("claim {correlation_id} vanished")))?;
        Ok(ClaimAttempt::AlreadyClaimed(existing))
    }

    async fn settle(
        &self,
        correlation_id: &str,
        outcome: ClaimOutcome,
        appointment_id: Option<i64>,
        detail: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE verification_claims
             SET outcome = ?, appointment_id = ?, detail = ?, settled_at = datetime('now')
             WHERE correlation_id = ?",
        )
        .bind(outcome.as_str())
        .bind(appointment_id)
        .bind(detail)
        .bind(correlation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
