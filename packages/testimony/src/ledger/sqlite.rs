//! SQLite ledger implementation.
//!
//! The durable coordination point of the crawl stage. Runs in WAL mode with
//! `synchronous = FULL`, so every transition has reached disk when the call
//! returns. Writes run inside `BEGIN IMMEDIATE` transactions: the write lock
//! is taken up front, so concurrent claimers queue on the busy timeout
//! instead of racing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::FromRow;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{deadline, merge_entries, rewrite_groups};
use crate::error::{LedgerError, LedgerResult};
use crate::traits::ledger::{Canonicalizer, DenyRule, Ledger, RequeueSelector};
use crate::types::{
    config::RetryPolicy,
    entry::{
        Claim, EnqueueOutcome, EntryStatus, FailureKind, LeaseToken, LedgerEntry, NewEntry,
        StatusCounts,
    },
};

const ENTRY_COLUMNS: &str = "id, source_name, depth, priority, status, attempts, last_error, \
     content_hash, discovered_at, available_at, lease_expires_at";

const CLAIM_ORDER: &str = "priority DESC, discovered_at ASC, rowid ASC";

fn storage(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(Box::new(e))
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> LedgerResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::Storage(format!("timestamp out of range: {ms}").into()))
}

/// SQLite-backed ledger.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open a ledger with the given connection URL.
    ///
    /// # Example URLs
    /// - `sqlite://./data/ledger.db` - File-based database
    /// - `sqlite::memory:` - In-memory database (use [`SqliteLedger::in_memory`])
    pub async fn new(database_url: &str) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(storage)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(storage)?;

        Self::from_pool(pool).await
    }

    /// Open (or create) a ledger file.
    pub async fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(storage)?;

        Self::from_pool(pool).await
    }

    /// Create an in-memory ledger (for testing).
    ///
    /// A single connection that is never recycled, since every connection
    /// to `:memory:` is a separate database.
    pub async fn in_memory() -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(storage)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage)?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> LedgerResult<Self> {
        let ledger = Self { pool };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> LedgerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger (
                id TEXT PRIMARY KEY,
                source_name TEXT NOT NULL,
                depth INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                content_hash TEXT,
                discovered_at INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                lease_token TEXT,
                lease_expires_at INTEGER,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger(status, available_at);
            CREATE INDEX IF NOT EXISTS idx_ledger_priority ON ledger(priority DESC, discovered_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    /// Take a connection and open a write transaction on it.
    async fn begin_immediate(&self) -> LedgerResult<PoolConnection<Sqlite>> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        Ok(conn)
    }

    /// Commit on success, roll back on failure, and pass the result through.
    async fn finish<T>(
        mut conn: PoolConnection<Sqlite>,
        result: LedgerResult<T>,
    ) -> LedgerResult<T> {
        match result {
            Ok(value) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(storage)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!(error = %rollback, "Ledger rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Explain why a guarded update touched no row.
    async fn guard_failure(conn: &mut SqliteConnection, id: &str) -> LedgerError {
        let status: Result<Option<(String,)>, _> =
            sqlx::query_as("SELECT status FROM ledger WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await;

        match status {
            Ok(None) => LedgerError::NotFound { id: id.to_string() },
            Ok(Some((status,))) if status == EntryStatus::InProgress.as_str() => {
                LedgerError::Conflict {
                    id: id.to_string(),
                    reason: "lease was re-claimed".to_string(),
                }
            }
            Ok(Some((status,))) => LedgerError::Conflict {
                id: id.to_string(),
                reason: format!("entry is {status}"),
            },
            Err(e) => storage(e),
        }
    }

    async fn claim_in(
        conn: &mut SqliteConnection,
        n: usize,
        lease: Duration,
    ) -> LedgerResult<Vec<Claim>> {
        let now = Utc::now();
        let token = LeaseToken::generate();

        let sql = format!(
            r#"
            UPDATE ledger
            SET status = 'in_progress',
                lease_token = ?1,
                lease_expires_at = ?2,
                updated_at = ?3
            WHERE id IN (
                SELECT id FROM ledger
                WHERE (status = 'pending' AND available_at <= ?3)
                   OR (status = 'in_progress' AND lease_expires_at <= ?3)
                ORDER BY {CLAIM_ORDER}
                LIMIT ?4
            )
            RETURNING {ENTRY_COLUMNS}
            "#
        );

        let rows: Vec<EntryRow> = sqlx::query_as(&sql)
            .bind(token.as_str())
            .bind(millis(deadline(now, lease)))
            .bind(millis(now))
            .bind(n as i64)
            .fetch_all(&mut *conn)
            .await
            .map_err(storage)?;

        let mut entries = rows
            .into_iter()
            .map(EntryRow::into_entry)
            .collect::<LedgerResult<Vec<_>>>()?;

        // RETURNING does not preserve the subquery's order
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.discovered_at.cmp(&b.discovered_at))
        });

        Ok(entries
            .into_iter()
            .map(|entry| Claim {
                entry,
                lease: token.clone(),
            })
            .collect())
    }

    async fn fail_in(
        conn: &mut SqliteConnection,
        id: &str,
        lease: &LeaseToken,
        error: &str,
        kind: FailureKind,
        retry: &RetryPolicy,
    ) -> LedgerResult<EntryStatus> {
        let owned: Option<(i64,)> = sqlx::query_as(
            "SELECT attempts FROM ledger WHERE id = ? AND status = 'in_progress' AND lease_token = ?",
        )
        .bind(id)
        .bind(lease.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;

        let Some((attempts,)) = owned else {
            return Err(Self::guard_failure(conn, id).await);
        };

        let now = Utc::now();
        let attempts = attempts as u32 + 1;
        let (status, available_at) =
            if kind == FailureKind::Permanent || retry.exhausted(attempts) {
                (EntryStatus::Failed, now)
            } else {
                (EntryStatus::Pending, deadline(now, retry.delay_for(attempts)))
            };

        sqlx::query(
            r#"
            UPDATE ledger
            SET status = ?, attempts = ?, last_error = ?, available_at = ?,
                lease_token = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND lease_token = ?
            "#,
        )
        .bind(status.as_str())
        .bind(attempts as i64)
        .bind(error)
        .bind(millis(available_at))
        .bind(millis(now))
        .bind(id)
        .bind(lease.as_str())
        .execute(&mut *conn)
        .await
        .map_err(storage)?;

        Ok(status)
    }

    async fn requeue_in(
        conn: &mut SqliteConnection,
        selector: RequeueSelector,
    ) -> LedgerResult<u64> {
        let now = millis(Utc::now());
        let sql = r#"
            UPDATE ledger
            SET status = 'pending', attempts = 0, available_at = ?, updated_at = ?
            WHERE status = 'failed'
        "#;

        match selector {
            RequeueSelector::All => Ok(sqlx::query(sql)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await
                .map_err(storage)?
                .rows_affected()),
            RequeueSelector::Ids(ids) => {
                let by_id = format!("{sql} AND id = ?");
                let mut total = 0;
                for id in ids {
                    total += sqlx::query(&by_id)
                        .bind(now)
                        .bind(now)
                        .bind(&id)
                        .execute(&mut *conn)
                        .await
                        .map_err(storage)?
                        .rows_affected();
                }
                Ok(total)
            }
        }
    }

    async fn all_entries(conn: &mut SqliteConnection) -> LedgerResult<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> =
            sqlx::query_as(&format!("SELECT {ENTRY_COLUMNS} FROM ledger ORDER BY rowid"))
                .fetch_all(&mut *conn)
                .await
                .map_err(storage)?;
        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    async fn normalize_in(
        conn: &mut SqliteConnection,
        canonicalize: Canonicalizer<'_>,
    ) -> LedgerResult<u64> {
        let entries = Self::all_entries(conn).await?;
        let now = millis(Utc::now());
        let mut merged = 0;

        for (canonical, group) in rewrite_groups(entries, canonicalize) {
            let Some(entry) = merge_entries(canonical.clone(), &group) else {
                continue;
            };
            for old in &group {
                sqlx::query("DELETE FROM ledger WHERE id = ?")
                    .bind(&old.id)
                    .execute(&mut *conn)
                    .await
                    .map_err(storage)?;
                if old.id != canonical {
                    merged += 1;
                }
            }

            sqlx::query(
                r#"
                INSERT INTO ledger (id, source_name, depth, priority, status, attempts,
                                    last_error, content_hash, discovered_at, available_at,
                                    updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.source_name)
            .bind(entry.depth as i64)
            .bind(entry.priority)
            .bind(entry.status.as_str())
            .bind(entry.attempts as i64)
            .bind(&entry.last_error)
            .bind(&entry.content_hash)
            .bind(millis(entry.discovered_at))
            .bind(millis(entry.available_at))
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        }
        Ok(merged)
    }

    async fn deny_in(
        conn: &mut SqliteConnection,
        deny: DenyRule<'_>,
        reason: &str,
    ) -> LedgerResult<u64> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger WHERE status IN ('pending', 'done')"
        ))
        .fetch_all(&mut *conn)
        .await
        .map_err(storage)?;

        let now = millis(Utc::now());
        let mut count = 0;
        for row in rows {
            let entry = row.into_entry()?;
            if !deny(&entry) {
                continue;
            }
            count += sqlx::query(
                "UPDATE ledger SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
            )
            .bind(reason)
            .bind(now)
            .bind(&entry.id)
            .execute(&mut *conn)
            .await
            .map_err(storage)?
            .rows_affected();
        }
        Ok(count)
    }
}

// Row types for sqlx queries
#[derive(Debug, FromRow)]
struct EntryRow {
    id: String,
    source_name: String,
    depth: i64,
    priority: i64,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    content_hash: Option<String>,
    discovered_at: i64,
    available_at: i64,
    lease_expires_at: Option<i64>,
}

impl EntryRow {
    fn into_entry(self) -> LedgerResult<LedgerEntry> {
        Ok(LedgerEntry {
            status: self
                .status
                .parse()
                .map_err(|e: String| LedgerError::Storage(e.into()))?,
            id: self.id,
            source_name: self.source_name,
            depth: self.depth as u32,
            priority: self.priority,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            content_hash: self.content_hash,
            discovered_at: from_millis(self.discovered_at)?,
            available_at: from_millis(self.available_at)?,
            lease_expires_at: self.lease_expires_at.map(from_millis).transpose()?,
        })
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn enqueue(&self, new: NewEntry) -> LedgerResult<EnqueueOutcome> {
        let now = millis(Utc::now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger (id, source_name, depth, priority, status, attempts,
                                discovered_at, available_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&new.id)
        .bind(&new.source_name)
        .bind(new.depth as i64)
        .bind(new.priority)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?
        .rows_affected();

        if inserted == 1 {
            return Ok(EnqueueOutcome::Inserted);
        }

        sqlx::query(
            r#"
            UPDATE ledger SET priority = ?, source_name = ?, updated_at = ?
            WHERE id = ? AND status = 'pending' AND priority < ?
            "#,
        )
        .bind(new.priority)
        .bind(&new.source_name)
        .bind(now)
        .bind(&new.id)
        .bind(new.priority)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(EnqueueOutcome::AlreadyPresent)
    }

    async fn claim_batch(&self, n: usize, lease: Duration) -> LedgerResult<Vec<Claim>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.begin_immediate().await?;
        let result = Self::claim_in(&mut conn, n, lease).await;
        Self::finish(conn, result).await
    }

    async fn extend_lease(
        &self,
        id: &str,
        lease: &LeaseToken,
        duration: Duration,
    ) -> LedgerResult<()> {
        let mut conn = self.begin_immediate().await?;
        let now = Utc::now();

        let result = match sqlx::query(
            r#"
            UPDATE ledger SET lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND status = 'in_progress' AND lease_token = ?
            "#,
        )
        .bind(millis(deadline(now, duration)))
        .bind(millis(now))
        .bind(id)
        .bind(lease.as_str())
        .execute(&mut *conn)
        .await
        {
            Ok(done) if done.rows_affected() == 1 => Ok(()),
            Ok(_) => Err(Self::guard_failure(&mut conn, id).await),
            Err(e) => Err(storage(e)),
        };

        Self::finish(conn, result).await
    }

    async fn complete(
        &self,
        id: &str,
        lease: &LeaseToken,
        content_hash: &str,
    ) -> LedgerResult<()> {
        let mut conn = self.begin_immediate().await?;

        let result = match sqlx::query(
            r#"
            UPDATE ledger
            SET status = 'done', content_hash = ?, last_error = NULL,
                lease_token = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'in_progress' AND lease_token = ?
            "#,
        )
        .bind(content_hash)
        .bind(millis(Utc::now()))
        .bind(id)
        .bind(lease.as_str())
        .execute(&mut *conn)
        .await
        {
            Ok(done) if done.rows_affected() == 1 => Ok(()),
            Ok(_) => Err(Self::guard_failure(&mut conn, id).await),
            Err(e) => Err(storage(e)),
        };

        Self::finish(conn, result).await
    }

    async fn fail(
        &self,
        id: &str,
        lease: &LeaseToken,
        error: &str,
        kind: FailureKind,
        retry: &RetryPolicy,
    ) -> LedgerResult<EntryStatus> {
        let mut conn = self.begin_immediate().await?;
        let result = Self::fail_in(&mut conn, id, lease, error, kind, retry).await;
        Self::finish(conn, result).await
    }

    async fn get(&self, id: &str) -> LedgerResult<Option<LedgerEntry>> {
        let row: Option<EntryRow> =
            sqlx::query_as(&format!("SELECT {ENTRY_COLUMNS} FROM ledger WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;

        row.map(EntryRow::into_entry).transpose()
    }

    async fn counts(&self) -> LedgerResult<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM ledger GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let status: EntryStatus = status
                .parse()
                .map_err(|e: String| LedgerError::Storage(e.into()))?;
            match status {
                EntryStatus::Pending => counts.pending = count as u64,
                EntryStatus::InProgress => counts.in_progress = count as u64,
                EntryStatus::Done => counts.done = count as u64,
                EntryStatus::Failed => counts.failed = count as u64,
            }
        }
        Ok(counts)
    }

    async fn list(&self, status: EntryStatus, limit: usize) -> LedgerResult<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger WHERE status = ? ORDER BY {CLAIM_ORDER} LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    async fn requeue_failed(&self, selector: RequeueSelector) -> LedgerResult<u64> {
        let mut conn = self.begin_immediate().await?;
        let result = Self::requeue_in(&mut conn, selector).await;
        Self::finish(conn, result).await
    }

    async fn normalize_ids(&self, canonicalize: Canonicalizer<'_>) -> LedgerResult<u64> {
        let mut conn = self.begin_immediate().await?;
        let result = Self::normalize_in(&mut conn, canonicalize).await;
        Self::finish(conn, result).await
    }

    async fn apply_deny_filter(&self, deny: DenyRule<'_>, reason: &str) -> LedgerResult<u64> {
        let mut conn = self.begin_immediate().await?;
        let result = Self::deny_in(&mut conn, deny, reason).await;
        Self::finish(conn, result).await
    }
}
