//! SQLite persistence for sessions, crash reports, pressure metrics,
//! and known issues.
//!
//! WAL journal mode with `synchronous=NORMAL` — the session database
//! must survive the host dying mid-write, because surviving crashes is
//! the product.

use anyhow::{Context as _, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

use crate::crash::KnownIssue;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the host indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

/// One saved session snapshot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    /// `"manual"` | `"autosave"`.
    pub kind: String,
    /// Index of the focused tab at save time; -1 when none.
    pub focused_index: i64,
    pub tab_count: i64,
    pub saved_at: String,
}

/// One tab inside a saved session, in tab-strip order.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionTabRow {
    pub session_id: String,
    pub position: i64,
    pub url: Option<String>,
    pub title: String,
    /// State at save time (`dormant` | `loading` | `loaded` |
    /// `suspended` | `crashed`) — informational; restore always starts
    /// tabs dormant.
    pub state: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CrashReportRow {
    pub id: String,
    /// SHA-256 of the crashed tab's URL; NULL when no tab was involved
    /// (e.g. a previous run that died without shutting down).
    pub url_fingerprint: Option<String>,
    pub reason: String,
    pub occurred_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KnownIssueRow {
    pub id: String,
    pub component: String,
    pub summary: String,
    pub reference: Option<String>,
}

/// A tab to persist: url, title, state-at-save.
pub type TabSnapshotRow = (Option<String>, String, String);

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries
    /// exceeding it are logged at WARN level. 0 disables the logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("tabgate.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            use sqlx::ConnectOptions as _;
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        let stmts = [
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'manual',
                focused_index INTEGER NOT NULL DEFAULT -1,
                tab_count INTEGER NOT NULL DEFAULT 0,
                saved_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS session_tabs (
                session_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                url TEXT,
                title TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'dormant',
                PRIMARY KEY (session_id, position)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sessions_kind_saved
                ON sessions (kind, saved_at DESC)",
            "CREATE TABLE IF NOT EXISTS crash_reports (
                id TEXT PRIMARY KEY,
                url_fingerprint TEXT,
                reason TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS pressure_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                total_ram_bytes INTEGER NOT NULL,
                used_ram_bytes INTEGER NOT NULL,
                loaded_tabs INTEGER NOT NULL,
                dormant_tabs INTEGER NOT NULL,
                suspended_tabs INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS known_issues (
                id TEXT PRIMARY KEY,
                component TEXT NOT NULL,
                summary TEXT NOT NULL,
                reference TEXT
            )",
        ];
        for stmt in stmts {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .context("failed to run schema migration")?;
        }
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    /// Persist one snapshot. A manual save with an existing name
    /// replaces it; autosaves accumulate (and are pruned by
    /// [`Storage::prune_autosaves`]).
    pub async fn save_session(
        &self,
        name: &str,
        kind: &str,
        focused_index: Option<usize>,
        tabs: &[TabSnapshotRow],
    ) -> Result<SessionRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        if kind == "manual" {
            let old_ids: Vec<(String,)> =
                sqlx::query_as("SELECT id FROM sessions WHERE name = ? AND kind = 'manual'")
                    .bind(name)
                    .fetch_all(&mut *tx)
                    .await?;
            for (old_id,) in old_ids {
                sqlx::query("DELETE FROM session_tabs WHERE session_id = ?")
                    .bind(&old_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM sessions WHERE id = ?")
                    .bind(&old_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            "INSERT INTO sessions (id, name, kind, focused_index, tab_count, saved_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(kind)
        .bind(focused_index.map(|i| i as i64).unwrap_or(-1))
        .bind(tabs.len() as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for (position, (url, title, state)) in tabs.iter().enumerate() {
            sqlx::query(
                "INSERT INTO session_tabs (session_id, position, url, title, state)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(position as i64)
            .bind(url.as_deref())
            .bind(title)
            .bind(state)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get_session(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Most recent snapshot with the given name.
    pub async fn get_session_named(&self, name: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM sessions WHERE name = ? ORDER BY saved_at DESC, id LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Most recent snapshot of any kind — the restore target after a
    /// restart.
    pub async fn latest_session(&self) -> Result<Option<SessionRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM sessions ORDER BY saved_at DESC, id LIMIT 1")
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM sessions ORDER BY saved_at DESC, id")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Tabs of one snapshot in strip order.
    pub async fn session_tabs(&self, session_id: &str) -> Result<Vec<SessionTabRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM session_tabs WHERE session_id = ? ORDER BY position")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_tabs WHERE session_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Keep the `keep` newest autosaves, drop the rest. Returns how
    /// many snapshots were deleted.
    pub async fn prune_autosaves(&self, keep: u32) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE kind = 'autosave' AND id NOT IN (
                 SELECT id FROM sessions WHERE kind = 'autosave'
                 ORDER BY saved_at DESC, id LIMIT ?
             )",
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "DELETE FROM session_tabs WHERE session_id NOT IN (SELECT id FROM sessions)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_sessions(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    // ─── Crash reports ──────────────────────────────────────────────────────

    pub async fn insert_crash_report(
        &self,
        url_fingerprint: Option<&str>,
        reason: &str,
    ) -> Result<CrashReportRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO crash_reports (id, url_fingerprint, reason, occurred_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(url_fingerprint)
        .bind(reason)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(CrashReportRow {
            id,
            url_fingerprint: url_fingerprint.map(str::to_string),
            reason: reason.to_string(),
            occurred_at: now,
        })
    }

    pub async fn list_crash_reports(&self) -> Result<Vec<CrashReportRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM crash_reports ORDER BY occurred_at DESC, id")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Drop crash reports older than `days`. 0 = keep forever.
    pub async fn prune_crash_reports(&self, days: u32) -> Result<u64> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let result = sqlx::query("DELETE FROM crash_reports WHERE occurred_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ─── Pressure metrics ───────────────────────────────────────────────────

    /// Write one metrics row and prune rows older than 24 hours.
    pub async fn record_pressure_metrics(
        &self,
        total_ram_bytes: i64,
        used_ram_bytes: i64,
        loaded_tabs: i64,
        dormant_tabs: i64,
        suspended_tabs: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO pressure_metrics
             (timestamp, total_ram_bytes, used_ram_bytes, loaded_tabs, dormant_tabs, suspended_tabs)
             VALUES (unixepoch(), ?, ?, ?, ?, ?)",
        )
        .bind(total_ram_bytes)
        .bind(used_ram_bytes)
        .bind(loaded_tabs)
        .bind(dormant_tabs)
        .bind(suspended_tabs)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM pressure_metrics WHERE timestamp < unixepoch() - 86400")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Known issues ───────────────────────────────────────────────────────

    pub async fn upsert_known_issue(&self, issue: &KnownIssue) -> Result<()> {
        sqlx::query(
            "INSERT INTO known_issues (id, component, summary, reference)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 component = excluded.component,
                 summary = excluded.summary,
                 reference = excluded.reference",
        )
        .bind(&issue.id)
        .bind(&issue.component)
        .bind(&issue.summary)
        .bind(issue.reference.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_known_issues(&self) -> Result<Vec<KnownIssueRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM known_issues ORDER BY component, id")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn storage(dir: &TempDir) -> Storage {
        Storage::new(dir.path()).await.expect("storage init failed")
    }

    fn tab(url: &str, state: &str) -> TabSnapshotRow {
        (Some(url.to_string()), String::new(), state.to_string())
    }

    #[tokio::test]
    async fn save_and_read_back_session() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir).await;
        let row = s
            .save_session(
                "default",
                "manual",
                Some(1),
                &[tab("https://a.org/", "loaded"), tab("https://b.org/", "dormant")],
            )
            .await
            .unwrap();
        assert_eq!(row.tab_count, 2);
        assert_eq!(row.focused_index, 1);

        let tabs = s.session_tabs(&row.id).await.unwrap();
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].url.as_deref(), Some("https://a.org/"));
        assert_eq!(tabs[1].state, "dormant");
    }

    #[tokio::test]
    async fn manual_save_replaces_same_name() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir).await;
        s.save_session("work", "manual", None, &[tab("https://a.org/", "loaded")])
            .await
            .unwrap();
        let second = s
            .save_session("work", "manual", None, &[tab("https://b.org/", "loaded")])
            .await
            .unwrap();

        assert_eq!(s.count_sessions().await.unwrap(), 1);
        let tabs = s.session_tabs(&second.id).await.unwrap();
        assert_eq!(tabs[0].url.as_deref(), Some("https://b.org/"));
    }

    #[tokio::test]
    async fn autosaves_accumulate_and_prune() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir).await;
        for i in 0..5 {
            s.save_session(
                "autosave",
                "autosave",
                None,
                &[tab(&format!("https://{i}.org/"), "dormant")],
            )
            .await
            .unwrap();
        }
        assert_eq!(s.count_sessions().await.unwrap(), 5);

        let deleted = s.prune_autosaves(2).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(s.count_sessions().await.unwrap(), 2);

        // Orphaned tab rows are swept too.
        let latest = s.latest_session().await.unwrap().unwrap();
        assert_eq!(s.session_tabs(&latest.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn crash_reports_round_trip_and_prune() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir).await;
        s.insert_crash_report(Some("abc123"), "renderer gone")
            .await
            .unwrap();
        s.insert_crash_report(None, "host died").await.unwrap();

        let reports = s.list_crash_reports().await.unwrap();
        assert_eq!(reports.len(), 2);

        // Nothing is old enough to prune.
        assert_eq!(s.prune_crash_reports(1).await.unwrap(), 0);
        assert_eq!(s.prune_crash_reports(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pressure_metrics_insert() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir).await;
        s.record_pressure_metrics(16_000_000_000, 8_000_000_000, 3, 5, 2)
            .await
            .unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pressure_metrics")
            .fetch_one(&s.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }
}
