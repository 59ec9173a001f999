//! SQLite implementation of [`mender_core::store::Store`].
//!
//! Grounded on the connection-pool-plus-PRAGMA setup used elsewhere in this
//! stack: a single `SqlitePool`, WAL journaling, and foreign keys enabled
//! once at connection time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mender_core::store::{NewFailure, Store, StoreError};
use mender_core::types::{
    AttemptVerdict, ErrorKind, FailureRecord, FailureStatus, FixAttempt,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// SQLite-backed [`Store`]. Cheap to clone — wraps a connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url` (e.g. `sqlite:mender.db`), enable
    /// WAL/foreign-key pragmas, and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("connecting to {database_url}: {e}")))?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Backend(format!("enabling foreign keys: {e}")))?;
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Backend(format!("setting WAL mode: {e}")))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                repo TEXT NOT NULL,
                sha TEXT NOT NULL,
                branch TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                error_kind TEXT,
                file_path TEXT,
                line_number INTEGER,
                function_name TEXT,
                error_message TEXT,
                failing_test TEXT,
                confidence REAL,
                raw_log_snippet TEXT,
                status TEXT NOT NULL,
                pr_url TEXT,
                issue_url TEXT,
                error TEXT,
                completed_at TEXT,
                UNIQUE(run_id, repo)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("creating failures table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_failures_status ON failures(status)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("creating status index: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS fix_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                failure_id INTEGER NOT NULL REFERENCES failures(id),
                attempt_number INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                original_code TEXT NOT NULL,
                fixed_code TEXT NOT NULL,
                explanation TEXT NOT NULL,
                verdict TEXT NOT NULL,
                error_output TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("creating fix_attempts table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_fix_attempts_failure_id ON fix_attempts(failure_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("creating fix_attempts index: {e}")))?;

        debug!("schema migration complete");
        Ok(())
    }
}

fn status_to_str(status: FailureStatus) -> &'static str {
    match status {
        FailureStatus::Pending => "pending",
        FailureStatus::FetchingLogs => "fetching_logs",
        FailureStatus::Analyzing => "analyzing",
        FailureStatus::Reproducing => "reproducing",
        FailureStatus::NotReproduced => "not_reproduced",
        FailureStatus::GeneratingTest => "generating_test",
        FailureStatus::Fixing => "fixing",
        FailureStatus::CreatingPr => "creating_pr",
        FailureStatus::Fixed => "fixed",
        FailureStatus::Escalated => "escalated",
        FailureStatus::Failed => "failed",
    }
}

fn status_from_str(raw: &str) -> FailureStatus {
    match raw {
        "fetching_logs" => FailureStatus::FetchingLogs,
        "analyzing" => FailureStatus::Analyzing,
        "reproducing" => FailureStatus::Reproducing,
        "not_reproduced" => FailureStatus::NotReproduced,
        "generating_test" => FailureStatus::GeneratingTest,
        "fixing" => FailureStatus::Fixing,
        "creating_pr" => FailureStatus::CreatingPr,
        "fixed" => FailureStatus::Fixed,
        "escalated" => FailureStatus::Escalated,
        "failed" => FailureStatus::Failed,
        _ => FailureStatus::Pending,
    }
}

fn verdict_to_str(verdict: AttemptVerdict) -> &'static str {
    match verdict {
        AttemptVerdict::Pass => "pass",
        AttemptVerdict::Fail => "fail",
    }
}

fn verdict_from_str(raw: &str) -> AttemptVerdict {
    match raw {
        "pass" => AttemptVerdict::Pass,
        _ => AttemptVerdict::Fail,
    }
}

fn row_to_failure(row: &sqlx::sqlite::SqliteRow) -> Result<FailureRecord, StoreError> {
    let created_at: String = row.try_get("created_at").map_err(backend_err)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(backend_err)?;
    let error_kind: Option<String> = row.try_get("error_kind").map_err(backend_err)?;
    let status: String = row.try_get("status").map_err(backend_err)?;

    Ok(FailureRecord {
        id: row.try_get("id").map_err(backend_err)?,
        run_id: row.try_get::<i64, _>("run_id").map_err(backend_err)? as u64,
        repo: row.try_get("repo").map_err(backend_err)?,
        sha: row.try_get("sha").map_err(backend_err)?,
        branch: row.try_get("branch").map_err(backend_err)?,
        workflow_name: row.try_get("workflow_name").map_err(backend_err)?,
        created_at: parse_timestamp(&created_at)?,
        error_kind: error_kind.as_deref().map(ErrorKind::coerce),
        file_path: row.try_get("file_path").map_err(backend_err)?,
        line_number: row
            .try_get::<Option<i64>, _>("line_number")
            .map_err(backend_err)?
            .map(|v| v as u32),
        function_name: row.try_get("function_name").map_err(backend_err)?,
        error_message: row.try_get("error_message").map_err(backend_err)?,
        failing_test: row.try_get("failing_test").map_err(backend_err)?,
        confidence: row.try_get("confidence").map_err(backend_err)?,
        raw_log_snippet: row.try_get("raw_log_snippet").map_err(backend_err)?,
        status: status_from_str(&status),
        pr_url: row.try_get("pr_url").map_err(backend_err)?,
        issue_url: row.try_get("issue_url").map_err(backend_err)?,
        error: row.try_get("error").map_err(backend_err)?,
        completed_at: completed_at.map(|s| parse_timestamp(&s)).transpose()?,
    })
}

fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> Result<FixAttempt, StoreError> {
    let created_at: String = row.try_get("created_at").map_err(backend_err)?;
    let verdict: String = row.try_get("verdict").map_err(backend_err)?;

    Ok(FixAttempt {
        id: row.try_get("id").map_err(backend_err)?,
        failure_id: row.try_get("failure_id").map_err(backend_err)?,
        attempt_number: row.try_get::<i64, _>("attempt_number").map_err(backend_err)? as u32,
        file_path: row.try_get("file_path").map_err(backend_err)?,
        original_code: row.try_get("original_code").map_err(backend_err)?,
        fixed_code: row.try_get("fixed_code").map_err(backend_err)?,
        explanation: row.try_get("explanation").map_err(backend_err)?,
        verdict: verdict_from_str(&verdict),
        error_output: row.try_get("error_output").map_err(backend_err)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("parsing timestamp {raw}: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_failure(&self, new: NewFailure) -> Result<FailureRecord, StoreError> {
        if let Some(existing) = sqlx::query(
            "SELECT * FROM failures WHERE run_id = ? AND repo = ?",
        )
        .bind(new.run_id as i64)
        .bind(&new.repo)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?
        {
            // A replay of the same (run_id, repo) overwrites in place and
            // resets to pending (§3/§4.11 scenario S6), clearing any stale
            // analysis/outcome columns from the prior run.
            let id: i64 = existing.try_get("id").map_err(backend_err)?;
            sqlx::query(
                "UPDATE failures SET
                    sha = ?, branch = ?, workflow_name = ?, status = ?,
                    error_kind = NULL, file_path = NULL, line_number = NULL,
                    function_name = NULL, error_message = NULL, failing_test = NULL,
                    confidence = NULL, raw_log_snippet = NULL,
                    pr_url = NULL, issue_url = NULL, error = NULL, completed_at = NULL
                 WHERE id = ?",
            )
            .bind(&new.sha)
            .bind(&new.branch)
            .bind(&new.workflow_name)
            .bind(status_to_str(FailureStatus::Pending))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

            return self.get_failure(id).await;
        }

        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO failures (run_id, repo, sha, branch, workflow_name, created_at, status)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.run_id as i64)
        .bind(&new.repo)
        .bind(&new.sha)
        .bind(&new.branch)
        .bind(&new.workflow_name)
        .bind(&now)
        .bind(status_to_str(FailureStatus::Pending))
        .execute(&self.pool)
        .await
        .map_err(backend_err)?
        .last_insert_rowid();

        self.get_failure(id).await
    }

    async fn get_failure(&self, id: i64) -> Result<FailureRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM failures WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
            .ok_or(StoreError::NotFound(id))?;
        row_to_failure(&row)
    }

    async fn transition(&self, id: i64, status: FailureStatus) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        sqlx::query("UPDATE failures SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?")
            .bind(status_to_str(status))
            .bind(completed_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn record_analysis(
        &self,
        id: i64,
        analysis: &mender_core::types::AnalysisArtifact,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE failures SET error_kind = ?, file_path = ?, line_number = ?, function_name = ?,
             error_message = ?, failing_test = ?, confidence = ?, raw_log_snippet = ? WHERE id = ?",
        )
        .bind(format!("{:?}", analysis.error_kind))
        .bind(&analysis.file_path)
        .bind(analysis.line.map(i64::from))
        .bind(&analysis.function_name)
        .bind(&analysis.error_message)
        .bind(&analysis.failing_test)
        .bind(analysis.confidence)
        .bind(&analysis.raw_excerpt)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        id: i64,
        status: FailureStatus,
        pr_url: Option<String>,
        issue_url: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE failures SET status = ?, pr_url = ?, issue_url = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status_to_str(status))
        .bind(pr_url)
        .bind(issue_url)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn append_attempt(
        &self,
        failure_id: i64,
        attempt_number: u32,
        file_path: &str,
        original_code: &str,
        fixed_code: &str,
        explanation: &str,
        verdict: AttemptVerdict,
        error_output: Option<&str>,
    ) -> Result<FixAttempt, StoreError> {
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO fix_attempts
             (failure_id, attempt_number, file_path, original_code, fixed_code, explanation, verdict, error_output, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(failure_id)
        .bind(i64::from(attempt_number))
        .bind(file_path)
        .bind(original_code)
        .bind(fixed_code)
        .bind(explanation)
        .bind(verdict_to_str(verdict))
        .bind(error_output)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?
        .last_insert_rowid();

        let row = sqlx::query("SELECT * FROM fix_attempts WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        row_to_attempt(&row)
    }

    async fn list_attempts(&self, failure_id: i64) -> Result<Vec<FixAttempt>, StoreError> {
        let rows = sqlx::query("SELECT * FROM fix_attempts WHERE failure_id = ? ORDER BY attempt_number")
            .bind(failure_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_attempt).collect()
    }

    async fn list_in_flight(&self) -> Result<Vec<FailureRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM failures WHERE status NOT IN ('fixed', 'escalated', 'failed', 'not_reproduced')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(row_to_failure).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_core::types::AnalysisArtifact;

    async fn in_memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn upsert_is_idempotent_for_the_same_run_and_repo() {
        let store = in_memory_store().await;
        let new = NewFailure {
            run_id: 1,
            repo: "acme/widgets".to_string(),
            sha: "abc".to_string(),
            branch: "main".to_string(),
            workflow_name: "ci".to_string(),
        };

        let first = store.upsert_failure(new.clone()).await.unwrap();
        let second = store.upsert_failure(new).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn upsert_on_an_existing_run_resets_status_and_clears_outcome() {
        let store = in_memory_store().await;
        let record = store
            .upsert_failure(NewFailure {
                run_id: 1,
                repo: "acme/widgets".to_string(),
                sha: "abc".to_string(),
                branch: "main".to_string(),
                workflow_name: "ci".to_string(),
            })
            .await
            .unwrap();

        store
            .record_outcome(
                record.id,
                FailureStatus::Fixed,
                Some("https://example.invalid/pr/1".to_string()),
                None,
                None,
            )
            .await
            .unwrap();

        let replayed = store
            .upsert_failure(NewFailure {
                run_id: 1,
                repo: "acme/widgets".to_string(),
                sha: "def".to_string(),
                branch: "main".to_string(),
                workflow_name: "ci".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(replayed.id, record.id);
        assert_eq!(replayed.sha, "def");
        assert_eq!(replayed.status, FailureStatus::Pending);
        assert!(replayed.pr_url.is_none());
        assert!(replayed.completed_at.is_none());
    }

    #[tokio::test]
    async fn transition_sets_completed_at_only_for_terminal_states() {
        let store = in_memory_store().await;
        let record = store
            .upsert_failure(NewFailure {
                run_id: 1,
                repo: "acme/widgets".to_string(),
                sha: "abc".to_string(),
                branch: "main".to_string(),
                workflow_name: "ci".to_string(),
            })
            .await
            .unwrap();

        store.transition(record.id, FailureStatus::Analyzing).await.unwrap();
        let reloaded = store.get_failure(record.id).await.unwrap();
        assert!(reloaded.completed_at.is_none());

        store.transition(record.id, FailureStatus::Fixed).await.unwrap();
        let reloaded = store.get_failure(record.id).await.unwrap();
        assert!(reloaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn record_analysis_populates_analysis_columns() {
        let store = in_memory_store().await;
        let record = store
            .upsert_failure(NewFailure {
                run_id: 1,
                repo: "acme/widgets".to_string(),
                sha: "abc".to_string(),
                branch: "main".to_string(),
                workflow_name: "ci".to_string(),
            })
            .await
            .unwrap();

        let analysis = AnalysisArtifact {
            error_kind: ErrorKind::TypeError,
            file_path: "src/app.py".to_string(),
            line: Some(10),
            function_name: Some("f".to_string()),
            error_message: "boom".to_string(),
            frames: vec![],
            failing_test: None,
            confidence: 0.8,
            raw_excerpt: "traceback".to_string(),
        };
        store.record_analysis(record.id, &analysis).await.unwrap();

        let reloaded = store.get_failure(record.id).await.unwrap();
        assert_eq!(reloaded.error_kind, Some(ErrorKind::TypeError));
        assert_eq!(reloaded.confidence, Some(0.8));
    }

    #[tokio::test]
    async fn append_attempt_then_list_returns_them_in_order() {
        let store = in_memory_store().await;
        let record = store
            .upsert_failure(NewFailure {
                run_id: 1,
                repo: "acme/widgets".to_string(),
                sha: "abc".to_string(),
                branch: "main".to_string(),
                workflow_name: "ci".to_string(),
            })
            .await
            .unwrap();

        store
            .append_attempt(record.id, 1, "src/app.py", "a", "b", "try a fix", AttemptVerdict::Fail, Some("still failing"))
            .await
            .unwrap();
        store
            .append_attempt(record.id, 2, "src/app.py", "b", "c", "try again", AttemptVerdict::Pass, None)
            .await
            .unwrap();

        let attempts = store.list_attempts(record.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_number, 1);
        assert_eq!(attempts[1].verdict, AttemptVerdict::Pass);
    }

    #[tokio::test]
    async fn list_in_flight_excludes_terminal_failures() {
        let store = in_memory_store().await;
        let a = store
            .upsert_failure(NewFailure {
                run_id: 1,
                repo: "acme/widgets".to_string(),
                sha: "abc".to_string(),
                branch: "main".to_string(),
                workflow_name: "ci".to_string(),
            })
            .await
            .unwrap();
        let b = store
            .upsert_failure(NewFailure {
                run_id: 2,
                repo: "acme/widgets".to_string(),
                sha: "def".to_string(),
                branch: "main".to_string(),
                workflow_name: "ci".to_string(),
            })
            .await
            .unwrap();
        store.transition(b.id, FailureStatus::Fixed).await.unwrap();

        let in_flight = store.list_in_flight().await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].id, a.id);
    }
}
