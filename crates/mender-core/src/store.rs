//! Durable Store (C11) contract — the pipeline depends on this trait, not
//! on any particular database. The SQLite-backed implementation lives in
//! the `mender-store` crate.

use crate::types::{AnalysisArtifact, AttemptVerdict, FailureRecord, FailureStatus, FixAttempt};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failure record {0} not found")]
    NotFound(i64),
}

/// Fields needed to create (or idempotently resume) tracking a failure,
/// keyed by `(run_id, repo)` per §3.
#[derive(Debug, Clone)]
pub struct NewFailure {
    pub run_id: u64,
    pub repo: String,
    pub sha: String,
    pub branch: String,
    pub workflow_name: String,
}

/// Persistence operations the orchestrator and janitor depend on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new failure row, or return the existing one for the same
    /// `(run_id, repo)` unchanged — ingestion is idempotent (§4.1).
    async fn upsert_failure(&self, new: NewFailure) -> Result<FailureRecord, StoreError>;

    /// Load a failure record by id.
    async fn get_failure(&self, id: i64) -> Result<FailureRecord, StoreError>;

    /// Transition a failure's status, recording `completed_at` when the new
    /// status is terminal.
    async fn transition(&self, id: i64, status: FailureStatus) -> Result<(), StoreError>;

    /// Apply an analysis artifact's fields onto the failure row.
    async fn record_analysis(
        &self,
        id: i64,
        analysis: &AnalysisArtifact,
    ) -> Result<(), StoreError>;

    /// Record the terminal outcome: a review-request URL, an escalation
    /// issue URL, or a free-text error, and transition to the matching
    /// terminal status in the same write.
    async fn record_outcome(
        &self,
        id: i64,
        status: FailureStatus,
        pr_url: Option<String>,
        issue_url: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Append one fix attempt row — attempts are never mutated or deleted
    /// once written, per §4.9/§6.
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
    ) -> Result<FixAttempt, StoreError>;

    /// List all attempts for a failure, ordered by `attempt_number`.
    async fn list_attempts(&self, failure_id: i64) -> Result<Vec<FixAttempt>, StoreError>;

    /// List non-terminal failures — used on startup to resume or cancel
    /// in-flight pipelines after a restart (§9 decision on re-ingestion).
    async fn list_in_flight(&self) -> Result<Vec<FailureRecord>, StoreError>;
}
