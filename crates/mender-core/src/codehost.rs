//! Code-host client contract (§6) — log retrieval, repository cloning, and
//! review-request/issue creation. The concrete GitHub implementation lives
//! in the `mender-codehost` crate.

use crate::localizer::JobLog;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("log download failed: {0}")]
    LogDownload(String),

    #[error("clone failed: {0}")]
    Clone(String),

    #[error("review request creation failed: {0}")]
    ReviewRequest(String),

    #[error("issue creation failed: {0}")]
    Issue(String),
}

/// A patch ready to be proposed as a code-review request.
#[derive(Debug, Clone)]
pub struct ProposedChange {
    pub repo: String,
    pub base_branch: String,
    pub head_branch: String,
    pub title: String,
    pub body: String,
    pub file_path: String,
    pub original_code: String,
    pub fixed_code: String,
}

/// Context attached to an escalation ticket.
#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub repo: String,
    pub run_id: u64,
    pub branch: String,
    pub sha: String,
    pub workflow_name: String,
    pub summary: String,
    pub attempts_markdown: String,
}

/// Code-host operations consumed by the pipeline. Never interprets log
/// semantics itself — that is the Analysis Stage's job.
#[async_trait]
pub trait CodeHostClient: Send + Sync {
    /// Download a workflow run's logs as a zip archive and return one
    /// `(job name, text)` pair per top-level directory in the archive.
    async fn download_run_logs(
        &self,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<JobLog>, CodeHostError>;

    /// Resolve the shallow-clonable URL for `repo` (credentials embedded as
    /// needed by the concrete implementation).
    fn clone_url(&self, repo: &str) -> String;

    /// Open a code-review request for a verified patch, returning its URL.
    async fn create_review_request(
        &self,
        change: &ProposedChange,
    ) -> Result<String, CodeHostError>;

    /// Open a human-escalation issue, returning its URL.
    async fn create_escalation_issue(
        &self,
        ctx: &EscalationContext,
    ) -> Result<String, CodeHostError>;
}
