//! Pipeline Orchestrator (C10) — drives one ingested failure through the
//! state machine in §4.10: fetch logs, analyze, gate on confidence,
//! reproduce, synthesize a regression test, run the bounded fix loop, and
//! land either a review request or an escalation issue.

use crate::analysis::{analyze, AnalysisError};
use crate::codehost::{CodeHostClient, CodeHostError, EscalationContext, ProposedChange};
use crate::fix_loop::{run_fix_loop, FixLoopError, FixLoopVerdict, MAX_ATTEMPTS};
use crate::llm::LlmClient;
use crate::localizer::localize;
use crate::types::PatchArtifact;
use crate::reproduction::{reproduce, ReproductionError, CLONE_DEPTH};
use crate::sandbox::SandboxDriver;
use crate::store::{Store, StoreError};
use crate::test_synth::{synthesize_test, TestSynthError};
use crate::truncator::{truncate, DEFAULT_BUDGET};
use crate::types::FailureStatus;
use notify::{NotifyEvent, Notifier};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    CodeHost(#[from] CodeHostError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Reproduction(#[from] ReproductionError),

    #[error(transparent)]
    TestSynth(#[from] TestSynthError),

    #[error(transparent)]
    FixLoop(#[from] FixLoopError),

    #[error("failed to clone {repo} at {sha}: {reason}")]
    Clone {
        repo: String,
        sha: String,
        reason: String,
    },

    #[error("no job logs available for run")]
    NoLogs,

    #[error("pipeline cancelled by re-ingestion")]
    Cancelled,
}

/// Terminal shape of a single pipeline run, distinguishing the three ways a
/// run can end without erroring (§7): a landed fix, an escalation to a
/// human, or a failure that simply didn't reproduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Fixed { pr_url: String },
    Escalated { reason: String, issue_url: String },
    NotReproduced,
}

/// Trait object bundle the orchestrator needs for a single run. Bundled as
/// `Arc`s so one [`PipelineContext`] can be cloned cheaply per ingested
/// event and moved into its own `tokio` task.
#[derive(Clone)]
pub struct PipelineContext {
    pub llm: Arc<dyn LlmClient>,
    pub sandbox: Arc<dyn SandboxDriver>,
    pub codehost: Arc<dyn CodeHostClient>,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<Notifier>,
    pub sandbox_image: String,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Shallow-clone `repo` at `sha` into `workspace_dir` using the system `git`
/// binary. Resolved Open Question decision (§9): re-ingestion cancels and
/// restarts, so a stale clone in `workspace_dir` is never reused — each run
/// gets a fresh checkout.
fn clone_commit(
    codehost: &dyn CodeHostClient,
    repo: &str,
    sha: &str,
    workspace_dir: &Path,
) -> Result<(), PipelineError> {
    let url = codehost.clone_url(repo);
    let run = |args: &[&str]| -> Result<(), PipelineError> {
        let status = Command::new("git")
            .args(args)
            .status()
            .map_err(|e| PipelineError::Clone {
                repo: repo.to_string(),
                sha: sha.to_string(),
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::Clone {
                repo: repo.to_string(),
                sha: sha.to_string(),
                reason: format!("git exited with {status}"),
            })
        }
    };

    std::fs::create_dir_all(workspace_dir).map_err(|e| PipelineError::Clone {
        repo: repo.to_string(),
        sha: sha.to_string(),
        reason: e.to_string(),
    })?;

    let workspace_str = workspace_dir.to_string_lossy().into_owned();
    run(&[
        "clone",
        "--depth",
        &CLONE_DEPTH.to_string(),
        "--no-checkout",
        &url,
        &workspace_str,
    ])?;
    run(&["-C", &workspace_str, "fetch", "--depth", &CLONE_DEPTH.to_string(), "origin", sha])?;
    run(&["-C", &workspace_str, "checkout", sha])?;
    Ok(())
}

/// Run the full pipeline for failure `failure_id`, cloning into
/// `workspace_dir`. Returns once the failure has reached a terminal state.
pub async fn run_pipeline(
    ctx: &PipelineContext,
    failure_id: i64,
    workspace_dir: &Path,
    cancel: CancellationToken,
) -> Result<PipelineOutcome, PipelineError> {
    let result = run_pipeline_inner(ctx, failure_id, workspace_dir, &cancel).await;

    if let Err(ref e) = result {
        if !matches!(e, PipelineError::Cancelled) {
            if let Err(store_err) = ctx
                .store
                .record_outcome(failure_id, FailureStatus::Failed, None, None, Some(e.to_string()))
                .await
            {
                warn!(failure_id, error = %store_err, "failed to record terminal failure status");
            }
        }
    }

    result
}

async fn run_pipeline_inner(
    ctx: &PipelineContext,
    failure_id: i64,
    workspace_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome, PipelineError> {
    async {
        let failure = ctx.store.get_failure(failure_id).await?;
        check_cancelled(cancel)?;

        ctx.notifier.notify(NotifyEvent::PipelineStarted {
            failure_id,
            repo: failure.repo.clone(),
            sha: failure.sha.clone(),
            workflow_name: failure.workflow_name.clone(),
            timestamp: chrono::Utc::now(),
        });

        ctx.store
            .transition(failure_id, FailureStatus::FetchingLogs)
            .await?;
        let logs = ctx
            .codehost
            .download_run_logs(&failure.repo, failure.run_id)
            .await?;
        let Some(localized) = localize(&logs) else {
            ctx.notifier.notify(NotifyEvent::PipelineFailed {
                failure_id,
                repo: failure.repo.clone(),
                error: "no job logs available for run".to_string(),
                timestamp: chrono::Utc::now(),
            });
            return Err(PipelineError::NoLogs);
        };
        let excerpt = truncate(&localized, DEFAULT_BUDGET);
        check_cancelled(cancel)?;

        ctx.store
            .transition(failure_id, FailureStatus::Analyzing)
            .await?;
        let analysis = analyze(ctx.llm.as_ref(), &excerpt).await?;
        ctx.store.record_analysis(failure_id, &analysis).await?;

        if !analysis.passes_confidence_gate() {
            info!(failure_id, confidence = analysis.confidence, "confidence below gate, escalating");
            let issue_url = ctx
                .codehost
                .create_escalation_issue(&EscalationContext {
                    repo: failure.repo.clone(),
                    run_id: failure.run_id,
                    branch: failure.branch.clone(),
                    sha: failure.sha.clone(),
                    workflow_name: failure.workflow_name.clone(),
                    summary: format!(
                        "Low-confidence analysis ({:.2}): {}",
                        analysis.confidence, analysis.error_message
                    ),
                    attempts_markdown: String::new(),
                })
                .await?;
            ctx.store
                .record_outcome(
                    failure_id,
                    FailureStatus::Escalated,
                    None,
                    Some(issue_url.clone()),
                    None,
                )
                .await?;
            ctx.notifier.notify(NotifyEvent::LowConfidenceEscalation {
                failure_id,
                repo: failure.repo.clone(),
                confidence: analysis.confidence,
                issue_url: issue_url.clone(),
                timestamp: chrono::Utc::now(),
            });
            return Ok(PipelineOutcome::Escalated {
                reason: "analysis confidence below reproduction gate".to_string(),
                issue_url,
            });
        }

        check_cancelled(cancel)?;
        ctx.store
            .transition(failure_id, FailureStatus::Reproducing)
            .await?;
        clone_commit(ctx.codehost.as_ref(), &failure.repo, &failure.sha, workspace_dir)?;
        let repro = reproduce(
            ctx.sandbox.as_ref(),
            workspace_dir,
            &ctx.sandbox_image,
            analysis.failing_test.as_deref(),
        )
        .await?;

        if !repro.reproduced() {
            ctx.store
                .record_outcome(
                    failure_id,
                    FailureStatus::NotReproduced,
                    None,
                    None,
                    Some("failure did not reproduce in sandbox".to_string()),
                )
                .await?;
            ctx.notifier.notify(NotifyEvent::NotReproduced {
                failure_id,
                repo: failure.repo.clone(),
                sha: failure.sha.clone(),
                timestamp: chrono::Utc::now(),
            });
            return Ok(PipelineOutcome::NotReproduced);
        }

        check_cancelled(cancel)?;
        ctx.store
            .transition(failure_id, FailureStatus::GeneratingTest)
            .await?;
        let generated_test = synthesize_test(ctx.llm.as_ref(), workspace_dir, &analysis).await?;

        check_cancelled(cancel)?;
        ctx.store
            .transition(failure_id, FailureStatus::Fixing)
            .await?;
        let outcome = run_fix_loop(
            ctx.llm.as_ref(),
            ctx.sandbox.as_ref(),
            workspace_dir,
            &ctx.sandbox_image,
            &analysis,
            &generated_test,
        )
        .await?;

        let mut attempts_markdown = String::new();
        for attempt in &outcome.attempts {
            let (file_path, original_span, replacement_span) = attempt
                .patch
                .as_ref()
                .map_or(("", "", ""), |p| (p.file_path.as_str(), p.original_span.as_str(), p.replacement_span.as_str()));
            ctx.store
                .append_attempt(
                    failure_id,
                    attempt.attempt_number,
                    file_path,
                    original_span,
                    replacement_span,
                    &attempt.explanation,
                    attempt.verdict,
                    attempt.error_output.as_deref(),
                )
                .await?;
            attempts_markdown.push_str(&format!(
                "- attempt {}: {} ({:?})\n",
                attempt.attempt_number, attempt.explanation, attempt.verdict
            ));
        }

        let attempt_count = outcome.attempts.len() as u32;
        match outcome.verdict {
            FixLoopVerdict::Fixed(patch) => {
                check_cancelled(cancel)?;
                ctx.store
                    .transition(failure_id, FailureStatus::CreatingPr)
                    .await?;
                let pr_url = create_review_request(ctx.codehost.as_ref(), &failure, &patch).await?;
                ctx.store
                    .record_outcome(failure_id, FailureStatus::Fixed, Some(pr_url.clone()), None, None)
                    .await?;
                ctx.notifier.notify(NotifyEvent::FixProposed {
                    failure_id,
                    repo: failure.repo.clone(),
                    pr_url: pr_url.clone(),
                    attempts: attempt_count,
                    timestamp: chrono::Utc::now(),
                });
                Ok(PipelineOutcome::Fixed { pr_url })
            }
            FixLoopVerdict::Exhausted => {
                warn!(failure_id, attempts = MAX_ATTEMPTS, "fix loop exhausted, escalating");
                let issue_url = ctx
                    .codehost
                    .create_escalation_issue(&EscalationContext {
                        repo: failure.repo.clone(),
                        run_id: failure.run_id,
                        branch: failure.branch.clone(),
                        sha: failure.sha.clone(),
                        workflow_name: failure.workflow_name.clone(),
                        summary: format!("Exhausted {MAX_ATTEMPTS} fix attempts"),
                        attempts_markdown,
                    })
                    .await?;
                ctx.store
                    .record_outcome(
                        failure_id,
                        FailureStatus::Escalated,
                        None,
                        Some(issue_url.clone()),
                        None,
                    )
                    .await?;
                ctx.notifier.notify(NotifyEvent::FixLoopExhausted {
                    failure_id,
                    repo: failure.repo.clone(),
                    attempts: MAX_ATTEMPTS,
                    issue_url: issue_url.clone(),
                    timestamp: chrono::Utc::now(),
                });
                Ok(PipelineOutcome::Escalated {
                    reason: format!("exhausted {MAX_ATTEMPTS} fix attempts"),
                    issue_url,
                })
            }
        }
    }
    .instrument(info_span!("pipeline", failure_id))
    .await
}

async fn create_review_request(
    codehost: &dyn CodeHostClient,
    failure: &crate::types::FailureRecord,
    patch: &PatchArtifact,
) -> Result<String, PipelineError> {
    let change = ProposedChange {
        repo: failure.repo.clone(),
        base_branch: failure.branch.clone(),
        head_branch: format!("mender/fix-{}", failure.run_id),
        title: format!("Fix: {}", patch.explanation),
        body: format!(
            "Automated fix for a failing build on `{}`.\n\n{}",
            failure.branch, patch.explanation
        ),
        file_path: patch.file_path.clone(),
        original_code: patch.original_span.clone(),
        fixed_code: patch.replacement_span.clone(),
    };
    Ok(codehost.create_review_request(&change).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fakes::ScriptedLlmClient;
    use crate::localizer::JobLog;
    use crate::sandbox::fakes::ScriptedSandboxDriver;
    use crate::types::{AnalysisArtifact, AttemptVerdict, ErrorKind, FailureRecord, FixAttempt};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeStore {
        failures: AsyncMutex<HashMap<i64, FailureRecord>>,
        attempts: AsyncMutex<Vec<FixAttempt>>,
    }

    impl FakeStore {
        fn with_failure(record: FailureRecord) -> Self {
            let mut map = HashMap::new();
            map.insert(record.id, record);
            Self {
                failures: AsyncMutex::new(map),
                attempts: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn upsert_failure(
            &self,
            _new: crate::store::NewFailure,
        ) -> Result<FailureRecord, StoreError> {
            unimplemented!("not exercised by pipeline tests")
        }

        async fn get_failure(&self, id: i64) -> Result<FailureRecord, StoreError> {
            self.failures
                .lock()
                .await
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound(id))
        }

        async fn transition(&self, id: i64, status: FailureStatus) -> Result<(), StoreError> {
            let mut failures = self.failures.lock().await;
            let record = failures.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            record.transition(status);
            Ok(())
        }

        async fn record_analysis(
            &self,
            id: i64,
            analysis: &AnalysisArtifact,
        ) -> Result<(), StoreError> {
            let mut failures = self.failures.lock().await;
            let record = failures.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            record.apply_analysis(analysis);
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
            let mut failures = self.failures.lock().await;
            let record = failures.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            record.pr_url = pr_url;
            record.issue_url = issue_url;
            record.error = error;
            record.transition(status);
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
            let attempt = FixAttempt {
                id: attempt_number as i64,
                failure_id,
                attempt_number,
                file_path: file_path.to_string(),
                original_code: original_code.to_string(),
                fixed_code: fixed_code.to_string(),
                explanation: explanation.to_string(),
                verdict,
                error_output: error_output.map(str::to_string),
                created_at: Utc::now(),
            };
            self.attempts.lock().await.push(attempt.clone());
            Ok(attempt)
        }

        async fn list_attempts(&self, failure_id: i64) -> Result<Vec<FixAttempt>, StoreError> {
            Ok(self
                .attempts
                .lock()
                .await
                .iter()
                .filter(|a| a.failure_id == failure_id)
                .cloned()
                .collect())
        }

        async fn list_in_flight(&self) -> Result<Vec<FailureRecord>, StoreError> {
            Ok(self
                .failures
                .lock()
                .await
                .values()
                .filter(|f| !f.status.is_terminal())
                .cloned()
                .collect())
        }
    }

    struct FakeCodeHost {
        logs: Vec<JobLog>,
    }

    #[async_trait]
    impl CodeHostClient for FakeCodeHost {
        async fn download_run_logs(
            &self,
            _repo: &str,
            _run_id: u64,
        ) -> Result<Vec<JobLog>, CodeHostError> {
            Ok(self.logs.clone())
        }

        fn clone_url(&self, repo: &str) -> String {
            format!("https://example.invalid/{repo}.git")
        }

        async fn create_review_request(
            &self,
            _change: &ProposedChange,
        ) -> Result<String, CodeHostError> {
            Ok("https://example.invalid/pr/1".to_string())
        }

        async fn create_escalation_issue(
            &self,
            _ctx: &EscalationContext,
        ) -> Result<String, CodeHostError> {
            Ok("https://example.invalid/issues/1".to_string())
        }
    }

    fn sample_failure() -> FailureRecord {
        FailureRecord {
            id: 1,
            run_id: 42,
            repo: "acme/widgets".to_string(),
            sha: "deadbeef".to_string(),
            branch: "main".to_string(),
            workflow_name: "ci".to_string(),
            created_at: Utc::now(),
            error_kind: None,
            file_path: None,
            line_number: None,
            function_name: None,
            error_message: None,
            failing_test: None,
            confidence: None,
            raw_log_snippet: None,
            status: FailureStatus::Pending,
            pr_url: None,
            issue_url: None,
            error: None,
            completed_at: None,
        }
    }

    fn ctx(llm_responses: Vec<Result<String, crate::llm::LlmError>>, logs: Vec<JobLog>) -> (PipelineContext, Arc<FakeStore>) {
        let store = Arc::new(FakeStore::with_failure(sample_failure()));
        let context = PipelineContext {
            llm: Arc::new(ScriptedLlmClient::new(llm_responses)),
            sandbox: Arc::new(ScriptedSandboxDriver::new(vec![])),
            codehost: Arc::new(FakeCodeHost { logs }),
            store: store.clone(),
            notifier: Arc::new(Notifier::disabled()),
            sandbox_image: "img".to_string(),
        };
        (context, store)
    }

    #[tokio::test]
    async fn low_confidence_analysis_escalates_without_reproducing() {
        let (context, store) = ctx(
            vec![Ok(r#"{"error_message": "maybe a flake", "confidence": 0.1}"#.to_string())],
            vec![JobLog {
                job_name: "test".to_string(),
                text: "Traceback\nAssertionError: boom".to_string(),
            }],
        );

        let result = run_pipeline(&context, 1, Path::new("/tmp/does-not-matter"), CancellationToken::new()).await;
        assert!(matches!(result, Ok(PipelineOutcome::Escalated { .. })));

        let failure = store.get_failure(1).await.unwrap();
        assert_eq!(failure.status, FailureStatus::Escalated);
        assert!(failure.issue_url.is_some());
        assert!(failure.pr_url.is_none());
    }

    #[tokio::test]
    async fn missing_logs_marks_failure_as_failed() {
        let (context, store) = ctx(vec![], vec![]);

        let result = run_pipeline(&context, 1, Path::new("/tmp/does-not-matter"), CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::NoLogs)));

        let failure = store.get_failure(1).await.unwrap();
        assert_eq!(failure.status, FailureStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_fetching_logs() {
        let (context, store) = ctx(vec![], vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_pipeline(&context, 1, Path::new("/tmp/does-not-matter"), cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));

        let failure = store.get_failure(1).await.unwrap();
        assert_eq!(failure.status, FailureStatus::Pending);
    }

    #[test]
    fn error_kind_default_used_when_unspecified() {
        assert_eq!(ErrorKind::default(), ErrorKind::Other);
    }
}
