//! Fix Loop (C9) — bounded retry loop that synthesizes a patch, applies it,
//! re-runs the generated regression test, and feeds the outcome back into
//! the next synthesis attempt until it passes or attempts are exhausted.

use crate::fix_synth::synthesize_fix;
use crate::llm::LlmClient;
use crate::patch::{self, PatchError};
use crate::reproduction::detect_harness;
use crate::sandbox::{with_sandbox, ResourceLimits, SandboxDriver};
use crate::types::{AnalysisArtifact, AttemptSummary, AttemptVerdict, GeneratedTest, PatchArtifact};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Maximum number of synthesize/apply/verify cycles before escalating,
/// per §4.9.
pub const MAX_ATTEMPTS: u32 = 3;

/// Wall-clock budget for re-running the generated test inside the sandbox.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FixLoopError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("failed to write generated test into workspace: {0}")]
    WriteTest(#[source] std::io::Error),

    #[error("no recognizable test harness in repository")]
    NoHarness,
}

/// Record of a single synthesize/apply/verify cycle. `patch` is `None` when
/// the cycle never got as far as producing one — a synthesis failure is
/// still recorded as a fail attempt per §4.9 step 7, not a loop abort.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub patch: Option<PatchArtifact>,
    pub explanation: String,
    pub verdict: AttemptVerdict,
    pub error_output: Option<String>,
}

/// Outcome of running the full bounded retry loop.
#[derive(Debug, Clone)]
pub enum FixLoopVerdict {
    /// A patch was found whose applied workspace passes the generated test.
    Fixed(PatchArtifact),
    /// `MAX_ATTEMPTS` were exhausted with no passing patch.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct FixLoopOutcome {
    pub attempts: Vec<AttemptRecord>,
    pub verdict: FixLoopVerdict,
}

/// Push a synthetic fail record for an attempt that errored out (synthesis,
/// apply, or sandbox exec) instead of producing a verdict from the test run.
fn push_fail(
    history: &mut Vec<AttemptSummary>,
    attempts: &mut Vec<AttemptRecord>,
    attempt_number: u32,
    patch: Option<PatchArtifact>,
    error_output: String,
) {
    let explanation = patch
        .as_ref()
        .map_or_else(|| error_output.clone(), |p| p.explanation.clone());
    history.push(AttemptSummary {
        attempt_number,
        explanation: explanation.clone(),
        verdict: AttemptVerdict::Fail,
        error_output: Some(error_output.clone()),
    });
    attempts.push(AttemptRecord {
        attempt_number,
        patch,
        explanation,
        verdict: AttemptVerdict::Fail,
        error_output: Some(error_output),
    });
}

/// Append `test.test_source` to `test.target_test_file` within `workspace_dir`,
/// creating the file (and its parent directories) if absent.
fn write_generated_test(workspace_dir: &Path, test: &GeneratedTest) -> Result<(), FixLoopError> {
    let target = workspace_dir.join(&test.target_test_file);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(FixLoopError::WriteTest)?;
    }
    let mut contents = if target.is_file() {
        std::fs::read_to_string(&target).map_err(FixLoopError::WriteTest)?
    } else {
        String::new()
    };
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push('\n');
    contents.push_str(&test.test_source);
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    std::fs::write(&target, contents).map_err(FixLoopError::WriteTest)
}

/// Run the bounded fix loop for one failure.
///
/// `generated_test` has already been appended to the workspace and must
/// fail against the unpatched code (the caller verifies this before
/// entering the loop — see §4.7/§4.9 ordering).
///
/// Per §4.9 step 7, an error from synthesis, patch application, or the
/// sandbox exec is caught per-iteration and recorded as a synthetic fail
/// attempt rather than aborting the loop — only a write-test or harness
/// setup failure (outside the retry loop itself) propagates as an `Err`.
pub async fn run_fix_loop(
    llm: &dyn LlmClient,
    driver: &dyn SandboxDriver,
    workspace_dir: &Path,
    image: &str,
    analysis: &AnalysisArtifact,
    generated_test: &GeneratedTest,
) -> Result<FixLoopOutcome, FixLoopError> {
    write_generated_test(workspace_dir, generated_test)?;

    let harness = detect_harness(workspace_dir).ok_or(FixLoopError::NoHarness)?;
    let limits = ResourceLimits::default();

    let mut history: Vec<AttemptSummary> = Vec::new();
    let mut attempts: Vec<AttemptRecord> = Vec::new();

    for attempt_number in 1..=MAX_ATTEMPTS {
        let patch = match synthesize_fix(llm, analysis, &history).await {
            Ok(patch) => patch,
            Err(e) => {
                push_fail(&mut history, &mut attempts, attempt_number, None, e.to_string());
                continue;
            }
        };

        if let Err(e) = patch::apply(workspace_dir, &patch) {
            push_fail(&mut history, &mut attempts, attempt_number, Some(patch), e.to_string());
            continue;
        }

        let command = harness.command_for_test(&generated_test.test_name);
        let result = match with_sandbox(driver, image, workspace_dir, &limits, |handle| {
            Box::pin(async move { handle.exec(&command, VERIFY_TIMEOUT).await })
        })
        .await
        {
            Ok(result) => result,
            Err(e) => {
                patch::revert(workspace_dir, &patch)?;
                push_fail(&mut history, &mut attempts, attempt_number, Some(patch), e.to_string());
                continue;
            }
        };

        if result.succeeded() {
            attempts.push(AttemptRecord {
                attempt_number,
                explanation: patch.explanation.clone(),
                patch: Some(patch.clone()),
                verdict: AttemptVerdict::Pass,
                error_output: None,
            });
            return Ok(FixLoopOutcome {
                attempts,
                verdict: FixLoopVerdict::Fixed(patch),
            });
        }

        patch::revert(workspace_dir, &patch)?;
        let error_output = format!("{}{}", result.stdout, result.stderr);
        history.push(AttemptSummary {
            attempt_number,
            explanation: patch.explanation.clone(),
            verdict: AttemptVerdict::Fail,
            error_output: Some(error_output.clone()),
        });
        attempts.push(AttemptRecord {
            attempt_number,
            explanation: patch.explanation.clone(),
            patch: Some(patch),
            verdict: AttemptVerdict::Fail,
            error_output: Some(error_output),
        });
    }

    Ok(FixLoopOutcome {
        attempts,
        verdict: FixLoopVerdict::Exhausted,
    })
}
