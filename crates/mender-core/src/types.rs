//! Core data model for the healing pipeline.
//!
//! These types cross every boundary in the system: they are what the LLM
//! client parses its responses into, what the durable store persists, and
//! what the orchestrator mutates as a failure moves through its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed enumeration of error kinds the analysis stage can report.
///
/// Anything the LLM returns outside this set is coerced to [`ErrorKind::Other`]
/// by the analysis stage — never propagated as free text into routing logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    ImportError,
    ModuleNotFoundError,
    TypeError,
    AttributeError,
    AssertionError,
    SyntaxError,
    NameError,
    ValueError,
    KeyError,
    Other,
}

impl ErrorKind {
    /// Parse a model-provided string into a closed-enum value, defaulting to
    /// [`ErrorKind::Other`] for anything unrecognized.
    #[must_use]
    pub fn coerce(raw: &str) -> Self {
        match raw {
            "ImportError" => Self::ImportError,
            "ModuleNotFoundError" => Self::ModuleNotFoundError,
            "TypeError" => Self::TypeError,
            "AttributeError" => Self::AttributeError,
            "AssertionError" => Self::AssertionError,
            "SyntaxError" => Self::SyntaxError,
            "NameError" => Self::NameError,
            "ValueError" => Self::ValueError,
            "KeyError" => Self::KeyError,
            _ => Self::Other,
        }
    }
}

impl Default for ErrorKind {
    fn default() -> Self {
        Self::Other
    }
}

/// Transient analysis artifact produced by the Analysis Stage (C6).
///
/// Not persisted verbatim — its fields are flattened onto the parent
/// [`FailureRecord`] row by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisArtifact {
    pub error_kind: ErrorKind,
    pub file_path: String,
    pub line: Option<u32>,
    pub function_name: Option<String>,
    pub error_message: String,
    #[serde(default)]
    pub frames: Vec<String>,
    pub failing_test: Option<String>,
    pub confidence: f64,
    pub raw_excerpt: String,
}

impl AnalysisArtifact {
    /// Confidence gate from §4.6/§4.10: below this, the orchestrator
    /// escalates without attempting reproduction.
    pub const CONFIDENCE_GATE: f64 = 0.3;

    /// Clamp confidence into `[0.0, 1.0]`, defaulting to 0.5 when absent —
    /// this is the one place confidence enters the system, so every other
    /// reader can assume the invariant already holds.
    #[must_use]
    pub fn clamp_confidence(raw: Option<f64>) -> f64 {
        raw.unwrap_or(0.5).clamp(0.0, 1.0)
    }

    /// Whether this artifact clears the reproduction gate.
    #[must_use]
    pub fn passes_confidence_gate(&self) -> bool {
        self.confidence >= Self::CONFIDENCE_GATE
    }

    /// A fallback artifact for when the model response could not be parsed
    /// as JSON at all (§4.6): kind `Other`, confidence 0, raw excerpt is the
    /// first 1000 bytes of whatever the model returned.
    #[must_use]
    pub fn unparseable(raw_response: &str) -> Self {
        let excerpt: String = raw_response.chars().take(1000).collect();
        Self {
            error_kind: ErrorKind::Other,
            file_path: "unknown".to_string(),
            line: None,
            function_name: None,
            error_message: String::new(),
            frames: Vec::new(),
            failing_test: None,
            confidence: 0.0,
            raw_excerpt: excerpt,
        }
    }
}

/// Transient patch artifact produced by the Fix Synthesis Stage (C8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchArtifact {
    pub file_path: String,
    pub original_span: String,
    pub replacement_span: String,
    pub explanation: String,
}

/// Generated regression test artifact produced by the Test Synthesis Stage (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub test_name: String,
    pub test_source: String,
    pub target_test_file: String,
    pub required_symbols: Vec<String>,
}

/// Terminal/transient states of a failure record, per §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    Pending,
    FetchingLogs,
    Analyzing,
    Reproducing,
    NotReproduced,
    GeneratingTest,
    Fixing,
    CreatingPr,
    Fixed,
    Escalated,
    Failed,
}

impl FailureStatus {
    /// Terminal states per §3/§4.10: once reached, the row is immutable
    /// except for a re-ingestion reset back to `Pending`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Fixed | Self::Escalated | Self::Failed | Self::NotReproduced
        )
    }
}

/// One ingested failing build — unique under `(run_id, repo)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: i64,
    pub run_id: u64,
    pub repo: String,
    pub sha: String,
    pub branch: String,
    pub workflow_name: String,
    pub created_at: DateTime<Utc>,

    pub error_kind: Option<ErrorKind>,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub function_name: Option<String>,
    pub error_message: Option<String>,
    pub failing_test: Option<String>,
    pub confidence: Option<f64>,
    pub raw_log_snippet: Option<String>,

    pub status: FailureStatus,
    pub pr_url: Option<String>,
    pub issue_url: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FailureRecord {
    /// Apply an [`AnalysisArtifact`] onto this record's analysis columns.
    pub fn apply_analysis(&mut self, analysis: &AnalysisArtifact) {
        self.error_kind = Some(analysis.error_kind);
        self.file_path = Some(analysis.file_path.clone());
        self.line_number = analysis.line;
        self.function_name = analysis.function_name.clone();
        self.error_message = Some(analysis.error_message.clone());
        self.failing_test = analysis.failing_test.clone();
        self.confidence = Some(analysis.confidence);
        self.raw_log_snippet = Some(analysis.raw_excerpt.clone());
    }

    /// Transition to a new status, recording a completion timestamp only
    /// when the new status is terminal (§3 invariant).
    pub fn transition(&mut self, status: FailureStatus) {
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Verdict of a single fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptVerdict {
    Pass,
    Fail,
}

/// One generated-and-tested patch, ordered by attempt number within a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    pub id: i64,
    pub failure_id: i64,
    pub attempt_number: u32,
    pub file_path: String,
    pub original_code: String,
    pub fixed_code: String,
    pub explanation: String,
    pub verdict: AttemptVerdict,
    pub error_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Summary of a prior attempt as fed back into fix-synthesis prompts (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt_number: u32,
    pub explanation: String,
    pub verdict: AttemptVerdict,
    pub error_output: Option<String>,
}

impl From<&FixAttempt> for AttemptSummary {
    fn from(attempt: &FixAttempt) -> Self {
        const MAX_ERROR_BYTES: usize = 500;
        Self {
            attempt_number: attempt.attempt_number,
            explanation: attempt.explanation.clone(),
            verdict: attempt.verdict,
            error_output: attempt
                .error_output
                .as_deref()
                .map(|s| truncate_bytes(s, MAX_ERROR_BYTES)),
        }
    }
}

/// Truncate a string to at most `max_bytes` bytes on a char boundary.
#[must_use]
pub fn truncate_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_unknown_error_kind_to_other() {
        assert_eq!(ErrorKind::coerce("SegFault"), ErrorKind::Other);
        assert_eq!(ErrorKind::coerce("KeyError"), ErrorKind::KeyError);
    }

    #[test]
    fn clamps_confidence_into_unit_interval() {
        assert_eq!(AnalysisArtifact::clamp_confidence(Some(1.5)), 1.0);
        assert_eq!(AnalysisArtifact::clamp_confidence(Some(-0.2)), 0.0);
        assert_eq!(AnalysisArtifact::clamp_confidence(None), 0.5);
    }

    #[test]
    fn terminal_status_set_matches_spec() {
        assert!(FailureStatus::Fixed.is_terminal());
        assert!(FailureStatus::Escalated.is_terminal());
        assert!(FailureStatus::Failed.is_terminal());
        assert!(FailureStatus::NotReproduced.is_terminal());
        assert!(!FailureStatus::Analyzing.is_terminal());
        assert!(!FailureStatus::Pending.is_terminal());
    }

    #[test]
    fn truncate_bytes_respects_char_boundaries() {
        let s = "héllo world";
        let truncated = truncate_bytes(s, 3);
        assert!(s.as_bytes()[..truncated.len()] == *truncated.as_bytes());
    }
}
