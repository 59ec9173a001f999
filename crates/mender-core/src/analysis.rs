//! Analysis Stage (C6) — invokes LLM-analyze on a localized+truncated log
//! and validates/normalizes the structured response.

use crate::llm::{LlmClient, LlmError};
use crate::types::{AnalysisArtifact, ErrorKind};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),
}

/// Raw shape requested from the model; every field is optional on the wire
/// because the model sometimes omits fields — defaulting happens here, not
/// at call sites.
#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    error_kind: Option<String>,
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    function_name: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    frames: Option<Vec<String>>,
    #[serde(default)]
    failing_test: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

fn build_prompt(log_excerpt: &str) -> String {
    format!(
        "You are analyzing a failed CI build log. Respond with a single JSON \
         document and nothing else, matching exactly this schema:\n\
         {{\"error_kind\": one of [ImportError, ModuleNotFoundError, TypeError, \
         AttributeError, AssertionError, SyntaxError, NameError, ValueError, \
         KeyError, Other], \"file_path\": string relative to repo root, \
         \"line\": integer or null, \"function_name\": string or null, \
         \"error_message\": string, \"frames\": array of strings, \
         \"failing_test\": string or null, \"confidence\": number in [0,1]}}\n\n\
         Log:\n{log_excerpt}"
    )
}

/// Strip a single leading fenced code-block marker (```` ``` ```` or
/// ```` ```json ````) if present, per §4.6.
fn strip_fence(response: &str) -> &str {
    let trimmed = response.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_start().trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_start().trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

/// Invoke LLM-analyze on `log_excerpt` (already localized and truncated by
/// the caller) and return a validated, normalized [`AnalysisArtifact`].
///
/// Never returns a parse failure as an error — an unparseable response
/// becomes a low-confidence `Other` artifact (§4.6), so the orchestrator can
/// route it straight to the confidence gate.
pub async fn analyze(
    llm: &dyn LlmClient,
    log_excerpt: &str,
) -> Result<AnalysisArtifact, AnalysisError> {
    let response = llm.complete(&build_prompt(log_excerpt)).await?;
    let cleaned = strip_fence(&response);

    let raw: RawAnalysis = match serde_json::from_str(cleaned) {
        Ok(raw) => raw,
        Err(_) => return Ok(AnalysisArtifact::unparseable(&response)),
    };

    Ok(AnalysisArtifact {
        error_kind: raw
            .error_kind
            .as_deref()
            .map(ErrorKind::coerce)
            .unwrap_or_default(),
        file_path: raw.file_path.unwrap_or_else(|| "unknown".to_string()),
        line: raw.line,
        function_name: raw.function_name,
        error_message: raw.error_message.unwrap_or_default(),
        frames: raw.frames.unwrap_or_default(),
        failing_test: raw.failing_test,
        confidence: AnalysisArtifact::clamp_confidence(raw.confidence),
        raw_excerpt: log_excerpt.to_string(),
    })
}
