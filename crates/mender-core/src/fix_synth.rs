//! Fix Synthesis Stage (C8) — asks the model for an exact-span patch,
//! optionally informed by the history of prior failed attempts.

use crate::llm::{LlmClient, LlmError};
use crate::types::{AnalysisArtifact, AttemptSummary, PatchArtifact};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixSynthError {
    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("model response was not valid JSON: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Deserialize)]
struct RawPatch {
    file_path: String,
    original_span: String,
    replacement_span: String,
    #[serde(default)]
    explanation: String,
}

fn build_prompt(analysis: &AnalysisArtifact, history: &[AttemptSummary]) -> String {
    let mut prompt = format!(
        "A CI build failed with the following analysis:\n\
         error_kind: {:?}\n\
         file_path: {}\n\
         line: {:?}\n\
         function_name: {:?}\n\
         error_message: {}\n\n\
         Propose an exact-span source code patch that fixes this failure. \
         Respond with a single JSON document and nothing else, matching \
         exactly this schema: {{\"file_path\": string path relative to repo \
         root, \"original_span\": string containing the exact, verbatim \
         source text to replace (must occur exactly once in the file), \
         \"replacement_span\": string containing the replacement text, \
         \"explanation\": short string describing the fix}}",
        analysis.error_kind, analysis.file_path, analysis.line, analysis.function_name,
        analysis.error_message,
    );

    if !history.is_empty() {
        prompt.push_str("\n\nPrior attempts that did not fix the failure:\n");
        for attempt in history {
            prompt.push_str(&format!(
                "- attempt {}: {} (verdict: {:?})",
                attempt.attempt_number, attempt.explanation, attempt.verdict
            ));
            if let Some(err) = &attempt.error_output {
                prompt.push_str(&format!("\n  error output: {err}"));
            }
            prompt.push('\n');
        }
        prompt.push_str("\nPropose a different fix than any of the above.");
    }

    prompt
}

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

/// Invoke LLM-fix-synthesize on `analysis`, feeding back `history` from
/// prior failed attempts (§4.8) so the model avoids repeating them.
pub async fn synthesize_fix(
    llm: &dyn LlmClient,
    analysis: &AnalysisArtifact,
    history: &[AttemptSummary],
) -> Result<PatchArtifact, FixSynthError> {
    let response = llm.complete(&build_prompt(analysis, history)).await?;
    let cleaned = strip_fence(&response);
    let raw: RawPatch = serde_json::from_str(cleaned)
        .map_err(|e| FixSynthError::InvalidResponse(e.to_string()))?;

    Ok(PatchArtifact {
        file_path: raw.file_path,
        original_span: raw.original_span,
        replacement_span: raw.replacement_span,
        explanation: raw.explanation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fakes::ScriptedLlmClient;
    use crate::types::{AttemptVerdict, ErrorKind};

    fn sample_analysis() -> AnalysisArtifact {
        AnalysisArtifact {
            error_kind: ErrorKind::TypeError,
            file_path: "src/app.py".to_string(),
            line: Some(10),
            function_name: Some("f".to_string()),
            error_message: "boom".to_string(),
            frames: vec![],
            failing_test: None,
            confidence: 0.9,
            raw_excerpt: "traceback".to_string(),
        }
    }

    #[tokio::test]
    async fn parses_well_formed_patch() {
        let llm = ScriptedLlmClient::new(vec![Ok(r#"{
            "file_path": "src/app.py",
            "original_span": "return None",
            "replacement_span": "return 0",
            "explanation": "default to zero instead of None"
        }"#
        .to_string())]);

        let patch = synthesize_fix(&llm, &sample_analysis(), &[]).await.unwrap();
        assert_eq!(patch.file_path, "src/app.py");
        assert_eq!(patch.original_span, "return None");
    }

    #[tokio::test]
    async fn history_is_folded_into_the_prompt() {
        let history = vec![AttemptSummary {
            attempt_number: 1,
            explanation: "tried returning 0".to_string(),
            verdict: AttemptVerdict::Fail,
            error_output: Some("still AssertionError".to_string()),
        }];

        // The scripted client ignores prompt content, so this asserts the
        // call succeeds end-to-end with history present rather than
        // inspecting prompt text directly.
        let llm = ScriptedLlmClient::new(vec![Ok(r#"{
            "file_path": "src/app.py",
            "original_span": "return 0",
            "replacement_span": "return amount",
            "explanation": "return the actual amount"
        }"#
        .to_string())]);

        let patch = synthesize_fix(&llm, &sample_analysis(), &history)
            .await
            .unwrap();
        assert_eq!(patch.replacement_span, "return amount");
    }

    #[tokio::test]
    async fn unparseable_response_is_a_hard_error() {
        let llm = ScriptedLlmClient::new(vec![Ok("nonsense".to_string())]);
        let result = synthesize_fix(&llm, &sample_analysis(), &[]).await;
        assert!(matches!(result, Err(FixSynthError::InvalidResponse(_))));
    }
}
