//! Test Synthesis Stage (C7) — asks the model for a regression test that
//! exercises the analyzed failure and fails against the unpatched code.

use crate::llm::{LlmClient, LlmError};
use crate::types::{AnalysisArtifact, GeneratedTest};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TestSynthError {
    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("failed to read subject file {path}: {source}")]
    ReadSubject {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("model returned an empty test body")]
    EmptyResponse,
}

/// Existing-test-file input is truncated to this many bytes before being
/// submitted, per §4.7.
const EXISTING_TEST_BUDGET: usize = 2_000;

fn test_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"def\s+(test_\w+)\s*\(").expect("valid regex"))
}

fn function_def_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"def\s+(\w+)\s*\(").expect("valid regex"))
}

fn strip_fence(response: &str) -> &str {
    let trimmed = response.trim();
    if let Some(rest) = trimmed.strip_prefix("```python") {
        rest.trim_start().trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_start().trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

fn truncate_bytes(s: &str, budget: usize) -> &str {
    if s.len() <= budget {
        return s;
    }
    let mut end = budget;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn build_prompt(analysis: &AnalysisArtifact, subject_source: &str, existing_test: Option<&str>) -> String {
    let existing_test_block = existing_test.map_or_else(
        || "(no existing test file for this module)".to_string(),
        |t| truncate_bytes(t, EXISTING_TEST_BUDGET).to_string(),
    );
    format!(
        "A CI build failed with the following analysis:\n\
         error_kind: {:?}\n\
         file_path: {}\n\
         line: {:?}\n\
         function_name: {:?}\n\
         error_message: {}\n\
         failing_test: {:?}\n\n\
         Current source of the subject file ({}):\n{}\n\n\
         Existing test file for this module:\n{}\n\n\
         Write a single, minimal regression test function in the same \
         language as the subject file above. It must fail against the \
         current, unpatched code and would pass once the bug is fixed. Name \
         it `test_<subject>_<edge_case>`, give it a short docstring, and \
         avoid mocking unless strictly required. Respond with the test \
         function source only — no surrounding prose, no JSON, no \
         explanation.",
        analysis.error_kind,
        analysis.file_path,
        analysis.line,
        analysis.function_name,
        analysis.error_message,
        analysis.failing_test,
        analysis.file_path,
        subject_source,
        existing_test_block,
    )
}

/// Derive the test file a generated test for `subject_path` belongs in:
/// replace the first `src` path component with `tests` and prefix the file
/// name with `test_`, or fall back to placing it directly under `tests/` if
/// no `src` component exists (§4.7).
fn derive_target_test_file(subject_path: &str) -> PathBuf {
    let path = Path::new(subject_path);
    let components: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    if let Some(pos) = components.iter().position(|c| c == "src") {
        let mut out = components;
        out[pos] = "tests".to_string();
        if let Some(last) = out.last_mut() {
            if !last.starts_with("test_") {
                *last = format!("test_{last}");
            }
        }
        out.into_iter().collect()
    } else {
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "generated.py".to_string());
        let file_name = if file_name.starts_with("test_") {
            file_name
        } else {
            format!("test_{file_name}")
        };
        Path::new("tests").join(file_name)
    }
}

fn default_test_name(subject_path: &str) -> String {
    let stem = Path::new(subject_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "subject".to_string());
    format!("test_{stem}_regression")
}

/// Defined function names in `source` (`def name(...)`), used to compute
/// which subject symbols the generated test actually exercises.
fn defined_function_names(source: &str) -> Vec<String> {
    function_def_pattern()
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .collect()
}

/// Invoke LLM-test-synthesize against the workspace's current subject
/// source and any existing test file for that module, and return a
/// validated [`GeneratedTest`] (§4.7).
///
/// An empty model response is a hard error (`TestSynthError::EmptyResponse`)
/// — there is no sensible low-confidence fallback for "no test". A response
/// with no extractable `test_\w+` name still succeeds, falling back to a
/// name derived from the subject file.
pub async fn synthesize_test(
    llm: &dyn LlmClient,
    workspace_dir: &Path,
    analysis: &AnalysisArtifact,
) -> Result<GeneratedTest, TestSynthError> {
    let subject_path = workspace_dir.join(&analysis.file_path);
    let subject_source =
        std::fs::read_to_string(&subject_path).map_err(|source| TestSynthError::ReadSubject {
            path: analysis.file_path.clone(),
            source,
        })?;

    let target_test_file = derive_target_test_file(&analysis.file_path);
    let existing_test = std::fs::read_to_string(workspace_dir.join(&target_test_file)).ok();

    let response = llm
        .complete(&build_prompt(analysis, &subject_source, existing_test.as_deref()))
        .await?;
    let test_source = strip_fence(&response).to_string();
    if test_source.is_empty() {
        return Err(TestSynthError::EmptyResponse);
    }

    let bare_name = test_name_pattern()
        .captures(&test_source)
        .map_or_else(|| default_test_name(&analysis.file_path), |c| c[1].to_string());
    let test_name = format!("{}::{bare_name}", target_test_file.display());

    let required_symbols = defined_function_names(&subject_source)
        .into_iter()
        .filter(|name| test_source.contains(name.as_str()))
        .collect();

    Ok(GeneratedTest {
        test_name,
        test_source,
        target_test_file: target_test_file.to_string_lossy().into_owned(),
        required_symbols,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fakes::ScriptedLlmClient;
    use crate::types::ErrorKind;
    use tempfile::tempdir;

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
    async fn extracts_test_name_and_required_symbols_from_raw_source() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/app.py"), "def f(x):\n    return None\n\ndef g():\n    pass\n").unwrap();

        let llm = ScriptedLlmClient::new(vec![Ok(
            "```python\ndef test_f_handles_none():\n    \"\"\"f(None) should return 0.\"\"\"\n    assert f(None) == 0\n```"
                .to_string(),
        )]);

        let test = synthesize_test(&llm, dir.path(), &sample_analysis()).await.unwrap();
        assert_eq!(test.test_name, "tests/test_app.py::test_f_handles_none");
        assert_eq!(test.target_test_file, "tests/test_app.py");
        assert_eq!(test.required_symbols, vec!["f".to_string()]);
        assert!(test.test_source.contains("def test_f_handles_none()"));
        assert!(!test.test_source.contains("```"));
    }

    #[tokio::test]
    async fn falls_back_to_a_derived_name_when_none_is_present() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/app.py"), "def f(x):\n    return None\n").unwrap();

        let llm = ScriptedLlmClient::new(vec![Ok("assert f(None) == 0\n".to_string())]);

        let test = synthesize_test(&llm, dir.path(), &sample_analysis()).await.unwrap();
        assert_eq!(test.test_name, "tests/test_app.py::test_app_regression");
    }

    #[tokio::test]
    async fn places_test_under_tests_dir_when_subject_has_no_src_component() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "def f(x):\n    return None\n").unwrap();
        let analysis = AnalysisArtifact {
            file_path: "app.py".to_string(),
            ..sample_analysis()
        };

        let llm = ScriptedLlmClient::new(vec![Ok("def test_f_handles_none():\n    assert f(None) == 0\n".to_string())]);

        let test = synthesize_test(&llm, dir.path(), &analysis).await.unwrap();
        assert_eq!(test.target_test_file, "tests/test_app.py");
    }

    #[tokio::test]
    async fn empty_response_is_a_hard_error() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/app.py"), "def f(x):\n    return None\n").unwrap();

        let llm = ScriptedLlmClient::new(vec![Ok("   ".to_string())]);
        let result = synthesize_test(&llm, dir.path(), &sample_analysis()).await;
        assert!(matches!(result, Err(TestSynthError::EmptyResponse)));
    }

    #[tokio::test]
    async fn missing_subject_file_is_an_error() {
        let dir = tempdir().unwrap();
        let llm = ScriptedLlmClient::new(vec![]);
        let result = synthesize_test(&llm, dir.path(), &sample_analysis()).await;
        assert!(matches!(result, Err(TestSynthError::ReadSubject { .. })));
    }
}
