//! Log Localizer (C1) — picks the single job log most likely to contain the
//! failure out of a set of per-job logs.

/// Case-insensitive tokens that score a log line as evidence of a failure.
const LOWER_INDICATORS: &[&str] = &["error", "failed", "exception", "traceback"];

/// Literal (case-sensitive) indicators, scored in addition to the
/// case-insensitive set.
const LITERAL_INDICATORS: &[&str] = &[
    "FAILED",
    "AssertionError",
    "TypeError",
    "ImportError",
    "ModuleNotFoundError",
];

/// One job's log text, paired with the job name it came from.
#[derive(Debug, Clone)]
pub struct JobLog {
    pub job_name: String,
    pub text: String,
}

/// Count non-overlapping indicator matches in `text`.
fn score(text: &str) -> usize {
    let lower = text.to_lowercase();
    let mut total = 0;
    for token in LOWER_INDICATORS {
        total += lower.matches(token).count();
    }
    for token in LITERAL_INDICATORS {
        total += text.matches(token).count();
    }
    total
}

/// Pick the log most likely to contain the failure, or `None` if `logs` is
/// empty.
///
/// Ties are broken by input order. If every log scores zero, falls back to
/// concatenating all logs (each prefixed with a header naming its job) so
/// that recall is preserved even when density signals are absent.
#[must_use]
pub fn localize(logs: &[JobLog]) -> Option<String> {
    if logs.is_empty() {
        return None;
    }

    let scored: Vec<usize> = logs.iter().map(|log| score(&log.text)).collect();
    // `Iterator::max_by_key` keeps the *last* maximum on ties; walk manually
    // so the first-in-input-order log wins instead.
    let mut best_index = 0;
    for (i, &s) in scored.iter().enumerate() {
        if s > scored[best_index] {
            best_index = i;
        }
    }

    if scored[best_index] == 0 {
        let mut combined = String::new();
        for log in logs {
            combined.push_str(&format!("=== {} ===\n", log.job_name));
            combined.push_str(&log.text);
            combined.push('\n');
        }
        return Some(combined);
    }

    Some(logs[best_index].text.clone())
}
