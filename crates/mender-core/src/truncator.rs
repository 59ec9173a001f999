//! Log Truncator (C2) — reduces an oversized log to an error-relevant
//! excerpt within a byte budget.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Default byte budget per §4.2.
pub const DEFAULT_BUDGET: usize = 50_000;

const RELEVANT_TOKENS: &[&str] = &["error", "exception", "traceback", "failed", "assert"];
const CONTEXT_BEFORE: usize = 5;
const CONTEXT_AFTER: usize = 10;

fn file_location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"File "[^"]+", line \d+"#).expect("valid regex"))
}

fn is_relevant(line: &str) -> bool {
    let lower = line.to_lowercase();
    RELEVANT_TOKENS.iter().any(|t| lower.contains(t)) || file_location_pattern().is_match(line)
}

/// Truncate `log` to at most `budget` bytes, per §4.2.
///
/// Returns the log unchanged if it already fits. Otherwise expands each
/// error-relevant line into a window of `CONTEXT_BEFORE`/`CONTEXT_AFTER`
/// surrounding lines, dedups and sorts the resulting line indices, and
/// renders them with a header. If that rendering still exceeds `budget`,
/// falls back to the final `budget` bytes of the original log.
#[must_use]
pub fn truncate(log: &str, budget: usize) -> String {
    if log.len() <= budget {
        return log.to_string();
    }

    let lines: Vec<&str> = log.lines().collect();
    let mut keep: BTreeSet<usize> = BTreeSet::new();
    for (i, line) in lines.iter().enumerate() {
        if is_relevant(line) {
            let start = i.saturating_sub(CONTEXT_BEFORE);
            let end = (i + CONTEXT_AFTER).min(lines.len().saturating_sub(1));
            for idx in start..=end {
                keep.insert(idx);
            }
        }
    }

    if !keep.is_empty() {
        let mut rendered = String::from("[Log truncated — error-relevant sections]\n");
        for idx in &keep {
            rendered.push_str(lines[*idx]);
            rendered.push('\n');
        }
        if rendered.len() <= budget {
            return rendered;
        }
    }

    let tail_budget = budget.saturating_sub("[Log truncated — last B chars]\n".len());
    let mut start = log.len().saturating_sub(tail_budget);
    while start < log.len() && !log.is_char_boundary(start) {
        start += 1;
    }
    format!("[Log truncated — last B chars]\n{}", &log[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_log_passes_through_unchanged() {
        let log = "all good\n";
        assert_eq!(truncate(log, DEFAULT_BUDGET), log);
    }

    #[test]
    fn extracts_relevant_context_window() {
        let mut lines = vec!["noise".to_string(); 30];
        lines[15] = "Traceback (most recent call last):".to_string();
        lines[16] = "AssertionError: boom".to_string();
        let log = lines.join("\n");

        let truncated = truncate(&log, 50);
        assert!(truncated.contains("error-relevant sections"));
        assert!(truncated.contains("AssertionError"));
    }

    #[test]
    fn falls_back_to_tail_when_rendering_too_large() {
        let log = "error line\n".repeat(10_000);
        let truncated = truncate(&log, 100);
        assert!(truncated.len() <= 100 + "[Log truncated — last B chars]\n".len());
        assert!(truncated.starts_with("[Log truncated"));
    }

    #[test]
    fn matches_python_traceback_file_location() {
        let mut lines = vec!["noise".to_string(); 20];
        lines[10] = r#"File "src/app.py", line 42"#.to_string();
        let log = lines.join("\n");
        let truncated = truncate(&log, 50);
        assert!(truncated.contains(r#"File "src/app.py", line 42"#));
    }
}
