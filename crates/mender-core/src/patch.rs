//! Patch Applicator (C3) — applies and reverts exact-span textual patches to
//! files within a workspace.

use crate::types::PatchArtifact;
use std::path::Path;
use thiserror::Error;

/// Errors from applying or reverting a patch.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("target file not found: {0}")]
    FileNotFound(String),

    #[error("I/O error reading/writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("original span not found in {0}")]
    SpanNotFound(String),

    /// Resolved Open Question (§9, REDESIGN FLAGS): reject non-unique spans
    /// instead of silently replacing the first occurrence.
    #[error("original span occurs {count} times in {path}, expected exactly 1")]
    AmbiguousSpan { path: String, count: usize },

    #[error("applying the patch did not change {0}")]
    NoOpPatch(String),
}

/// Apply `patch` to the file at `workspace/patch.file_path`.
///
/// Fails if the file is absent, if `original_span` does not occur in the
/// file, if it occurs more than once (see `PatchError::AmbiguousSpan`), or
/// if the substitution would be a no-op.
pub fn apply(workspace: &Path, patch: &PatchArtifact) -> Result<(), PatchError> {
    replace_span(workspace, &patch.file_path, &patch.original_span, &patch.replacement_span)
}

/// Revert `patch` by replacing the replacement span back with the original.
///
/// A missing replacement span (already reverted) is treated as a no-op
/// success, per §4.3.
pub fn revert(workspace: &Path, patch: &PatchArtifact) -> Result<(), PatchError> {
    let full_path = workspace.join(&patch.file_path);
    let contents = read_file(&full_path, &patch.file_path)?;
    if !contents.contains(&patch.replacement_span) {
        return Ok(());
    }
    replace_span(workspace, &patch.file_path, &patch.replacement_span, &patch.original_span)
}

fn replace_span(
    workspace: &Path,
    file_path: &str,
    from: &str,
    to: &str,
) -> Result<(), PatchError> {
    let full_path = workspace.join(file_path);
    let contents = read_file(&full_path, file_path)?;

    let occurrences = contents.matches(from).count();
    if occurrences == 0 {
        return Err(PatchError::SpanNotFound(file_path.to_string()));
    }
    if occurrences > 1 {
        return Err(PatchError::AmbiguousSpan {
            path: file_path.to_string(),
            count: occurrences,
        });
    }

    let updated = contents.replacen(from, to, 1);
    if updated == contents {
        return Err(PatchError::NoOpPatch(file_path.to_string()));
    }

    std::fs::write(&full_path, updated).map_err(|source| PatchError::Io {
        path: file_path.to_string(),
        source,
    })?;

    Ok(())
}

fn read_file(full_path: &Path, display_path: &str) -> Result<String, PatchError> {
    if !full_path.is_file() {
        return Err(PatchError::FileNotFound(display_path.to_string()));
    }
    std::fs::read_to_string(full_path).map_err(|source| PatchError::Io {
        path: display_path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    fn sample_patch() -> PatchArtifact {
        PatchArtifact {
            file_path: "src/app.py".to_string(),
            original_span: "return None".to_string(),
            replacement_span: "return amount".to_string(),
            explanation: "fix null return".to_string(),
        }
    }

    #[test]
    fn apply_then_revert_restores_original_bytes() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let original = "def f():\n    return None\n";
        write(dir.path(), "src/app.py", original);

        let patch = sample_patch();
        apply(dir.path(), &patch).unwrap();
        let patched = std::fs::read_to_string(dir.path().join("src/app.py")).unwrap();
        assert_ne!(patched, original);

        revert(dir.path(), &patch).unwrap();
        let reverted = std::fs::read_to_string(dir.path().join("src/app.py")).unwrap();
        assert_eq!(reverted, original);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let patch = sample_patch();
        assert!(matches!(
            apply(dir.path(), &patch),
            Err(PatchError::FileNotFound(_))
        ));
    }

    #[test]
    fn missing_span_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        write(dir.path(), "src/app.py", "def f():\n    pass\n");
        let patch = sample_patch();
        assert!(matches!(
            apply(dir.path(), &patch),
            Err(PatchError::SpanNotFound(_))
        ));
    }

    #[test]
    fn ambiguous_span_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        write(
            dir.path(),
            "src/app.py",
            "def f():\n    return None\ndef g():\n    return None\n",
        );
        let patch = sample_patch();
        assert!(matches!(
            apply(dir.path(), &patch),
            Err(PatchError::AmbiguousSpan { count: 2, .. })
        ));
    }

    #[test]
    fn no_op_patch_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        write(dir.path(), "src/app.py", "return None\n");
        let patch = PatchArtifact {
            file_path: "src/app.py".to_string(),
            original_span: "return None".to_string(),
            replacement_span: "return None".to_string(),
            explanation: "no-op".to_string(),
        };
        assert!(matches!(
            apply(dir.path(), &patch),
            Err(PatchError::NoOpPatch(_))
        ));
    }

    #[test]
    fn revert_of_already_reverted_file_is_a_no_op() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        write(dir.path(), "src/app.py", "def f():\n    return None\n");
        let patch = sample_patch();
        revert(dir.path(), &patch).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("src/app.py")).unwrap();
        assert_eq!(contents, "def f():\n    return None\n");
    }
}
