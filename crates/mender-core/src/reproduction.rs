//! Reproduction Runner (C5) — clones a failing commit into a sandbox,
//! detects the project's test harness, and re-runs it to confirm the
//! failure is real before any patch is attempted.

use crate::sandbox::{with_sandbox, ExecResult, ResourceLimits, SandboxDriver};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Shallow clone depth used when fetching the failing commit, per §4.5 —
/// deep enough to resolve a merge commit's parents, shallow enough to stay
/// fast for large repos.
pub const CLONE_DEPTH: u32 = 50;

/// Default image used for reproduction when a repo specifies none.
pub const DEFAULT_IMAGE: &str = "mender/python-ci:3.12";

/// Wall-clock budget for a single reproduction run, per §4.5.
pub const REPRODUCTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for upgrading the package installer itself, per §4.5 step 3.
pub const PIP_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for installing the test runner, per §4.5 step 3.
pub const TEST_RUNNER_INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for `pip install -r requirements.txt`, per §4.5 step 3.
pub const REQUIREMENTS_INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

/// Timeout for the editable-mode install of a `setup.py`-based package, per
/// §4.5 step 3.
pub const EDITABLE_INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ReproductionError {
    #[error(transparent)]
    Sandbox(#[from] crate::sandbox::SandboxError),

    #[error("no recognizable test harness in repository")]
    NoHarness,
}

/// The test harness detected in a cloned workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Harness {
    Pytest,
    SetupPyTest,
}

impl Harness {
    /// The command used to run the full suite for this harness.
    #[must_use]
    pub fn default_command(self) -> Vec<String> {
        match self {
            Self::Pytest => vec!["pytest".to_string(), "-q".to_string()],
            Self::SetupPyTest => vec![
                "python".to_string(),
                "setup.py".to_string(),
                "test".to_string(),
            ],
        }
    }

    /// The command used to run a single named test, per §4.5/§4.7.
    #[must_use]
    pub fn command_for_test(self, test_id: &str) -> Vec<String> {
        match self {
            Self::Pytest => vec!["pytest".to_string(), "-q".to_string(), test_id.to_string()],
            Self::SetupPyTest => vec![
                "python".to_string(),
                "-m".to_string(),
                "pytest".to_string(),
                "-q".to_string(),
                test_id.to_string(),
            ],
        }
    }
}

/// Detect the harness from files present at the root of `workspace_dir`.
///
/// Looks for `pyproject.toml` with a `[tool.pytest` section or any
/// `pytest.ini`/`setup.cfg` containing a `[tool:pytest]` section first;
/// falls back to `setup.py` presence; otherwise `None`.
#[must_use]
pub fn detect_harness(workspace_dir: &Path) -> Option<Harness> {
    if workspace_dir.join("pytest.ini").is_file() {
        return Some(Harness::Pytest);
    }
    if let Ok(contents) = std::fs::read_to_string(workspace_dir.join("pyproject.toml")) {
        if contents.contains("[tool.pytest") {
            return Some(Harness::Pytest);
        }
    }
    if let Ok(contents) = std::fs::read_to_string(workspace_dir.join("setup.cfg")) {
        if contents.contains("[tool:pytest]") {
            return Some(Harness::Pytest);
        }
    }
    if workspace_dir.join("setup.py").is_file() {
        return Some(Harness::SetupPyTest);
    }
    None
}

/// Outcome of attempting to reproduce a failure inside a sandbox.
#[derive(Debug, Clone)]
pub struct ReproductionOutcome {
    pub harness: Harness,
    pub dependency_install_exit_code: Option<i32>,
    pub editable_install_exit_code: Option<i32>,
    pub result: ExecResult,
}

impl ReproductionOutcome {
    /// Whether the run reproduced the reported failure — a non-zero exit
    /// from the command, not yet interpreted further.
    #[must_use]
    pub fn reproduced(&self) -> bool {
        !self.result.succeeded()
    }
}

/// Prepare the environment and run the detected harness's full suite (or a
/// single test, when `test_id` is given) inside a freshly created sandbox.
///
/// Per §4.5 step 3, preparation always upgrades the package installer and
/// installs the test runner, then conditionally installs `requirements.txt`
/// (180s timeout) and, for a `setup.py`-based package, the package itself in
/// editable mode (120s timeout) before the test command runs.
///
/// Resolved Open Question (§9): a non-zero install exit code at any of
/// these steps is surfaced as data on [`ReproductionOutcome`] rather than
/// silently swallowed or treated as fatal — callers decide what to do with
/// it.
pub async fn reproduce(
    driver: &dyn SandboxDriver,
    workspace_dir: &Path,
    image: &str,
    test_id: Option<&str>,
) -> Result<ReproductionOutcome, ReproductionError> {
    let harness = detect_harness(workspace_dir).ok_or(ReproductionError::NoHarness)?;
    let limits = ResourceLimits::default();

    let has_requirements = workspace_dir.join("requirements.txt").is_file();
    let has_setup_py = workspace_dir.join("setup.py").is_file();
    let command = match test_id {
        Some(id) => harness.command_for_test(id),
        None => harness.default_command(),
    };

    with_sandbox(driver, image, workspace_dir, &limits, move |handle| {
        Box::pin(async move {
            handle
                .exec(
                    &["pip".to_string(), "install".to_string(), "--upgrade".to_string(), "pip".to_string()],
                    PIP_UPGRADE_TIMEOUT,
                )
                .await?;
            handle
                .exec(
                    &["pip".to_string(), "install".to_string(), "pytest".to_string()],
                    TEST_RUNNER_INSTALL_TIMEOUT,
                )
                .await?;

            let dependency_install_exit_code = if has_requirements {
                let install = handle
                    .exec(
                        &[
                            "pip".to_string(),
                            "install".to_string(),
                            "-r".to_string(),
                            "requirements.txt".to_string(),
                        ],
                        REQUIREMENTS_INSTALL_TIMEOUT,
                    )
                    .await?;
                Some(install.exit_code)
            } else {
                None
            };

            let editable_install_exit_code = if has_setup_py {
                let install = handle
                    .exec(
                        &["pip".to_string(), "install".to_string(), "-e".to_string(), ".".to_string()],
                        EDITABLE_INSTALL_TIMEOUT,
                    )
                    .await?;
                Some(install.exit_code)
            } else {
                None
            };

            let result = handle.exec(&command, REPRODUCTION_TIMEOUT).await?;

            Ok(ReproductionOutcome {
                harness,
                dependency_install_exit_code,
                editable_install_exit_code,
                result,
            })
        })
    })
    .await
    .map_err(ReproductionError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detects_pytest_via_pyproject() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[tool.pytest.ini_options]\naddopts = \"-q\"\n",
        )
        .unwrap();
        assert_eq!(detect_harness(dir.path()), Some(Harness::Pytest));
    }

    #[test]
    fn detects_setup_py_fallback() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("setup.py"), "from setuptools import setup\n").unwrap();
        assert_eq!(detect_harness(dir.path()), Some(Harness::SetupPyTest));
    }

    #[test]
    fn no_recognizable_harness_returns_none() {
        let dir = tempdir().unwrap();
        assert_eq!(detect_harness(dir.path()), None);
    }

    #[test]
    fn single_test_command_targets_the_test_id() {
        let cmd = Harness::Pytest.command_for_test("tests/test_x.py::test_one");
        assert!(cmd.contains(&"tests/test_x.py::test_one".to_string()));
    }

    fn ok_exec() -> ExecResult {
        ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    #[tokio::test]
    async fn reproduce_surfaces_nonzero_dependency_install_as_data() {
        use crate::sandbox::fakes::ScriptedSandboxDriver;

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("pytest.ini"), "[pytest]\n").unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "nonexistent-pkg==0.0\n").unwrap();

        let driver = ScriptedSandboxDriver::new(vec![
            ok_exec(),
            ok_exec(),
            ExecResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "could not find package".to_string(),
                timed_out: false,
            },
            ExecResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "ModuleNotFoundError".to_string(),
                timed_out: false,
            },
        ]);

        let outcome = reproduce(&driver, dir.path(), DEFAULT_IMAGE, None)
            .await
            .unwrap();

        assert_eq!(outcome.dependency_install_exit_code, Some(1));
        assert_eq!(outcome.editable_install_exit_code, None);
        assert!(outcome.reproduced());
    }

    #[tokio::test]
    async fn reproduce_without_requirements_skips_install() {
        use crate::sandbox::fakes::ScriptedSandboxDriver;

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("pytest.ini"), "[pytest]\n").unwrap();

        let driver = ScriptedSandboxDriver::new(vec![
            ok_exec(),
            ok_exec(),
            ExecResult {
                exit_code: 0,
                stdout: "3 passed".to_string(),
                stderr: String::new(),
                timed_out: false,
            },
        ]);

        let outcome = reproduce(&driver, dir.path(), DEFAULT_IMAGE, None)
            .await
            .unwrap();

        assert_eq!(outcome.dependency_install_exit_code, None);
        assert_eq!(outcome.editable_install_exit_code, None);
        assert!(!outcome.reproduced());
    }

    #[tokio::test]
    async fn reproduce_installs_setup_py_package_in_editable_mode() {
        use crate::sandbox::fakes::ScriptedSandboxDriver;

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("setup.py"), "from setuptools import setup\n").unwrap();

        let driver = ScriptedSandboxDriver::new(vec![
            ok_exec(),
            ok_exec(),
            ExecResult {
                exit_code: 0,
                stdout: "Successfully installed".to_string(),
                stderr: String::new(),
                timed_out: false,
            },
            ExecResult {
                exit_code: 0,
                stdout: "Ran 3 tests".to_string(),
                stderr: String::new(),
                timed_out: false,
            },
        ]);

        let outcome = reproduce(&driver, dir.path(), DEFAULT_IMAGE, None)
            .await
            .unwrap();

        assert_eq!(outcome.harness, Harness::SetupPyTest);
        assert_eq!(outcome.dependency_install_exit_code, None);
        assert_eq!(outcome.editable_install_exit_code, Some(0));
        assert!(!outcome.reproduced());
    }
}
