//! Sandbox Session (C4) — interface for an ephemeral container execution
//! environment. The concrete Docker-backed implementation lives in the
//! `mender-sandbox` crate; this module only defines the contract so the
//! pipeline can depend on a trait object instead of a concrete driver.

use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Resource policy applied to every sandbox session, per §4.4.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_quota_percent: u32,
    pub network_enabled: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota_percent: 50,
            network_enabled: true,
        }
    }
}

/// Result of executing a command inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    /// Synthesize the timeout result per §4.4/§5: exit code 124, timed_out = true.
    #[must_use]
    pub fn timeout(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 124,
            stdout,
            stderr,
            timed_out: true,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors from sandbox lifecycle operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create sandbox: {0}")]
    Create(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("failed to tear down sandbox: {0}")]
    Teardown(String),
}

/// A live handle to an exec-capable sandbox session.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Run `argv` inside the sandbox with `timeout`, demultiplexing the
    /// container's combined stream into separate stdout/stderr.
    ///
    /// On timeout the container is killed and the result carries
    /// `exit_code = 124`, `timed_out = true`.
    async fn exec(&self, argv: &[String], timeout: Duration) -> Result<ExecResult, SandboxError>;

    /// Tear down the underlying container. Called exactly once, on every
    /// exit path, by [`with_sandbox`].
    async fn teardown(self: Box<Self>) -> Result<(), SandboxError>;
}

/// Driver abstracting "create ephemeral execution environment" and
/// janitor-facing enumeration of sessions it owns.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Acquire an image, bind `workspace_dir` into the container at a fixed
    /// in-container path, and return a live exec handle.
    async fn create(
        &self,
        image: &str,
        workspace_dir: &Path,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError>;

    /// List sandboxes (containers) currently bound under the managed
    /// workspace prefix, with their creation time — used by the Janitor
    /// (C12) to reap stale sessions without tracking them itself.
    async fn list_managed(&self) -> Result<Vec<ManagedSandbox>, SandboxError>;

    /// Forcibly remove a managed sandbox by id, regardless of its state.
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;
}

/// A sandbox discovered by [`SandboxDriver::list_managed`].
#[derive(Debug, Clone)]
pub struct ManagedSandbox {
    pub id: String,
    pub workspace_path: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Run `body` against a freshly created sandbox, guaranteeing teardown on
/// every exit path including an error or timeout inside `body`.
///
/// This is the Rust expression of "`withSandbox(image, workspaceDir, body)`"
/// from §4.4: a scoped lifecycle helper rather than a trait method, so it
/// composes with ordinary `?`/`async` control flow in callers.
pub async fn with_sandbox<F, T>(
    driver: &dyn SandboxDriver,
    image: &str,
    workspace_dir: &Path,
    limits: &ResourceLimits,
    body: F,
) -> Result<T, SandboxError>
where
    F: for<'a> FnOnce(
        &'a dyn SandboxHandle,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<T, SandboxError>> + Send + 'a>>,
{
    let handle = driver.create(image, workspace_dir, limits).await?;
    let result = body(handle.as_ref()).await;
    // Teardown runs regardless of the body's outcome; a teardown failure is
    // logged by the driver and never masks the body's own result.
    let _ = handle.teardown().await;
    result
}
