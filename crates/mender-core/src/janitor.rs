//! Janitor (C12) — periodic sweep that reaps sandboxes and workspace
//! directories the pipeline failed to tear down (crash, panic, process
//! kill) rather than tracking their lifetimes itself.

use crate::sandbox::{SandboxDriver, SandboxError};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// A sandbox or workspace directory is considered stale once it has been
/// alive longer than this, per §4.12.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Run a single sweep: list every sandbox the driver considers managed and
/// remove any older than `STALE_AFTER` relative to `now`. Returns the
/// number of sandboxes removed.
///
/// A failure to remove one sandbox is logged and does not stop the sweep
/// from attempting the rest.
pub async fn sweep_once(
    driver: &dyn SandboxDriver,
    now: DateTime<Utc>,
) -> Result<usize, SandboxError> {
    let managed = driver.list_managed().await?;
    let mut removed = 0;

    for sandbox in managed {
        let age = now.signed_duration_since(sandbox.created_at);
        if age.to_std().unwrap_or(Duration::ZERO) < STALE_AFTER {
            continue;
        }
        match driver.remove(&sandbox.id).await {
            Ok(()) => {
                info!(sandbox_id = %sandbox.id, workspace = %sandbox.workspace_path, "reaped stale sandbox");
                removed += 1;
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.id, error = %e, "failed to reap stale sandbox");
            }
        }
    }

    Ok(removed)
}

/// Remove every direct subdirectory of `workspace_root` whose last-modified
/// time is older than `STALE_AFTER` relative to `now`. Returns the number
/// of directories removed.
///
/// A missing `workspace_root` is not an error — there is simply nothing to
/// sweep yet. A failure to remove one directory is logged and does not
/// stop the sweep from attempting the rest.
pub fn sweep_workspaces(workspace_root: &Path, now: DateTime<Utc>) -> usize {
    let entries = match std::fs::read_dir(workspace_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!(workspace_root = %workspace_root.display(), error = %e, "failed to list workspace root");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read workspace directory metadata");
                continue;
            }
        };
        let age = match now.signed_duration_since(DateTime::<Utc>::from(modified)).to_std() {
            Ok(age) => age,
            Err(_) => Duration::ZERO,
        };
        if age < STALE_AFTER {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(path = %path.display(), "reaped stale workspace directory");
                removed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to reap stale workspace directory");
            }
        }
    }

    removed
}

/// Run [`sweep_once`] and [`sweep_workspaces`] on a fixed interval until the
/// process exits. Intended to be spawned as a background `tokio` task.
pub async fn run(driver: &dyn SandboxDriver, workspace_root: &Path) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Utc::now();

        match sweep_once(driver, now).await {
            Ok(removed) if removed > 0 => info!(removed, "janitor sweep reaped sandboxes"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "janitor sandbox sweep failed"),
        }

        let removed = sweep_workspaces(workspace_root, now);
        if removed > 0 {
            info!(removed, "janitor sweep reaped workspace directories");
        }
    }
}
