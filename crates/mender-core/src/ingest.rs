//! Ingestion entry point (§6) — the transport-agnostic boundary an HTTP
//! handler, a queue consumer, or a CLI replay tool can all call into. Owns
//! the active-run registry that implements the cancel-and-restart
//! re-ingestion policy (§9): a replay of the same `(repo, run_id)` aborts
//! whatever pipeline task is already running for that key before spawning
//! the new one.

use crate::pipeline::{run_pipeline, PipelineContext};
use crate::store::{NewFailure, Store, StoreError};
use crate::webhook::IngestEvent;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Alias kept distinct from [`IngestEvent`] at the call site so transports
/// depend on the ingestion vocabulary rather than the webhook wire shape.
pub type IngestionEvent = IngestEvent;

/// What happened to one ingested event, once ingestion itself (as opposed
/// to the pipeline it may have kicked off) has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionOutcome {
    /// The failure was persisted and a pipeline run was spawned for it.
    Ingested { failure_id: i64 },
    /// The event was dropped at the door without touching the store.
    Ignored { reason: String },
}

#[derive(Clone, Eq, PartialEq, Hash)]
struct RunKey {
    repo: String,
    run_id: u64,
}

/// Tracks the in-flight pipeline task per `(repo, run_id)`. Never held
/// across an `.await` on pipeline I/O — only guards the map itself.
#[derive(Clone, Default)]
pub struct ActiveRunRegistry {
    inner: Arc<Mutex<HashMap<RunKey, CancellationToken>>>,
}

impl ActiveRunRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever task currently owns `key`, if any, and register a
    /// fresh token for the run about to be spawned.
    async fn supersede(&self, key: RunKey) -> CancellationToken {
        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.remove(&key) {
            previous.cancel();
        }
        let token = CancellationToken::new();
        guard.insert(key, token.clone());
        token
    }

    #[must_use]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Verify the event is worth tracking, upsert its failure record, and
/// (re)spawn a pipeline run in its own `tokio` task. Returns as soon as the
/// failure is durably recorded — the pipeline itself keeps running after
/// this function returns.
pub async fn ingest_event(
    ctx: Arc<PipelineContext>,
    registry: &ActiveRunRegistry,
    workspace_root: &Path,
    event: IngestionEvent,
) -> Result<IngestionOutcome, StoreError> {
    if !event.is_failure() {
        return Ok(IngestionOutcome::Ignored {
            reason: format!(
                "action was {:?} and conclusion was {:?}, not a completed failure",
                event.action, event.conclusion
            ),
        });
    }

    let failure = ctx
        .store
        .upsert_failure(NewFailure {
            run_id: event.run_id,
            repo: event.repo.clone(),
            sha: event.sha.clone(),
            branch: event.branch.clone(),
            workflow_name: event.workflow_name.clone(),
        })
        .await?;

    let key = RunKey {
        repo: failure.repo.clone(),
        run_id: event.run_id,
    };
    let cancel = registry.supersede(key).await;
    let workspace_dir: PathBuf = workspace_root.join(format!("{}-{}", failure.id, failure.run_id));

    info!(failure_id = failure.id, repo = %failure.repo, run_id = failure.run_id, "ingested failure, spawning pipeline");

    tokio::spawn(async move {
        match run_pipeline(&ctx, failure.id, &workspace_dir, cancel).await {
            Ok(outcome) => info!(failure_id = failure.id, ?outcome, "pipeline finished"),
            Err(e) => warn!(failure_id = failure.id, error = %e, "pipeline ended in error"),
        }
    });

    Ok(IngestionOutcome::Ingested {
        failure_id: failure.id,
    })
}
