//! Notification event types for the repair pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the Discord embed color for this severity.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,     // Blue
            Self::Warning => 0x00f3_9c12,  // Orange
            Self::Critical => 0x00e7_4c3c, // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Events that can trigger notifications, emitted by the orchestrator as a
/// failure record moves through the healing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A new failing build was ingested and the pipeline started working it.
    PipelineStarted {
        failure_id: i64,
        repo: String,
        sha: String,
        workflow_name: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The analysis stage produced a low-confidence result and the pipeline
    /// escalated without attempting reproduction.
    LowConfidenceEscalation {
        failure_id: i64,
        repo: String,
        confidence: f64,
        issue_url: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The reproduction stage could not reproduce the reported failure.
    NotReproduced {
        failure_id: i64,
        repo: String,
        sha: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The fix loop exhausted its attempt budget without a passing patch.
    FixLoopExhausted {
        failure_id: i64,
        repo: String,
        attempts: u32,
        issue_url: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A verified fix was proposed as a pull/merge request.
    FixProposed {
        failure_id: i64,
        repo: String,
        pr_url: String,
        attempts: u32,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The pipeline hit an unrecoverable error (transient infrastructure
    /// failure, code-host error, etc.) and the failure was marked `failed`.
    PipelineFailed {
        failure_id: i64,
        repo: String,
        error: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::PipelineStarted { failure_id, .. } => {
                format!("Repair Started: Failure #{failure_id}")
            }
            Self::LowConfidenceEscalation { failure_id, .. } => {
                format!("Escalated (low confidence): Failure #{failure_id}")
            }
            Self::NotReproduced { failure_id, .. } => {
                format!("Not Reproduced: Failure #{failure_id}")
            }
            Self::FixLoopExhausted { failure_id, .. } => {
                format!("Escalated (fix loop exhausted): Failure #{failure_id}")
            }
            Self::FixProposed { failure_id, .. } => {
                format!("Fix Proposed: Failure #{failure_id}")
            }
            Self::PipelineFailed { failure_id, .. } => {
                format!("Pipeline Failed: Failure #{failure_id}")
            }
        }
    }

    /// Get the severity/color for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::PipelineStarted { .. } | Self::FixProposed { .. } => Severity::Info,
            Self::NotReproduced { .. } => Severity::Warning,
            Self::LowConfidenceEscalation { .. }
            | Self::FixLoopExhausted { .. }
            | Self::PipelineFailed { .. } => Severity::Critical,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::PipelineStarted { timestamp, .. }
            | Self::LowConfidenceEscalation { timestamp, .. }
            | Self::NotReproduced { timestamp, .. }
            | Self::FixLoopExhausted { timestamp, .. }
            | Self::FixProposed { timestamp, .. }
            | Self::PipelineFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this event represents something a human needs to act on.
    #[must_use]
    pub const fn needs_human(&self) -> bool {
        matches!(
            self,
            Self::LowConfidenceEscalation { .. } | Self::FixLoopExhausted { .. }
        )
    }
}
