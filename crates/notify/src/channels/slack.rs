//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::{NotifyEvent, Severity};
use crate::NotifyChannel;

/// Environment variable for Slack webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a new Slack channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_SLACK_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Slack notifications enabled");
        } else {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    /// Format an event as a Slack webhook payload.
    fn format_payload(event: &NotifyEvent) -> SlackPayload {
        let color = match event.severity() {
            Severity::Info => "#3498db",     // Blue
            Severity::Warning => "#f39c12",  // Orange
            Severity::Critical => "#e74c3c", // Red
        };

        let fields = Self::format_fields(event)
            .into_iter()
            .map(|(title, value)| SlackField {
                title,
                value,
                short: true,
            })
            .collect();

        let attachment = SlackAttachment {
            fallback: event.title(),
            color: color.to_string(),
            pretext: if event.needs_human() {
                Some("Needs human review".to_string())
            } else {
                None
            },
            author_name: Some("mender".to_string()),
            title: event.title(),
            text: Self::format_description(event),
            fields,
            footer: Some(format!(
                "{} | {}",
                event.severity().as_str(),
                event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(event.timestamp().timestamp()),
        };

        SlackPayload {
            attachments: vec![attachment],
        }
    }

    /// Format the description for an event.
    fn format_description(event: &NotifyEvent) -> String {
        match event {
            NotifyEvent::PipelineStarted {
                repo, workflow_name, ..
            } => {
                format!("Working a failing build from `{workflow_name}` on `{repo}`")
            }

            NotifyEvent::LowConfidenceEscalation { repo, confidence, .. } => {
                format!(
                    "Analysis confidence ({confidence:.2}) on `{repo}` was below the \
                     reproduction gate — escalated without attempting a fix"
                )
            }

            NotifyEvent::NotReproduced { repo, sha, .. } => {
                format!("Could not reproduce the reported failure on `{repo}` at `{sha}`")
            }

            NotifyEvent::FixLoopExhausted { repo, attempts, .. } => {
                format!("Exhausted {attempts} fix attempts on `{repo}` without a passing patch")
            }

            NotifyEvent::FixProposed {
                repo,
                pr_url,
                attempts,
                ..
            } => {
                format!("Opened {pr_url} on `{repo}` after {attempts} attempt(s)")
            }

            NotifyEvent::PipelineFailed { repo, error, .. } => {
                format!("Pipeline error on `{repo}`: {error}")
            }
        }
    }

    /// Format additional fields for an event.
    fn format_fields(event: &NotifyEvent) -> Vec<(String, String)> {
        match event {
            NotifyEvent::PipelineStarted {
                failure_id, repo, ..
            }
            | NotifyEvent::NotReproduced {
                failure_id, repo, ..
            }
            | NotifyEvent::PipelineFailed {
                failure_id, repo, ..
            } => vec![
                ("Failure ID".to_string(), failure_id.to_string()),
                ("Repository".to_string(), repo.clone()),
            ],

            NotifyEvent::LowConfidenceEscalation {
                failure_id,
                repo,
                issue_url,
                ..
            }
            | NotifyEvent::FixLoopExhausted {
                failure_id,
                repo,
                issue_url,
                ..
            } => vec![
                ("Failure ID".to_string(), failure_id.to_string()),
                ("Repository".to_string(), repo.clone()),
                ("Issue".to_string(), issue_url.clone()),
            ],

            NotifyEvent::FixProposed {
                failure_id,
                repo,
                pr_url,
                ..
            } => vec![
                ("Failure ID".to_string(), failure_id.to_string()),
                ("Repository".to_string(), repo.clone()),
                ("Pull Request".to_string(), pr_url.clone()),
            ],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured("SLACK_WEBHOOK_URL".to_string()))?;

        let payload = Self::format_payload(event);

        debug!(channel = "slack", event_type = ?event.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "slack", "Notification sent successfully");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            warn!(
                channel = "slack",
                status = %status,
                body = %body,
                "Slack webhook request failed"
            );

            Err(ChannelError::Other(format!(
                "Slack returned {status}: {body}"
            )))
        }
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pretext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn escalations_carry_a_needs_human_pretext() {
        let event = NotifyEvent::LowConfidenceEscalation {
            failure_id: 3,
            repo: "acme/widgets".to_string(),
            confidence: 0.1,
            issue_url: "https://example.test/issues/3".to_string(),
            timestamp: Utc::now(),
        };
        let payload = SlackChannel::format_payload(&event);
        assert_eq!(
            payload.attachments[0].pretext.as_deref(),
            Some("Needs human review")
        );
    }

    #[test]
    fn fix_proposed_has_no_pretext() {
        let event = NotifyEvent::FixProposed {
            failure_id: 3,
            repo: "acme/widgets".to_string(),
            pr_url: "https://example.test/pull/3".to_string(),
            attempts: 1,
            timestamp: Utc::now(),
        };
        let payload = SlackChannel::format_payload(&event);
        assert!(payload.attachments[0].pretext.is_none());
    }
}
