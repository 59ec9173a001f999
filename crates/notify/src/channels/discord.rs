//! Discord webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for Discord webhook URL.
const ENV_DISCORD_WEBHOOK_URL: &str = "DISCORD_WEBHOOK_URL";

/// Discord webhook notification channel.
pub struct DiscordChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl DiscordChannel {
    /// Create a new Discord channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_DISCORD_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Discord notifications enabled");
        } else {
            debug!("Discord notifications disabled (DISCORD_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Discord channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    /// Format an event as a Discord webhook payload.
    fn format_payload(event: &NotifyEvent) -> DiscordPayload {
        let embed = DiscordEmbed {
            title: event.title(),
            description: Self::format_description(event),
            color: event.severity().color(),
            timestamp: event.timestamp().to_rfc3339(),
            footer: Some(DiscordFooter {
                text: "mender".to_string(),
            }),
            fields: Self::format_fields(event),
        };

        DiscordPayload {
            embeds: vec![embed],
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
    fn format_fields(event: &NotifyEvent) -> Vec<DiscordField> {
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
                DiscordField::inline("Failure ID", failure_id.to_string()),
                DiscordField::inline("Repository", repo),
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
                DiscordField::inline("Failure ID", failure_id.to_string()),
                DiscordField::inline("Repository", repo),
                DiscordField::inline("Issue", issue_url),
            ],

            NotifyEvent::FixProposed {
                failure_id,
                repo,
                pr_url,
                ..
            } => vec![
                DiscordField::inline("Failure ID", failure_id.to_string()),
                DiscordField::inline("Repository", repo),
                DiscordField::inline("Pull Request", pr_url),
            ],
        }
    }
}

#[async_trait]
impl NotifyChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured("DISCORD_WEBHOOK_URL".to_string()))?;

        let payload = Self::format_payload(event);

        debug!(channel = "discord", event_type = ?event.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "discord", "Notification sent successfully");
            Ok(())
        } else if response.status() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);

            warn!(
                channel = "discord",
                retry_after_secs = retry_after,
                "Rate limited by Discord"
            );

            Err(ChannelError::RateLimited {
                retry_after_secs: retry_after,
            })
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            warn!(
                channel = "discord",
                status = %status,
                body = %body,
                "Discord webhook request failed"
            );

            Err(ChannelError::Other(format!(
                "Discord returned {status}: {body}"
            )))
        }
    }
}

// =============================================================================
// Discord API types
// =============================================================================

#[derive(Debug, Serialize)]
struct DiscordPayload {
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<DiscordFooter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<DiscordField>,
}

#[derive(Debug, Serialize)]
struct DiscordFooter {
    text: String,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

impl DiscordField {
    fn inline(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline: true,
        }
    }
}
