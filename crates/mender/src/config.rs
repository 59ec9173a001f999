//! Process configuration (§6) — loaded once at startup from environment
//! variables, with `dotenvy` pulling in a local `.env` file the same way
//! the `OpenIntentOS` CLI does for its own process config. Missing
//! required values are a startup error, never a silent default
//! substitution for secrets.

use anyhow::{Context, Result};

pub struct AppConfig {
    pub database_url: String,
    pub sandbox_image: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_api_key: String,
    pub github_token: String,
    pub webhook_secret: String,
    pub listen_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: required("MENDER_DATABASE_URL")?,
            sandbox_image: optional("MENDER_SANDBOX_IMAGE", "mender-sandbox:latest"),
            llm_base_url: required("MENDER_LLM_BASE_URL")?,
            llm_model: required("MENDER_LLM_MODEL")?,
            llm_api_key: required("MENDER_LLM_API_KEY")?,
            github_token: required("MENDER_GITHUB_TOKEN")?,
            webhook_secret: required("MENDER_WEBHOOK_SECRET")?,
            listen_addr: optional("MENDER_LISTEN_ADDR", "0.0.0.0:8080"),
        };
        Ok(config)
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
