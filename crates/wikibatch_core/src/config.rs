use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::http::HttpTransportConfig;
use crate::session::{RetryPolicy, SessionSettings};

pub const DEFAULT_USER_AGENT: &str = "wikibatch/0.2";
pub const DEFAULT_GROUP_SIZE: usize = 50;
pub const MAX_GROUP_SIZE: usize = 500;
pub const DEFAULT_LIMIT_MAX: usize = 500;
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_CHUNK_ATTEMPTS: usize = 5;
pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_ACTION_ATTEMPTS: usize = 5;
pub const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub tasks: TasksSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ClientSection {
    pub timeout_ms: Option<u64>,
    pub rate_limit_read_ms: Option<u64>,
    pub rate_limit_write_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BatchSection {
    pub group_size: Option<usize>,
    pub limit_max: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct UploadSection {
    pub chunk_size: Option<u64>,
    pub chunk_attempts: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TasksSection {
    pub max_parallel: Option<usize>,
    pub action_attempts: Option<usize>,
    pub rate_limit_backoff_ms: Option<u64>,
}

impl WikiConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        env_trimmed("WIKI_API_URL").or_else(|| self.wiki.api_url.clone())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_trimmed("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn transport_config(&self) -> Result<HttpTransportConfig> {
        let api_url = self
            .api_url()
            .context("no wiki API URL configured (set WIKI_API_URL or [wiki].api_url)")?;
        let client = &self.client;
        Ok(HttpTransportConfig {
            api_url,
            user_agent: self.user_agent(),
            timeout_ms: env_u64("WIKI_HTTP_TIMEOUT_MS").unwrap_or(client.timeout_ms.unwrap_or(30_000)),
            rate_limit_read_ms: env_u64("WIKI_RATE_LIMIT_READ")
                .unwrap_or(client.rate_limit_read_ms.unwrap_or(300)),
            rate_limit_write_ms: env_u64("WIKI_RATE_LIMIT_WRITE")
                .unwrap_or(client.rate_limit_write_ms.unwrap_or(1_000)),
            max_retries: env_u64("WIKI_HTTP_RETRIES")
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(client.max_retries.unwrap_or(2)),
            retry_delay_ms: client.retry_delay_ms.unwrap_or(500),
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        let group_size = self
            .batch
            .group_size
            .unwrap_or(DEFAULT_GROUP_SIZE)
            .clamp(1, MAX_GROUP_SIZE);
        SessionSettings {
            group_size,
            limit_max: self.batch.limit_max.unwrap_or(DEFAULT_LIMIT_MAX).max(1),
            chunk_size: self.upload.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1),
            chunk_attempts: self
                .upload
                .chunk_attempts
                .unwrap_or(DEFAULT_CHUNK_ATTEMPTS)
                .max(1),
            retry: RetryPolicy {
                max_attempts: self
                    .tasks
                    .action_attempts
                    .unwrap_or(DEFAULT_ACTION_ATTEMPTS)
                    .max(1),
                rate_limit_backoff: Duration::from_millis(
                    self.tasks
                        .rate_limit_backoff_ms
                        .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF_MS),
                ),
            },
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.tasks.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL).max(1)
    }
}

/// Bot credentials from WIKI_BOT_USER / WIKI_BOT_PASS, when both are set.
pub fn bot_credentials() -> Option<(String, String)> {
    let username = env_trimmed("WIKI_BOT_USER")?;
    let password = env_trimmed("WIKI_BOT_PASS")?;
    Some((username, password))
}

/// Parse `config_path` as TOML; a missing file yields the defaults.
pub fn load_config(config_path: &Path) -> Result<WikiConfig> {
    if !config_path.exists() {
        return Ok(WikiConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WikiConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_trimmed(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_trimmed(key).and_then(|value| value.parse::<u64>().ok())
}
