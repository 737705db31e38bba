use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use shared::domain::BackendEnv;
use tracing::warn;

use crate::backend::ClientOptions;

pub const DEFAULT_CONFIG_FILE: &str = "sync.toml";
const ENV_PREFIX: &str = "SYNC__";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub message_poll_interval: Duration,
    pub conversation_poll_interval: Duration,
    pub init_timeout: Duration,
    pub attempt_budget: u32,
    /// Page size used to build conversation previews.
    pub conversation_preview_limit: usize,
    /// Page size fetched per conversation on every message poll.
    pub message_poll_limit: usize,
    pub follow_up_sync_delay: Duration,
    pub deferred_reconcile_delay: Duration,
    /// `None` keeps every delivered id for the whole session.
    pub dedup_retention: Option<Duration>,
    pub event_capacity: usize,
    pub client: ClientOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_poll_interval: Duration::from_secs(3),
            conversation_poll_interval: Duration::from_secs(10),
            init_timeout: Duration::from_secs(60),
            attempt_budget: 3,
            conversation_preview_limit: 5,
            message_poll_limit: 20,
            follow_up_sync_delay: Duration::from_secs(1),
            deferred_reconcile_delay: Duration::from_secs(1),
            dedup_retention: None,
            event_capacity: 1024,
            client: ClientOptions::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    message_poll_ms: Option<u64>,
    conversation_poll_ms: Option<u64>,
    init_timeout_ms: Option<u64>,
    attempt_budget: Option<u32>,
    conversation_preview_limit: Option<usize>,
    message_poll_limit: Option<usize>,
    follow_up_sync_ms: Option<u64>,
    deferred_reconcile_ms: Option<u64>,
    dedup_retention_ms: Option<u64>,
    event_capacity: Option<usize>,
    env: Option<String>,
    db_path: Option<PathBuf>,
    app_version: Option<String>,
}

/// Defaults, then `sync.toml` in the working directory, then `SYNC__*` env vars.
pub fn load_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    if let Err(err) = config.apply_file_if_present(Path::new(DEFAULT_CONFIG_FILE)) {
        warn!(error = %format!("{err:#}"), "config: ignoring unreadable config file");
    }
    config.apply_env(std::env::vars());
    config
}

impl SyncConfig {
    pub fn apply_file_if_present(&mut self, path: &Path) -> anyhow::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        self.apply_toml(&raw)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))
    }

    pub fn apply_toml(&mut self, raw: &str) -> anyhow::Result<()> {
        let file: FileConfig = toml::from_str(raw)?;
        if let Some(v) = file.message_poll_ms {
            self.message_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.conversation_poll_ms {
            self.conversation_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.init_timeout_ms {
            self.init_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.attempt_budget {
            self.attempt_budget = v;
        }
        if let Some(v) = file.conversation_preview_limit {
            self.conversation_preview_limit = v;
        }
        if let Some(v) = file.message_poll_limit {
            self.message_poll_limit = v;
        }
        if let Some(v) = file.follow_up_sync_ms {
            self.follow_up_sync_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.deferred_reconcile_ms {
            self.deferred_reconcile_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.dedup_retention_ms {
            self.dedup_retention = Some(Duration::from_millis(v));
        }
        if let Some(v) = file.event_capacity {
            self.event_capacity = v;
        }
        if let Some(v) = file.env {
            match BackendEnv::parse(&v) {
                Some(env) => self.client.env = env,
                None => warn!(value = %v, "config: unknown env in config file"),
            }
        }
        if let Some(v) = file.db_path {
            self.client.db_path = Some(v);
        }
        if let Some(v) = file.app_version {
            self.client.app_version = Some(v);
        }
        self.clamp();
        Ok(())
    }

    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let applied = match name {
                "MESSAGE_POLL_MS" => parse_millis(&value).map(|d| self.message_poll_interval = d),
                "CONVERSATION_POLL_MS" => {
                    parse_millis(&value).map(|d| self.conversation_poll_interval = d)
                }
                "INIT_TIMEOUT_MS" => parse_millis(&value).map(|d| self.init_timeout = d),
                "ATTEMPT_BUDGET" => value.parse().ok().map(|v| self.attempt_budget = v),
                "MESSAGE_POLL_LIMIT" => value.parse().ok().map(|v| self.message_poll_limit = v),
                "CONVERSATION_PREVIEW_LIMIT" => value
                    .parse()
                    .ok()
                    .map(|v| self.conversation_preview_limit = v),
                "FOLLOW_UP_SYNC_MS" => parse_millis(&value).map(|d| self.follow_up_sync_delay = d),
                "DEFERRED_RECONCILE_MS" => {
                    parse_millis(&value).map(|d| self.deferred_reconcile_delay = d)
                }
                "EVENT_CAPACITY" => value.trim().parse().ok().map(|v| self.event_capacity = v),
                "DEDUP_RETENTION_MS" => {
                    parse_millis(&value).map(|d| self.dedup_retention = Some(d))
                }
                "ENV" => BackendEnv::parse(&value).map(|env| self.client.env = env),
                "DB_PATH" => {
                    self.client.db_path = Some(PathBuf::from(&value));
                    Some(())
                }
                "APP_VERSION" => {
                    self.client.app_version = Some(value.clone());
                    Some(())
                }
                _ => None,
            };
            if applied.is_none() {
                warn!(key = %key, value = %value, "config: ignoring invalid override");
            }
        }
        self.clamp();
    }

    // A zero interval would make tokio's interval panic; a zero page would never
    // observe anything.
    fn clamp(&mut self) {
        let min = Duration::from_millis(10);
        self.message_poll_interval = self.message_poll_interval.max(min);
        self.conversation_poll_interval = self.conversation_poll_interval.max(min);
        self.conversation_preview_limit = self.conversation_preview_limit.max(1);
        self.message_poll_limit = self.message_poll_limit.max(1);
        self.event_capacity = self.event_capacity.max(1);
    }
}

fn parse_millis(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_millis)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
