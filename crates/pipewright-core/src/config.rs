use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipewrightError, Result};

/// Top-level Pipewright configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub ai: Option<AiConfig>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-node timeout when a node sets no `timeout` of its own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Retry budget when a node sets no `maxRetries` of its own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Backoff before retry k is `retry_base_delay_ms * 2^(k-1)`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            default_max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            workspace: default_workspace(),
        }
    }
}

fn default_timeout_ms() -> u64 { 30_000 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 1_000 }
fn default_workspace() -> String { "~/.pipewright".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file, relative to the workspace. ":memory:" keeps nothing.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "pipewright.db".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-node, 3 = node inputs (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// OpenAI-compatible text generation endpoint for `ai_transform`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default = "default_ai_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
}

fn default_ai_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_ai_model() -> String { "gpt-4o-mini".to_string() }
fn default_ai_max_tokens() -> u32 { 1024 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Append notifications to this file (relative to the workspace).
    #[serde(default)]
    pub file: Option<String>,
}

/// A pipeline started on a cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub pipeline_id: String,
    pub schedule: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PipewrightError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| PipewrightError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.engine.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// SQLite path, or `None` for an in-memory store.
    pub fn store_path(&self) -> Option<PathBuf> {
        if self.store.path == ":memory:" {
            return None;
        }
        Some(self.resolve(&self.store.path))
    }

    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(dir) => self.resolve(dir),
            None => self.workspace_dir().join("logs"),
        }
    }

    pub fn notification_file(&self) -> Option<PathBuf> {
        self.notifications.file.as_deref().map(|f| self.resolve(f))
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.workspace_dir().join(p)
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_PIPEWRIGHT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_PIPEWRIGHT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_PIPEWRIGHT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_PIPEWRIGHT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_PIPEWRIGHT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.default_timeout_ms, 30_000);
        assert_eq!(config.engine.default_max_retries, 3);
        assert_eq!(config.engine.retry_base_delay_ms, 1_000);
        assert_eq!(config.store.path, "pipewright.db");
        assert!(config.log.is_none());
        assert!(config.ai.is_none());
        assert!(config.schedules.is_empty());
    }

    #[test]
    fn test_paths_resolve_against_workspace() {
        let toml_str = r#"
[engine]
workspace = "/srv/pw"

[store]
path = "data/pw.db"

[log]
level = 3

[notifications]
file = "/var/log/pw-notify.log"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store_path(), Some(PathBuf::from("/srv/pw/data/pw.db")));
        assert_eq!(config.log_dir(), PathBuf::from("/srv/pw/logs"));
        assert_eq!(
            config.notification_file(),
            Some(PathBuf::from("/var/log/pw-notify.log"))
        );
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 3);
    }

    #[test]
    fn test_in_memory_store_path() {
        let config: AppConfig = toml::from_str("[store]\npath = \":memory:\"").unwrap();
        assert_eq!(config.store_path(), None);
    }

    #[test]
    fn test_schedules_parse() {
        let toml_str = r#"
[[schedules]]
name = "nightly"
pipeline_id = "etl"
schedule = "0 0 2 * * *"
data = { source = "cron" }
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].pipeline_id, "etl");
        assert_eq!(
            config.schedules[0].data,
            Some(serde_json::json!({"source": "cron"}))
        );
    }
}
