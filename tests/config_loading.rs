use std::io::Write;

use pipewright_core::config::AppConfig;
use pipewright_test_utils::config_from_toml;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
default_timeout_ms = 5000
default_max_retries = 1
retry_base_delay_ms = 250
workspace = "/tmp/pipewright-test"

[store]
path = "data/pw.db"

[log]
log_dir = "/var/log/pipewright"
level = 3

[ai]
base_url = "http://localhost:11434/v1"
api_key = "sk-test-key"
model = "llama3"

[notifications]
file = "notifications.log"

[[schedules]]
name = "nightly"
pipeline_id = "etl"
schedule = "0 0 2 * * *"
data = { source = "cron" }
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.default_timeout_ms, 5000);
    assert_eq!(config.engine.default_max_retries, 1);
    assert_eq!(config.engine.retry_base_delay_ms, 250);
    assert_eq!(
        config.store_path().unwrap(),
        std::path::PathBuf::from("/tmp/pipewright-test/data/pw.db")
    );

    let log = config.log.as_ref().unwrap();
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(config.log_dir(), std::path::PathBuf::from("/var/log/pipewright"));

    let ai = config.ai.as_ref().unwrap();
    assert_eq!(ai.model, "llama3");
    assert_eq!(ai.api_key.as_deref(), Some("sk-test-key"));
    assert_eq!(ai.max_tokens, 1024);

    assert_eq!(
        config.notification_file().unwrap(),
        std::path::PathBuf::from("/tmp/pipewright-test/notifications.log")
    );

    assert_eq!(config.schedules.len(), 1);
    assert_eq!(config.schedules[0].pipeline_id, "etl");
    assert_eq!(
        config.schedules[0].data,
        Some(serde_json::json!({"source": "cron"}))
    );
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = config_from_toml("");
    assert_eq!(config.engine.default_timeout_ms, 30_000);
    assert_eq!(config.engine.default_max_retries, 3);
    assert_eq!(config.engine.retry_base_delay_ms, 1_000);
    assert!(config.log.is_none());
    assert!(config.ai.is_none());
    assert!(config.schedules.is_empty());
    assert!(config.store_path().unwrap().ends_with("pipewright.db"));
}

#[test]
fn test_memory_store_and_default_log_dir() {
    let config = config_from_toml(
        r#"
[engine]
workspace = "/srv/pw"

[store]
path = ":memory:"

[log]
"#,
    );
    assert!(config.store_path().is_none());
    assert_eq!(config.log_dir(), std::path::PathBuf::from("/srv/pw/logs"));
    assert_eq!(config.log.unwrap().level, 2);
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("PIPEWRIGHT_TEST_AI_KEY", "sk-from-env");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[ai]\napi_key = \"${PIPEWRIGHT_TEST_AI_KEY}\"\n")
        .expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.ai.unwrap().api_key.as_deref(), Some("sk-from-env"));
}

#[test]
fn test_missing_file() {
    let err = AppConfig::load(std::path::Path::new("/definitely/not/here.toml")).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));

    let config = AppConfig::load_or_default(std::path::Path::new("/definitely/not/here.toml"))
        .expect("defaults");
    assert_eq!(config.engine.default_max_retries, 3);
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\n").expect("write toml");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(err.to_string().starts_with("Config error"));
}
