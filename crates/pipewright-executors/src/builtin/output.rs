use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::info;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::NodeConfig;
use pipewright_core::traits::Executor;
use pipewright_core::types::StepContext;

use super::text::{to_csv, to_text};
use super::util::{display, render_template, rows};

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
enum FileFormat {
    #[default]
    Json,
    Csv,
    Text,
}

// ── Download ────────────────────────────────────────────────────

pub struct DownloadExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadSettings {
    #[serde(default = "default_directory")]
    directory: String,
    #[serde(default = "default_filename")]
    filename: String,
    #[serde(default)]
    format: FileFormat,
}

fn default_directory() -> String { ".".to_string() }
fn default_filename() -> String { "output".to_string() }

impl FileFormat {
    fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Text => "txt",
        }
    }

    fn render(&self, input: &Value) -> Result<String> {
        match self {
            Self::Json => Ok(serde_json::to_string_pretty(input)?),
            Self::Csv => match input {
                Value::String(s) => Ok(s.clone()),
                other => to_csv(&rows("download", other.clone())?),
            },
            Self::Text => Ok(to_text(input)),
        }
    }
}

impl Executor for DownloadExecutor {
    fn description(&self) -> &str {
        "Write the input to a file as JSON, CSV or text."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: DownloadSettings = config.parse("download")?;
            let mut filename = render_template(&settings.filename, &Value::Null, Some(&ctx));
            if filename.trim().is_empty() || filename.contains('/') || filename.contains("..") {
                return Err(PipewrightError::invalid_config(
                    "download",
                    format!("invalid filename: {:?}", filename),
                ));
            }
            if !filename.contains('.') {
                filename = format!("{}.{}", filename, settings.format.extension());
            }

            let dir = PathBuf::from(&settings.directory);
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(&filename);
            let content = settings.format.render(&input)?;
            tokio::fs::write(&path, content.as_bytes()).await?;

            info!(node_id = %ctx.node_id, path = %path.display(), bytes = content.len(), "Wrote output file");
            Ok(json!({
                "path": path.display().to_string(),
                "bytes": content.len(),
                "format": settings.format.extension(),
            }))
        })
    }
}

// ── File append ─────────────────────────────────────────────────

pub struct FileAppendExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileAppendSettings {
    path: String,
    #[serde(default)]
    format: AppendFormat,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum AppendFormat {
    #[default]
    Jsonl,
    Text,
}

impl Executor for FileAppendExecutor {
    fn description(&self) -> &str {
        "Append rows to a file as JSON lines or plain text."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: FileAppendSettings = config.parse("file_append")?;
            let lines: Vec<Value> = match input {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };

            let mut buf = String::new();
            for line in &lines {
                match settings.format {
                    AppendFormat::Jsonl => buf.push_str(&serde_json::to_string(line)?),
                    AppendFormat::Text => buf.push_str(&display(line)),
                }
                buf.push('\n');
            }

            let path = PathBuf::from(&settings.path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(buf.as_bytes()).await?;
            file.flush().await?;

            info!(node_id = %ctx.node_id, path = %settings.path, lines = lines.len(), "Appended rows");
            Ok(json!({ "path": settings.path, "linesWritten": lines.len() }))
        })
    }
}

// ── Email ───────────────────────────────────────────────────────

pub struct EmailExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailSettings {
    to: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
}

impl Executor for EmailExecutor {
    fn description(&self) -> &str {
        "Compose an email (recipient, subject, body, mailto link) from templates."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: EmailSettings = config.parse("email")?;
            let to = render_template(&settings.to, &input, Some(&ctx));
            if to.trim().is_empty() {
                return Err(PipewrightError::invalid_config("email", "recipient is empty"));
            }
            let subject = render_template(&settings.subject, &input, Some(&ctx));
            let body = if settings.body.is_empty() {
                to_text(&input)
            } else {
                render_template(&settings.body, &input, Some(&ctx))
            };

            let mailto = format!(
                "mailto:{}?subject={}&body={}",
                to,
                urlencoding::encode(&subject),
                urlencoding::encode(&body)
            );
            Ok(json!({ "to": to, "subject": subject, "body": body, "mailto": mailto }))
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        match config.get("to").and_then(Value::as_str) {
            Some(to) if to.contains('@') || to.contains("{{") => vec![],
            _ => vec!["to must be an email address".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_test_utils::step_ctx;

    async fn run(executor: &dyn Executor, input: Value, config: Value) -> Result<Value> {
        executor
            .execute(input, NodeConfig::from(config), step_ctx("out"))
            .await
    }

    #[tokio::test]
    async fn test_download_csv() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(
            &DownloadExecutor,
            json!([{"a": 1}, {"a": 2}]),
            json!({"directory": dir.path().to_str().unwrap(), "filename": "report", "format": "csv"}),
        )
        .await
        .unwrap();
        let path = dir.path().join("report.csv");
        assert_eq!(out["path"], json!(path.display().to_string()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a\n1\n2\n");
    }

    #[tokio::test]
    async fn test_download_rejects_traversal() {
        let err = run(&DownloadExecutor, json!({}), json!({"filename": "../escape.json"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipewrightError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_file_append_accumulates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/out.jsonl");
        let config = json!({"path": path.to_str().unwrap()});

        run(&FileAppendExecutor, json!([{"n": 1}, {"n": 2}]), config.clone())
            .await
            .unwrap();
        let out = run(&FileAppendExecutor, json!({"n": 3}), config).await.unwrap();
        assert_eq!(out["linesWritten"], json!(1));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n");
    }

    #[tokio::test]
    async fn test_email_composes_mailto() {
        let out = run(
            &EmailExecutor,
            json!({"name": "Ada", "count": 3}),
            json!({
                "to": "ops@example.com",
                "subject": "Report for {{name}}",
                "body": "{{count}} items & more"
            }),
        )
        .await
        .unwrap();
        assert_eq!(out["subject"], json!("Report for Ada"));
        assert_eq!(
            out["mailto"],
            json!("mailto:ops@example.com?subject=Report%20for%20Ada&body=3%20items%20%26%20more")
        );
    }

    #[test]
    fn test_email_validate() {
        assert!(EmailExecutor
            .validate(&NodeConfig::from(json!({"to": "a@b.c"})))
            .is_empty());
        assert_eq!(EmailExecutor.validate(&NodeConfig::default()).len(), 1);
    }
}
