use std::process::Stdio;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::NodeConfig;
use pipewright_core::traits::Executor;
use pipewright_core::types::StepContext;

pub struct CodeExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeSettings {
    command: String,
    /// Advisory only; commands always run on the host.
    #[serde(default)]
    sandboxed: bool,
    #[serde(default)]
    working_dir: Option<String>,
}

const MAX_STDERR: usize = 2_000;

impl Executor for CodeExecutor {
    fn description(&self) -> &str {
        "Run a shell command with the input as JSON on stdin; stdout becomes the output."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: CodeSettings = config.parse("code")?;
            if settings.sandboxed {
                warn!(node_id = %ctx.node_id, "sandboxed flag is advisory; running on host");
            }
            debug!(node_id = %ctx.node_id, command = %settings.command, "Executing code step");

            let mut command = tokio::process::Command::new("sh");
            command
                .arg("-c")
                .arg(&settings.command)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .env("PIPEWRIGHT_NODE_ID", &ctx.node_id)
                .env("PIPEWRIGHT_EXECUTION_ID", ctx.execution_id.to_string())
                .kill_on_drop(true);
            if let Some(dir) = &settings.working_dir {
                command.current_dir(dir);
            }

            let mut child = command
                .spawn()
                .map_err(|e| PipewrightError::execution("code", format!("failed to spawn: {}", e)))?;

            let payload = serde_json::to_vec(&input)?;
            if let Some(mut stdin) = child.stdin.take() {
                // A command that ignores stdin may close it early.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "stdin closed before input was written");
                }
            }

            let output = tokio::select! {
                output = child.wait_with_output() => output?,
                _ = ctx.cancel.cancelled() => {
                    return Err(PipewrightError::execution("code", "command cancelled"));
                }
            };

            if !output.status.success() {
                let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if stderr.len() > MAX_STDERR {
                    let mut cut = MAX_STDERR;
                    while !stderr.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    stderr.truncate(cut);
                }
                let code = output.status.code().unwrap_or(-1);
                return Err(PipewrightError::execution(
                    "code",
                    format!("exit code {}: {}", code, stderr),
                ));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let trimmed = stdout.trim();
            if trimmed.is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        match config.get("command").and_then(Value::as_str) {
            Some(c) if !c.trim().is_empty() => vec![],
            _ => vec!["command is required".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_test_utils::step_ctx;
    use serde_json::json;
    use std::time::Duration;

    async fn run(input: Value, config: Value) -> Result<Value> {
        CodeExecutor
            .execute(input, NodeConfig::from(config), step_ctx("code"))
            .await
    }

    #[tokio::test]
    async fn test_stdin_json_to_stdout_json() {
        let out = run(json!({"n": 1}), json!({"command": "cat"})).await.unwrap();
        assert_eq!(out, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_text_output_and_empty() {
        let out = run(Value::Null, json!({"command": "echo hello"})).await.unwrap();
        assert_eq!(out, json!("hello"));

        let out = run(Value::Null, json!({"command": "true"})).await.unwrap();
        assert_eq!(out, Value::Null);
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let err = run(Value::Null, json!({"command": "echo bad >&2; exit 3"}))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("bad"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let ctx = step_ctx("code");
        let cancel = ctx.cancel.clone();
        let handle = tokio::spawn(async move {
            CodeExecutor
                .execute(Value::Null, NodeConfig::from(json!({"command": "sleep 30"})), ctx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_validate_requires_command() {
        assert_eq!(CodeExecutor.validate(&NodeConfig::default()).len(), 1);
    }
}
