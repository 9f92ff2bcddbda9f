use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::NodeConfig;
use pipewright_core::traits::Executor;
use pipewright_core::types::StepContext;

// ── Manual data ─────────────────────────────────────────────────

pub struct ManualDataExecutor;

impl Executor for ManualDataExecutor {
    fn description(&self) -> &str {
        "Emit the configured `data`, or the trigger data when none is set."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            match config.get("data") {
                Some(data) if !data.is_null() => Ok(data.clone()),
                _ => Ok(input),
            }
        })
    }
}

// ── HTTP fetch ──────────────────────────────────────────────────

pub struct HttpFetchExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpFetchSettings {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    response_type: ResponseType,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String { "GET".to_string() }

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ResponseType {
    #[default]
    Json,
    Text,
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .user_agent("Pipewright/0.1")
        .build()
        .map_err(|e| PipewrightError::Http(format!("failed to create HTTP client: {}", e)))
}

/// Issue a request and map transport and status failures to `Http` errors.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let resp = request
        .send()
        .await
        .map_err(|e| PipewrightError::Http(format!("network error: {}", e)))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(PipewrightError::Http(format!("HTTP {}", status.as_u16())));
    }
    Ok(resp)
}

/// Decode a response body as JSON, falling back to the raw text.
pub(crate) async fn read_body(resp: reqwest::Response) -> Result<Value> {
    let text = resp
        .text()
        .await
        .map_err(|e| PipewrightError::Http(format!("network error: {}", e)))?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

impl Executor for HttpFetchExecutor {
    fn description(&self) -> &str {
        "Fetch a URL and emit the decoded response body."
    }

    fn execute(
        &self,
        _input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: HttpFetchSettings = config.parse("http_fetch")?;
            let method = reqwest::Method::from_bytes(settings.method.to_uppercase().as_bytes())
                .map_err(|_| {
                    PipewrightError::invalid_config(
                        "http_fetch",
                        format!("unsupported method: {}", settings.method),
                    )
                })?;

            debug!(url = %settings.url, method = %method, node_id = %ctx.node_id, "Fetching URL");

            let client = http_client()?;
            let mut request = client.request(method, &settings.url);
            for (k, v) in &settings.headers {
                request = request.header(k, v);
            }
            if let Some(body) = &settings.body {
                request = request.json(body);
            }

            let resp = tokio::select! {
                resp = send(request) => resp?,
                _ = ctx.cancel.cancelled() => {
                    return Err(PipewrightError::execution("http_fetch", "request cancelled"));
                }
            };

            let output = match settings.response_type {
                ResponseType::Json => read_body(resp).await?,
                ResponseType::Text => Value::String(resp.text().await.map_err(|e| {
                    PipewrightError::Http(format!("network error: {}", e))
                })?),
            };

            ctx.set_storage(ctx.cache_key(), output.clone());
            Ok(output)
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        match config.get("url").and_then(Value::as_str) {
            Some(url) if reqwest::Url::parse(url).is_ok() => vec![],
            Some(url) => vec![format!("url is not a valid URL: {}", url)],
            None => vec!["url is required".to_string()],
        }
    }
}

// ── Webhook ─────────────────────────────────────────────────────

pub struct WebhookExecutor;

impl Executor for WebhookExecutor {
    fn description(&self) -> &str {
        "Emit the webhook payload carried by the trigger, or `sampleData`."
    }

    fn execute(
        &self,
        _input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            if let Some(data) = ctx.trigger.data.clone() {
                return Ok(data);
            }
            Ok(config.get("sampleData").cloned().unwrap_or(Value::Null))
        })
    }
}

// ── File watch ──────────────────────────────────────────────────

pub struct FileWatchExecutor;

#[derive(Deserialize)]
struct FileWatchSettings {
    path: String,
}

impl Executor for FileWatchExecutor {
    fn description(&self) -> &str {
        "Emit the changed-file payload from the trigger, or read `path` directly."
    }

    fn execute(
        &self,
        _input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            if let Some(data) = ctx.trigger.data.clone() {
                return Ok(data);
            }
            let settings: FileWatchSettings = config.parse("file_watch")?;
            let content = tokio::fs::read_to_string(&settings.path).await?;
            let meta = tokio::fs::metadata(&settings.path).await?;
            let modified_at = meta
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());

            Ok(json!({
                "path": settings.path,
                "content": content,
                "size": meta.len(),
                "modifiedAt": modified_at,
            }))
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        if config.get("path").and_then(Value::as_str).is_none() {
            return vec!["path is required".to_string()];
        }
        vec![]
    }
}
