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

use super::input::{http_client, read_body, send};
use super::util::{display, evaluate_all, get_path, render_template, rows, set_path, Condition, Logic};

// ── Lookup ──────────────────────────────────────────────────────

pub struct LookupExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupSettings {
    key_field: String,
    #[serde(default = "default_lookup_field")]
    output_field: String,
    /// Object keyed by lookup value, or an array of records matched on `tableKey`.
    #[serde(default)]
    table: Option<Value>,
    #[serde(default)]
    table_key: Option<String>,
    /// Per-row URL template fetched instead of a static table.
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    default: Value,
}

fn default_lookup_field() -> String { "lookup".to_string() }

impl LookupSettings {
    fn from_table(&self, key: &str) -> Option<Value> {
        match self.table.as_ref()? {
            Value::Object(map) => map.get(key).cloned(),
            Value::Array(records) => {
                let table_key = self.table_key.as_deref().unwrap_or(&self.key_field);
                records
                    .iter()
                    .find(|r| get_path(r, table_key).map(display).as_deref() == Some(key))
                    .cloned()
            }
            _ => None,
        }
    }
}

impl Executor for LookupExecutor {
    fn description(&self) -> &str {
        "Enrich each row from a static table or a per-row HTTP lookup."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: LookupSettings = config.parse("lookup")?;
            if settings.table.is_none() && settings.url.is_none() {
                return Err(PipewrightError::invalid_config(
                    "lookup",
                    "either table or url is required",
                ));
            }
            let single = input.is_object();
            let client = match settings.url {
                Some(_) => Some(http_client()?),
                None => None,
            };

            let mut out = Vec::new();
            for mut row in rows("lookup", input)? {
                let key = get_path(&row, &settings.key_field).map(display).unwrap_or_default();
                let found = match (&settings.url, &client) {
                    (Some(template), Some(client)) => {
                        let url = render_template(template, &row, Some(&ctx));
                        debug!(url = %url, node_id = %ctx.node_id, "Lookup request");
                        Some(read_body(send(client.get(&url)).await?).await?)
                    }
                    _ => settings.from_table(&key),
                };
                set_path(
                    &mut row,
                    &settings.output_field,
                    found.unwrap_or_else(|| settings.default.clone()),
                );
                out.push(row);
            }

            if single {
                if let Some(row) = out.pop() {
                    return Ok(row);
                }
            }
            Ok(Value::Array(out))
        })
    }
}

// ── Retry until ─────────────────────────────────────────────────

pub struct RetryUntilExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryUntilSettings {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    logic: Logic,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

fn default_max_attempts() -> u32 { 5 }
fn default_interval_ms() -> u64 { 1_000 }

impl Executor for RetryUntilExecutor {
    fn description(&self) -> &str {
        "Poll a URL (or re-check the input) until a condition holds."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: RetryUntilSettings = config.parse("retry_until")?;
            let mut conditions = settings.conditions.clone();
            conditions.extend(settings.condition.clone());
            if conditions.is_empty() {
                return Err(PipewrightError::invalid_config(
                    "retry_until",
                    "a condition is required",
                ));
            }
            let client = match settings.url {
                Some(_) => Some(http_client()?),
                None => None,
            };

            for attempt in 1..=settings.max_attempts.max(1) {
                let value = match (&settings.url, &client) {
                    (Some(url), Some(client)) => {
                        let url = render_template(url, &input, Some(&ctx));
                        read_body(send(client.get(&url)).await?).await?
                    }
                    _ => input.clone(),
                };
                if evaluate_all(&conditions, settings.logic, &value) {
                    debug!(node_id = %ctx.node_id, attempt, "Condition met");
                    return Ok(value);
                }
                if attempt < settings.max_attempts {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(settings.interval_ms)) => {}
                        _ = ctx.cancel.cancelled() => {
                            return Err(PipewrightError::execution("retry_until", "polling cancelled"));
                        }
                    }
                }
            }

            Err(PipewrightError::execution(
                "retry_until",
                format!("condition not met after {} attempts", settings.max_attempts.max(1)),
            ))
        })
    }
}

// ── HTTP post ───────────────────────────────────────────────────

pub struct HttpPostExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpPostSettings {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl Executor for HttpPostExecutor {
    fn description(&self) -> &str {
        "POST the input as JSON and emit the response status and body."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: HttpPostSettings = config.parse("http_post")?;
            let client = http_client()?;
            let mut request = client.post(&settings.url).json(&input);
            for (k, v) in &settings.headers {
                request = request.header(k, v);
            }

            debug!(url = %settings.url, node_id = %ctx.node_id, "Posting data");
            let resp = tokio::select! {
                resp = send(request) => resp?,
                _ = ctx.cancel.cancelled() => {
                    return Err(PipewrightError::execution("http_post", "request cancelled"));
                }
            };
            let status = resp.status().as_u16();
            let body = read_body(resp).await?;
            Ok(json!({ "status": status, "body": body }))
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        match config.get("url").and_then(Value::as_str) {
            Some(url) if reqwest::Url::parse(url).is_ok() => vec![],
            _ => vec!["url must be a valid URL".to_string()],
        }
    }
}
