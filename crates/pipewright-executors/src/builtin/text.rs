use std::collections::BTreeMap;

use futures::future::BoxFuture;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::NodeConfig;
use pipewright_core::traits::Executor;
use pipewright_core::types::StepContext;

use super::transform::parse_csv;
use super::util::{display, get_path, render_template, set_path};

/// Apply `f` to a bare value, or to every element of an array.
fn per_row(input: Value, mut f: impl FnMut(Value) -> Result<Value>) -> Result<Value> {
    match input {
        Value::Array(items) => Ok(Value::Array(
            items.into_iter().map(&mut f).collect::<Result<_>>()?,
        )),
        other => f(other),
    }
}

// ── Regex ───────────────────────────────────────────────────────

pub struct RegexExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegexSettings {
    #[serde(default)]
    mode: RegexMode,
    pattern: String,
    #[serde(default)]
    replacement: String,
    #[serde(default)]
    flags: String,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    output_field: Option<String>,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum RegexMode {
    #[default]
    Extract,
    Replace,
    Test,
}

impl RegexSettings {
    fn compile(&self) -> Result<Regex> {
        RegexBuilder::new(&self.pattern)
            .case_insensitive(self.flags.contains('i'))
            .multi_line(self.flags.contains('m'))
            .build()
            .map_err(|e| PipewrightError::invalid_config("regex", e.to_string()))
    }

    fn global(&self) -> bool {
        self.flags.contains('g')
    }

    fn apply(&self, re: &Regex, text: &str) -> Value {
        match self.mode {
            RegexMode::Test => Value::Bool(re.is_match(text)),
            RegexMode::Replace if self.global() => {
                Value::String(re.replace_all(text, self.replacement.as_str()).into_owned())
            }
            RegexMode::Replace => {
                Value::String(re.replace(text, self.replacement.as_str()).into_owned())
            }
            RegexMode::Extract => {
                // First capture group when the pattern has one, else the whole match.
                let pick = |caps: regex::Captures<'_>| {
                    caps.get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| Value::String(m.as_str().to_string()))
                        .unwrap_or(Value::Null)
                };
                if self.global() {
                    Value::Array(re.captures_iter(text).map(pick).collect())
                } else {
                    re.captures(text).map(pick).unwrap_or(Value::Null)
                }
            }
        }
    }
}

impl Executor for RegexExecutor {
    fn description(&self) -> &str {
        "Extract, replace or test a regular expression against text or a row field."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: RegexSettings = config.parse("regex")?;
            let re = settings.compile()?;

            per_row(input, |row| match &settings.field {
                None => Ok(settings.apply(&re, &display(&row))),
                Some(field) => {
                    let text = get_path(&row, field).map(display).unwrap_or_default();
                    let result = settings.apply(&re, &text);
                    let target = settings.output_field.as_deref().unwrap_or(field);
                    let mut row = row;
                    set_path(&mut row, target, result);
                    Ok(row)
                }
            })
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        match config.parse::<RegexSettings>("regex").and_then(|s| s.compile()) {
            Ok(_) => vec![],
            Err(e) => vec![e.to_string()],
        }
    }
}

// ── Format convert ──────────────────────────────────────────────

pub struct FormatConvertExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FormatConvertSettings {
    to: TargetFormat,
    #[serde(default)]
    pretty: bool,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
enum TargetFormat {
    Json,
    Csv,
    Text,
    Lines,
}

/// Serialize rows as CSV with a header built from keys in first-seen order.
pub(crate) fn to_csv(rows: &[Value]) -> Result<String> {
    let mut headers: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_err = |e: csv::Error| PipewrightError::execution("format_convert", e.to_string());
    if headers.is_empty() {
        // Scalars: one value per line
        for row in rows {
            writer.write_record([display(row)]).map_err(csv_err)?;
        }
    } else {
        writer.write_record(&headers).map_err(csv_err)?;
        for row in rows {
            let record: Vec<String> = headers
                .iter()
                .map(|h| row.get(h).map(display).unwrap_or_default())
                .collect();
            writer.write_record(&record).map_err(csv_err)?;
        }
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| PipewrightError::execution("format_convert", e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| PipewrightError::execution("format_convert", e.to_string()))
}

/// Plain-text rendering: arrays one item per line, objects as JSON.
pub(crate) fn to_text(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::Object(_) | Value::Array(_) => v.to_string(),
                other => display(other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => serde_json::to_string_pretty(value).unwrap_or_default(),
        other => display(other),
    }
}

impl Executor for FormatConvertExecutor {
    fn description(&self) -> &str {
        "Convert between JSON, CSV, plain text and line lists."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: FormatConvertSettings = config.parse("format_convert")?;
            match (settings.to, input) {
                // Text becomes structured: JSON first, then CSV with a header row.
                (TargetFormat::Json, Value::String(s)) => match serde_json::from_str(&s) {
                    Ok(v) => Ok(v),
                    Err(_) => parse_csv(&s, ","),
                },
                (TargetFormat::Json, other) if settings.pretty => {
                    Ok(Value::String(serde_json::to_string_pretty(&other)?))
                }
                (TargetFormat::Json, other) => Ok(other),
                (TargetFormat::Csv, Value::String(s)) => Ok(Value::String(s)),
                (TargetFormat::Csv, Value::Array(items)) => Ok(Value::String(to_csv(&items)?)),
                (TargetFormat::Csv, obj @ Value::Object(_)) => Ok(Value::String(to_csv(&[obj])?)),
                (TargetFormat::Csv, other) => Err(PipewrightError::invalid_input(
                    "format_convert",
                    format!("cannot convert {} to csv", other),
                )),
                (TargetFormat::Text, value) => Ok(Value::String(to_text(&value))),
                (TargetFormat::Lines, Value::String(s)) => Ok(Value::Array(
                    s.lines().map(|l| Value::String(l.to_string())).collect(),
                )),
                (TargetFormat::Lines, Value::Array(items)) => Ok(Value::Array(
                    items
                        .iter()
                        .map(|v| Value::String(to_text(&Value::Array(vec![v.clone()]))))
                        .collect(),
                )),
                (TargetFormat::Lines, other) => Ok(Value::Array(vec![Value::String(to_text(&other))])),
            }
        })
    }
}

// ── Template ────────────────────────────────────────────────────

pub struct TemplateExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateSettings {
    template: String,
    #[serde(default)]
    output_field: Option<String>,
}

impl Executor for TemplateExecutor {
    fn description(&self) -> &str {
        "Render a `{{placeholder}}` template per row."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: TemplateSettings = config.parse("template")?;
            per_row(input, |row| {
                let rendered = Value::String(render_template(&settings.template, &row, Some(&ctx)));
                match &settings.output_field {
                    Some(field) if row.is_object() => {
                        let mut row = row;
                        set_path(&mut row, field, rendered);
                        Ok(row)
                    }
                    _ => Ok(rendered),
                }
            })
        })
    }
}

// ── URL builder ─────────────────────────────────────────────────

pub struct UrlBuilderExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UrlBuilderSettings {
    base_url: String,
    #[serde(default)]
    path: String,
    /// query key -> value template
    #[serde(default)]
    params: BTreeMap<String, String>,
    #[serde(default)]
    output_field: Option<String>,
}

impl UrlBuilderSettings {
    fn build(&self, row: &Value, ctx: &StepContext) -> Result<String> {
        let path = render_template(&self.path, row, Some(ctx));
        let joined = match (self.base_url.ends_with('/'), path.starts_with('/')) {
            _ if path.is_empty() => self.base_url.clone(),
            (true, true) => format!("{}{}", self.base_url, &path[1..]),
            (false, false) => format!("{}/{}", self.base_url, path),
            _ => format!("{}{}", self.base_url, path),
        };
        let mut url = reqwest::Url::parse(&joined)
            .map_err(|e| PipewrightError::invalid_config("url_builder", format!("{}: {}", joined, e)))?;

        let params: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(k, t)| (k.clone(), render_template(t, row, Some(ctx))))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.to_string())
    }
}

impl Executor for UrlBuilderExecutor {
    fn description(&self) -> &str {
        "Build URLs from a base, a templated path and templated query parameters."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: UrlBuilderSettings = config.parse("url_builder")?;
            per_row(input, |row| {
                let url = Value::String(settings.build(&row, &ctx)?);
                match &settings.output_field {
                    Some(field) if row.is_object() => {
                        let mut row = row;
                        set_path(&mut row, field, url);
                        Ok(row)
                    }
                    _ => Ok(url),
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_test_utils::{step_ctx, step_ctx_with_trigger};
    use serde_json::json;

    async fn run(executor: &dyn Executor, input: Value, config: Value) -> Result<Value> {
        executor
            .execute(input, NodeConfig::from(config), step_ctx("n"))
            .await
    }

    #[tokio::test]
    async fn test_regex_modes() {
        let out = run(
            &RegexExecutor,
            json!("order 42 and 7"),
            json!({"pattern": "\\d+", "flags": "g"}),
        )
        .await
        .unwrap();
        assert_eq!(out, json!(["42", "7"]));

        let out = run(
            &RegexExecutor,
            json!("id=abc"),
            json!({"pattern": "id=(\\w+)"}),
        )
        .await
        .unwrap();
        assert_eq!(out, json!("abc"));

        let out = run(
            &RegexExecutor,
            json!("a-b-c"),
            json!({"mode": "replace", "pattern": "-", "replacement": "+", "flags": "g"}),
        )
        .await
        .unwrap();
        assert_eq!(out, json!("a+b+c"));

        let out = run(
            &RegexExecutor,
            json!(["Hello", "bye"]),
            json!({"mode": "test", "pattern": "^h", "flags": "i"}),
        )
        .await
        .unwrap();
        assert_eq!(out, json!([true, false]));
    }

    #[tokio::test]
    async fn test_regex_on_field() {
        let out = run(
            &RegexExecutor,
            json!([{"email": "ada@example.com"}]),
            json!({"pattern": "@(.+)$", "field": "email", "outputField": "domain"}),
        )
        .await
        .unwrap();
        assert_eq!(out, json!([{"email": "ada@example.com", "domain": "example.com"}]));
    }

    #[test]
    fn test_regex_validate_bad_pattern() {
        let errs = RegexExecutor.validate(&NodeConfig::from(json!({"pattern": "("})));
        assert_eq!(errs.len(), 1);
    }

    #[tokio::test]
    async fn test_format_convert_csv_and_back() {
        let rows = json!([{"id": 1, "name": "Ada"}, {"id": 2, "name": "Bob, Jr."}]);
        let csv = run(&FormatConvertExecutor, rows, json!({"to": "csv"}))
            .await
            .unwrap();
        assert_eq!(csv, json!("id,name\n1,Ada\n2,\"Bob, Jr.\"\n"));

        let back = run(&FormatConvertExecutor, csv, json!({"to": "json"}))
            .await
            .unwrap();
        assert_eq!(back, json!([{"id": 1, "name": "Ada"}, {"id": 2, "name": "Bob, Jr."}]));
    }

    #[tokio::test]
    async fn test_format_convert_text_and_lines() {
        let out = run(&FormatConvertExecutor, json!(["a", 1, null]), json!({"to": "text"}))
            .await
            .unwrap();
        assert_eq!(out, json!("a\n1\n"));

        let out = run(&FormatConvertExecutor, json!("x\ny"), json!({"to": "lines"}))
            .await
            .unwrap();
        assert_eq!(out, json!(["x", "y"]));

        let out = run(&FormatConvertExecutor, json!("{\"a\":1}"), json!({"to": "json"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_template_rows_vars_and_trigger() {
        let ctx = step_ctx_with_trigger("t", Some(json!({"user": "ops"})));
        ctx.set_variable("env", json!("prod"));
        let out = TemplateExecutor
            .execute(
                json!([{"name": "Ada"}]),
                NodeConfig::from(json!({
                    "template": "{{name}}@{{$vars.env}} by {{$trigger.user}}",
                    "outputField": "line"
                })),
                ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, json!([{"name": "Ada", "line": "Ada@prod by ops"}]));
    }

    #[tokio::test]
    async fn test_url_builder() {
        let out = run(
            &UrlBuilderExecutor,
            json!({"id": 7, "q": "a b"}),
            json!({
                "baseUrl": "https://api.example.com/",
                "path": "/items/{{id}}",
                "params": {"search": "{{q}}", "empty": "{{missing}}"}
            }),
        )
        .await
        .unwrap();
        assert_eq!(out, json!("https://api.example.com/items/7?search=a+b"));
    }

    #[tokio::test]
    async fn test_url_builder_invalid_base() {
        let err = run(&UrlBuilderExecutor, json!({}), json!({"baseUrl": "not a url"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipewrightError::InvalidConfig { .. }));
    }
}
