use std::collections::BTreeMap;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::NodeConfig;
use pipewright_core::traits::Executor;
use pipewright_core::types::StepContext;

use super::util::{
    as_f64, display, evaluate_all, get_path, rows, set_path, type_name, Condition, Logic,
};

// ── Filter ──────────────────────────────────────────────────────

pub struct FilterExecutor;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ConditionSettings {
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    logic: Logic,
}

impl Executor for FilterExecutor {
    fn description(&self) -> &str {
        "Keep the rows that satisfy every (or any) condition."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: ConditionSettings = config.parse("filter")?;
            let kept: Vec<Value> = rows("filter", input)?
                .into_iter()
                .filter(|row| evaluate_all(&settings.conditions, settings.logic, row))
                .collect();
            Ok(Value::Array(kept))
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        match config.parse::<ConditionSettings>("filter") {
            Ok(s) if s.conditions.is_empty() => vec!["at least one condition is required".into()],
            Ok(_) => vec![],
            Err(e) => vec![e.to_string()],
        }
    }
}

// ── Condition ───────────────────────────────────────────────────

pub struct ConditionExecutor;

impl Executor for ConditionExecutor {
    fn description(&self) -> &str {
        "Partition rows into matched and unmatched branches."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: ConditionSettings = config.parse("condition")?;
            let (matched, unmatched): (Vec<Value>, Vec<Value>) = rows("condition", input)?
                .into_iter()
                .partition(|row| evaluate_all(&settings.conditions, settings.logic, row));
            Ok(json!({
                "result": !matched.is_empty(),
                "matched": matched,
                "unmatched": unmatched,
            }))
        })
    }
}

// ── Transform ───────────────────────────────────────────────────

pub struct TransformExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformSettings {
    /// target field -> source path
    #[serde(default)]
    mapping: BTreeMap<String, String>,
    #[serde(default)]
    set: Map<String, Value>,
    #[serde(default)]
    remove: Vec<String>,
    #[serde(default = "default_true")]
    keep_original: bool,
}

fn default_true() -> bool { true }

impl TransformSettings {
    fn apply(&self, row: &Value) -> Value {
        let mut out = if self.keep_original && row.is_object() {
            row.clone()
        } else {
            Value::Object(Map::new())
        };
        for (target, source) in &self.mapping {
            let value = get_path(row, source).cloned().unwrap_or(Value::Null);
            set_path(&mut out, target, value);
        }
        for (field, value) in &self.set {
            set_path(&mut out, field, value.clone());
        }
        if let Value::Object(map) = &mut out {
            for field in &self.remove {
                map.remove(field);
            }
        }
        out
    }
}

impl Executor for TransformExecutor {
    fn description(&self) -> &str {
        "Reshape each row: map fields from source paths, set constants, drop fields."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: TransformSettings = config.parse("transform")?;
            match input {
                Value::Object(_) => Ok(settings.apply(&input)),
                other => Ok(Value::Array(
                    rows("transform", other)?
                        .iter()
                        .map(|row| settings.apply(row))
                        .collect(),
                )),
            }
        })
    }
}

// ── Parse ───────────────────────────────────────────────────────

pub struct ParseExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParseSettings {
    format: ParseFormat,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    delimiter: Option<String>,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum ParseFormat {
    Json,
    Csv,
    Lines,
    KeyValue,
}

impl ParseSettings {
    fn parse_text(&self, text: &str) -> Result<Value> {
        match self.format {
            ParseFormat::Json => serde_json::from_str(text)
                .map_err(|e| PipewrightError::invalid_input("parse", format!("invalid JSON: {}", e))),
            ParseFormat::Csv => {
                let delimiter = self.delimiter.as_deref().unwrap_or(",");
                parse_csv(text, delimiter)
            }
            ParseFormat::Lines => Ok(Value::Array(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| Value::String(l.to_string()))
                    .collect(),
            )),
            ParseFormat::KeyValue => {
                let delimiter = self.delimiter.as_deref().unwrap_or("=");
                let mut map = Map::new();
                for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    if let Some((k, v)) = line.split_once(delimiter) {
                        map.insert(k.trim().to_string(), infer_scalar(v.trim()));
                    }
                }
                Ok(Value::Object(map))
            }
        }
    }

    fn parse_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.parse_text(s),
            // Already structured
            other if matches!(self.format, ParseFormat::Json) => Ok(other.clone()),
            other => Err(PipewrightError::invalid_input(
                "parse",
                format!("expected text, got {}", type_name(other)),
            )),
        }
    }
}

/// Parse delimited text with a header row into an array of objects.
pub(crate) fn parse_csv(text: &str, delimiter: &str) -> Result<Value> {
    let delimiter = delimiter.as_bytes().first().copied().unwrap_or(b',');
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| PipewrightError::invalid_input("parse", e.to_string()))?
        .clone();

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PipewrightError::invalid_input("parse", e.to_string()))?;
        let mut row = Map::new();
        for (i, header) in headers.iter().enumerate() {
            let cell = record.get(i).unwrap_or("");
            row.insert(header.to_string(), infer_scalar(cell));
        }
        out.push(Value::Object(row));
    }
    Ok(Value::Array(out))
}

/// Numbers and booleans become typed values; everything else stays text.
pub(crate) fn infer_scalar(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return json!(f);
        }
    }
    Value::String(raw.to_string())
}

impl Executor for ParseExecutor {
    fn description(&self) -> &str {
        "Parse text (or a text field of each row) as json, csv, lines or key_value."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: ParseSettings = config.parse("parse")?;
            let Some(field) = settings.field.clone() else {
                return settings.parse_value(&input);
            };

            let parse_row = |mut row: Value| -> Result<Value> {
                let source = get_path(&row, &field).cloned().unwrap_or(Value::Null);
                let parsed = settings.parse_value(&source)?;
                set_path(&mut row, &field, parsed);
                Ok(row)
            };
            match input {
                Value::Array(items) => Ok(Value::Array(
                    items.into_iter().map(parse_row).collect::<Result<_>>()?,
                )),
                other => parse_row(other),
            }
        })
    }
}

// ── Switch ──────────────────────────────────────────────────────

pub struct SwitchExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchSettings {
    field: String,
    /// field value -> branch label
    #[serde(default)]
    cases: BTreeMap<String, String>,
    #[serde(default = "default_branch")]
    default: String,
}

fn default_branch() -> String { "default".to_string() }

impl Executor for SwitchExecutor {
    fn description(&self) -> &str {
        "Route rows into labelled branches by the value of a field."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: SwitchSettings = config.parse("switch")?;
            let mut branches: Map<String, Value> = Map::new();
            for label in settings.cases.values().chain(std::iter::once(&settings.default)) {
                branches.insert(label.clone(), Value::Array(vec![]));
            }

            for row in rows("switch", input)? {
                let key = get_path(&row, &settings.field).map(display).unwrap_or_default();
                let label = settings.cases.get(&key).unwrap_or(&settings.default);
                if let Some(Value::Array(bucket)) = branches.get_mut(label) {
                    bucket.push(row);
                }
            }
            Ok(Value::Object(branches))
        })
    }
}

// ── Loop ────────────────────────────────────────────────────────

pub struct LoopExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoopSettings {
    #[serde(default)]
    field: Option<String>,
    #[serde(default = "default_max_iterations")]
    max_iterations: usize,
}

fn default_max_iterations() -> usize { 1000 }

impl Executor for LoopExecutor {
    fn description(&self) -> &str {
        "Expand an array into per-item records with position metadata."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: LoopSettings = config.parse("loop")?;
            let source = match &settings.field {
                Some(field) => get_path(&input, field).cloned().unwrap_or(Value::Null),
                None => input,
            };
            let items = rows("loop", source)?;
            let count = items.len().min(settings.max_iterations);

            let out: Vec<Value> = items
                .into_iter()
                .take(count)
                .enumerate()
                .map(|(index, item)| {
                    json!({
                        "index": index,
                        "item": item,
                        "isFirst": index == 0,
                        "isLast": index + 1 == count,
                    })
                })
                .collect();
            Ok(Value::Array(out))
        })
    }
}

// ── Validate ────────────────────────────────────────────────────

pub struct ValidateExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateSettings {
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    mode: ValidateMode,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ValidateMode {
    #[default]
    Filter,
    Strict,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Rule {
    field: String,
    #[serde(default)]
    required: bool,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    pattern: Option<String>,
}

impl Rule {
    fn check(&self, item: &Value, errors: &mut Vec<String>) {
        let value = get_path(item, &self.field).filter(|v| !v.is_null());
        let Some(value) = value else {
            if self.required {
                errors.push(format!("{} is required", self.field));
            }
            return;
        };

        if let Some(kind) = &self.kind {
            if !type_matches(kind, value) {
                errors.push(format!("{} must be of type {}", self.field, kind));
                return;
            }
        }

        // Numbers bound the value; strings and arrays bound the length.
        let measure = match value {
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(a) => Some(a.len() as f64),
            other => as_f64(other),
        };
        if let (Some(min), Some(m)) = (self.min, measure) {
            if m < min {
                errors.push(format!("{} must be at least {}", self.field, min));
            }
        }
        if let (Some(max), Some(m)) = (self.max, measure) {
            if m > max {
                errors.push(format!("{} must be at most {}", self.field, max));
            }
        }

        if let Some(pattern) = &self.pattern {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(&display(value)) => {}
                Ok(_) => errors.push(format!("{} does not match {}", self.field, pattern)),
                Err(e) => errors.push(format!("{} has an invalid pattern: {}", self.field, e)),
            }
        }
    }
}

fn type_matches(kind: &str, value: &Value) -> bool {
    match kind {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "email" => value
            .as_str()
            .is_some_and(|s| s.split_once('@').is_some_and(|(u, d)| !u.is_empty() && d.contains('.'))),
        _ => true,
    }
}

impl Executor for ValidateExecutor {
    fn description(&self) -> &str {
        "Check rows against field rules, separating valid from invalid."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: ValidateSettings = config.parse("validate")?;
            let mut valid = Vec::new();
            let mut invalid = Vec::new();

            for item in rows("validate", input)? {
                let mut errors = Vec::new();
                for rule in &settings.rules {
                    rule.check(&item, &mut errors);
                }
                if errors.is_empty() {
                    valid.push(item);
                } else {
                    invalid.push(json!({ "item": item, "errors": errors }));
                }
            }

            if settings.mode == ValidateMode::Strict && !invalid.is_empty() {
                let first = invalid[0]["errors"]
                    .as_array()
                    .map(|e| e.iter().map(display).collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                return Err(PipewrightError::execution(
                    "validate",
                    format!("{} invalid record(s); first: {}", invalid.len(), first),
                ));
            }

            Ok(json!({ "valid": valid, "invalid": invalid }))
        })
    }
}
