use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::NodeConfig;
use pipewright_core::traits::Executor;
use pipewright_core::types::StepContext;

use super::util::{as_f64, compare_values, display, fan_in, fields_key, get_path, record_key, rows};

/// A config value that may be one string or a list of them.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

fn merge(left: &Value, right: &Value) -> Value {
    let mut out = match left {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(map) = right {
        for (k, v) in map {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

// ── Join ────────────────────────────────────────────────────────

pub struct JoinExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinSettings {
    #[serde(default, rename = "type")]
    kind: JoinKind,
    left_key: String,
    #[serde(default)]
    right_key: Option<String>,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
enum JoinKind {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

impl Executor for JoinExecutor {
    fn description(&self) -> &str {
        "Join the first two upstream streams on a key field."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: JoinSettings = config.parse("join")?;
            let mut entries = fan_in("join", input, 2)?.into_iter();
            let (Some(left), Some(right)) = (entries.next(), entries.next()) else {
                return Err(PipewrightError::invalid_input("join", "expected two inputs"));
            };
            let left = rows("join", left.data)?;
            let right = rows("join", right.data)?;
            let right_key = settings.right_key.as_deref().unwrap_or(&settings.left_key);

            let mut index: HashMap<String, Vec<&Value>> = HashMap::new();
            for row in &right {
                if let Some(key) = get_path(row, right_key).filter(|v| !v.is_null()) {
                    index.entry(record_key(key)).or_default().push(row);
                }
            }

            let mut out = Vec::new();
            for row in &left {
                let matches = get_path(row, &settings.left_key)
                    .filter(|v| !v.is_null())
                    .and_then(|key| index.get(&record_key(key)));
                match matches {
                    Some(found) => out.extend(found.iter().map(|r| merge(row, r))),
                    None if settings.kind == JoinKind::Left => out.push(row.clone()),
                    None => {}
                }
            }
            Ok(Value::Array(out))
        })
    }

    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        match config.parse::<JoinSettings>("join") {
            Ok(_) => vec![],
            Err(e) => vec![e.to_string()],
        }
    }
}

// ── Aggregate ───────────────────────────────────────────────────

pub struct AggregateExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateSettings {
    #[serde(default)]
    group_by: Option<OneOrMany>,
    #[serde(default)]
    group_all: bool,
    #[serde(default)]
    operations: Vec<AggregateOp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateOp {
    #[serde(default)]
    field: Option<String>,
    operation: Operation,
    #[serde(default)]
    alias: Option<String>,
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    First,
    Last,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

impl AggregateOp {
    fn alias(&self) -> String {
        match (&self.alias, &self.field) {
            (Some(alias), _) => alias.clone(),
            (None, Some(field)) => format!("{}_{}", self.operation.name(), field),
            (None, None) => self.operation.name().to_string(),
        }
    }

    fn apply(&self, group: &[&Value]) -> Value {
        let values: Vec<&Value> = match &self.field {
            Some(field) if field != "*" => group
                .iter()
                .filter_map(|row| get_path(row, field))
                .filter(|v| !v.is_null())
                .collect(),
            _ => group.to_vec(),
        };
        let numbers = || values.iter().filter_map(|v| as_f64(v));

        match self.operation {
            Operation::Count => json!(values.len()),
            Operation::Sum => number(numbers().sum()),
            Operation::Avg => {
                let n: Vec<f64> = numbers().collect();
                if n.is_empty() {
                    Value::Null
                } else {
                    number(n.iter().sum::<f64>() / n.len() as f64)
                }
            }
            Operation::Min => values
                .iter()
                .copied()
                .min_by(|a, b| compare_values(a, b))
                .cloned()
                .unwrap_or(Value::Null),
            Operation::Max => values
                .iter()
                .copied()
                .max_by(|a, b| compare_values(a, b))
                .cloned()
                .unwrap_or(Value::Null),
            Operation::First => values.first().map(|v| (*v).clone()).unwrap_or(Value::Null),
            Operation::Last => values.last().map(|v| (*v).clone()).unwrap_or(Value::Null),
        }
    }
}

/// Whole numbers come back as integers.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

impl Executor for AggregateExecutor {
    fn description(&self) -> &str {
        "Group rows and compute sum/avg/count/min/max/first/last per group."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: AggregateSettings = config.parse("aggregate")?;
            let items = rows("aggregate", input)?;
            let group_by = settings.group_by.clone().map(OneOrMany::into_vec);

            // Groups in first-seen order.
            let mut order: Vec<String> = Vec::new();
            let mut groups: HashMap<String, Vec<&Value>> = HashMap::new();
            for row in &items {
                let key = if settings.group_all {
                    String::new()
                } else {
                    match &group_by {
                        Some(fields) => fields_key(row, fields, false),
                        None => record_key(row),
                    }
                };
                groups
                    .entry(key.clone())
                    .or_insert_with(|| {
                        order.push(key);
                        Vec::new()
                    })
                    .push(row);
            }

            let mut out = Vec::new();
            for key in order {
                let group = &groups[&key];
                let mut result = Map::new();
                if !settings.group_all {
                    match &group_by {
                        Some(fields) => {
                            for field in fields {
                                let value = get_path(group[0], field).cloned().unwrap_or(Value::Null);
                                result.insert(field.clone(), value);
                            }
                        }
                        None => {
                            if let Value::Object(map) = group[0] {
                                result.extend(map.clone());
                            }
                        }
                    }
                }
                for op in &settings.operations {
                    result.insert(op.alias(), op.apply(group));
                }
                out.push(Value::Object(result));
            }
            Ok(Value::Array(out))
        })
    }
}

// ── Deduplicate / Distinct ──────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DedupeSettings {
    #[serde(default)]
    fields: Option<OneOrMany>,
    /// Distinct only: emit the unique values of this field.
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
    #[serde(default)]
    keep: Keep,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Keep {
    #[default]
    First,
    Last,
}

impl DedupeSettings {
    fn key(&self, row: &Value) -> String {
        match &self.fields {
            Some(fields) => fields_key(row, &fields.clone().into_vec(), self.case_insensitive),
            None if self.case_insensitive => record_key(row).to_lowercase(),
            None => record_key(row),
        }
    }

    /// One row per key; the survivor sits at the key's first position.
    fn dedupe(&self, items: Vec<Value>) -> Vec<Value> {
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut out: Vec<Value> = Vec::new();
        for row in items {
            let key = self.key(&row);
            match slots.get(&key) {
                Some(&slot) if self.keep == Keep::Last => out[slot] = row,
                Some(_) => {}
                None => {
                    slots.insert(key, out.len());
                    out.push(row);
                }
            }
        }
        out
    }
}

pub struct DeduplicateExecutor;

impl Executor for DeduplicateExecutor {
    fn description(&self) -> &str {
        "Drop duplicate rows by whole record or by selected fields."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: DedupeSettings = config.parse("deduplicate")?;
            Ok(Value::Array(settings.dedupe(rows("deduplicate", input)?)))
        })
    }
}

pub struct DistinctExecutor;

impl Executor for DistinctExecutor {
    fn description(&self) -> &str {
        "Unique values of a field, or unique records."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: DedupeSettings = config.parse("distinct")?;
            let items = rows("distinct", input)?;
            let Some(field) = &settings.field else {
                return Ok(Value::Array(settings.dedupe(items)));
            };

            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for value in items.iter().filter_map(|row| get_path(row, field)) {
                let mut key = record_key(value);
                if settings.case_insensitive {
                    key = key.to_lowercase();
                }
                if seen.insert(key) {
                    out.push(value.clone());
                }
            }
            Ok(Value::Array(out))
        })
    }
}

// ── Union / Intersect ───────────────────────────────────────────

pub struct UnionExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnionSettings {
    #[serde(default = "default_true")]
    distinct: bool,
}

fn default_true() -> bool { true }

impl Executor for UnionExecutor {
    fn description(&self) -> &str {
        "Concatenate all upstream streams, optionally removing duplicate records."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: UnionSettings = config.parse("union")?;
            let mut all = Vec::new();
            for entry in fan_in("union", input, 2)? {
                all.extend(rows("union", entry.data)?);
            }
            if settings.distinct {
                let mut seen = HashSet::new();
                all.retain(|row| seen.insert(record_key(row)));
            }
            Ok(Value::Array(all))
        })
    }
}

pub struct IntersectExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntersectSettings {
    #[serde(default)]
    field: Option<String>,
}

impl Executor for IntersectExecutor {
    fn description(&self) -> &str {
        "Rows of the first stream that appear in every other stream."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: IntersectSettings = config.parse("intersect")?;
            let key_of = |row: &Value| -> String {
                match &settings.field {
                    Some(f) => get_path(row, f).map(record_key).unwrap_or_default(),
                    None => record_key(row),
                }
            };

            let mut entries = fan_in("intersect", input, 2)?.into_iter();
            let first = match entries.next() {
                Some(entry) => rows("intersect", entry.data)?,
                None => Vec::new(),
            };
            let others: Vec<HashSet<String>> = entries
                .map(|entry| -> Result<HashSet<String>> {
                    Ok(rows("intersect", entry.data)?.iter().map(key_of).collect())
                })
                .collect::<Result<_>>()?;

            let out: Vec<Value> = first
                .into_iter()
                .filter(|row| {
                    let key = key_of(row);
                    others.iter().all(|set| set.contains(&key))
                })
                .collect();
            Ok(Value::Array(out))
        })
    }
}

// ── Sort ────────────────────────────────────────────────────────

pub struct SortExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SortSettings {
    #[serde(default)]
    criteria: Vec<SortCriterion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SortCriterion {
    field: String,
    #[serde(default)]
    direction: Direction,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Direction {
    #[default]
    Asc,
    Desc,
}

impl SortSettings {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for c in &self.criteria {
            let x = get_path(a, &c.field).unwrap_or(&Value::Null);
            let y = get_path(b, &c.field).unwrap_or(&Value::Null);
            let ord = match (x.is_null(), y.is_null(), c.direction) {
                // nulls stay last in either direction
                (true, _, _) | (_, true, _) => compare_values(x, y),
                (_, _, Direction::Asc) => compare_values(x, y),
                (_, _, Direction::Desc) => compare_values(y, x),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl Executor for SortExecutor {
    fn description(&self) -> &str {
        "Stable multi-key sort; nulls last."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: SortSettings = config.parse("sort")?;
            let mut items = rows("sort", input)?;
            items.sort_by(|a, b| settings.compare(a, b));
            Ok(Value::Array(items))
        })
    }
}

// ── Split ───────────────────────────────────────────────────────

pub struct SplitExecutor;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplitSettings {
    #[serde(default)]
    mode: SplitMode,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    output: SplitOutput,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
}

fn default_batch_size() -> usize { 10 }

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum SplitMode {
    #[default]
    Field,
    Batch,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum SplitOutput {
    #[default]
    Nested,
    Groups,
}

impl Executor for SplitExecutor {
    fn description(&self) -> &str {
        "Split rows by a field value or into fixed-size batches."
    }

    fn execute(
        &self,
        input: Value,
        config: NodeConfig,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let settings: SplitSettings = config.parse("split")?;
            let items = rows("split", input)?;

            match settings.mode {
                SplitMode::Batch => {
                    if settings.batch_size == 0 {
                        return Err(PipewrightError::invalid_config(
                            "split",
                            "batchSize must be greater than 0",
                        ));
                    }
                    Ok(Value::Array(
                        items
                            .chunks(settings.batch_size)
                            .map(|c| Value::Array(c.to_vec()))
                            .collect(),
                    ))
                }
                SplitMode::Field => {
                    let field = settings.field.as_deref().ok_or_else(|| {
                        PipewrightError::invalid_config("split", "field is required in field mode")
                    })?;
                    let mut order: Vec<String> = Vec::new();
                    let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
                    for row in items {
                        let key = get_path(&row, field).map(display).unwrap_or_default();
                        if !groups.contains_key(&key) {
                            order.push(key.clone());
                        }
                        groups.entry(key).or_default().push(row);
                    }

                    match settings.output {
                        SplitOutput::Nested => {
                            let mut out = Map::new();
                            for key in order {
                                let group = groups.remove(&key).unwrap_or_default();
                                out.insert(key, Value::Array(group));
                            }
                            Ok(Value::Object(out))
                        }
                        SplitOutput::Groups => Ok(Value::Array(
                            order
                                .into_iter()
                                .map(|key| {
                                    let group = groups.remove(&key).unwrap_or_default();
                                    json!({ "key": key, "items": group })
                                })
                                .collect(),
                        )),
                    }
                }
            }
        })
    }
}
