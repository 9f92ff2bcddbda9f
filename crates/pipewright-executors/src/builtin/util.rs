//! Value helpers shared by the built-in executors.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::types::{FanInEntry, StepContext};

/// Resolve a dot-notation path (e.g. `items[0].name`) inside a value.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        // Check for array index: key[0]
        if let Some(bracket_pos) = segment.find('[') {
            let key = &segment[..bracket_pos];
            if !key.is_empty() {
                current = current.get(key)?;
            }
            for idx in segment[bracket_pos..].split('[').skip(1) {
                let idx: usize = idx.trim_end_matches(']').parse().ok()?;
                current = current.get(idx)?;
            }
        } else {
            current = current.get(segment)?;
        }
    }
    Some(current)
}

/// Set a top-level or dotted field on an object, creating parents as needed.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').filter(|s| !s.is_empty()).peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Interpret a step input as a list of rows.
///
/// Arrays are used as-is, a single object is one row and null (e.g. a skipped
/// upstream) is no rows.
pub fn rows(node_type: &str, input: Value) -> Result<Vec<Value>> {
    match input {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        obj @ Value::Object(_) => Ok(vec![obj]),
        other => Err(PipewrightError::invalid_input(
            node_type,
            format!("expected an array of records, got {}", type_name(&other)),
        )),
    }
}

/// Interpret a step input as the fan-in list built for multi-input nodes.
pub fn fan_in(node_type: &str, input: Value, min: usize) -> Result<Vec<FanInEntry>> {
    let entries: Vec<FanInEntry> = serde_json::from_value(input).map_err(|_| {
        PipewrightError::invalid_input(
            node_type,
            format!("expected at least {} upstream inputs", min),
        )
    })?;
    if entries.len() < min {
        return Err(PipewrightError::invalid_input(
            node_type,
            format!(
                "expected at least {} upstream inputs, got {}",
                min,
                entries.len()
            ),
        ));
    }
    Ok(entries)
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a value for string contexts: strings unquoted, null empty.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric view of a value; numeric strings count.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Content-equality key for a whole record.
///
/// Object keys serialize in sorted order, so equal records give equal keys.
pub fn record_key(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Composite key built from selected fields.
pub fn fields_key(value: &Value, fields: &[String], case_insensitive: bool) -> String {
    let key = fields
        .iter()
        .map(|f| get_path(value, f).map(display).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|");
    if case_insensitive {
        key.to_lowercase()
    } else {
        key
    }
}

/// Order two values: numbers numerically, everything else as text, nulls last.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    display(a).cmp(&display(b))
}

/// Loose equality: identical values, or numerically equal numbers/numeric strings.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((as_f64(a), as_f64(b)), (Some(x), Some(y)) if x == y)
        }
        _ => false,
    }
}

// ── Conditions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    StartsWith,
    EndsWith,
    Exists,
    NotExists,
    Matches,
}

/// `field <operator> value` evaluated against a record.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn evaluate(&self, item: &Value) -> bool {
        let actual = get_path(item, &self.field);
        match self.operator {
            Operator::Exists => actual.is_some_and(|v| !v.is_null()),
            Operator::NotExists => actual.map_or(true, Value::is_null),
            _ => {
                let Some(actual) = actual else {
                    return self.operator == Operator::NotEquals
                        || self.operator == Operator::NotContains;
                };
                self.compare(actual)
            }
        }
    }

    fn compare(&self, actual: &Value) -> bool {
        let expected = &self.value;
        match self.operator {
            Operator::Equals => loosely_equal(actual, expected),
            Operator::NotEquals => !loosely_equal(actual, expected),
            Operator::Contains => contains(actual, expected),
            Operator::NotContains => !contains(actual, expected),
            Operator::GreaterThan => numeric(actual, expected).is_some_and(|(a, b)| a > b),
            Operator::LessThan => numeric(actual, expected).is_some_and(|(a, b)| a < b),
            Operator::GreaterOrEqual => numeric(actual, expected).is_some_and(|(a, b)| a >= b),
            Operator::LessOrEqual => numeric(actual, expected).is_some_and(|(a, b)| a <= b),
            Operator::StartsWith => display(actual).starts_with(&display(expected)),
            Operator::EndsWith => display(actual).ends_with(&display(expected)),
            Operator::Matches => Regex::new(&display(expected))
                .map(|re| re.is_match(&display(actual)))
                .unwrap_or(false),
            Operator::Exists | Operator::NotExists => unreachable!("handled by evaluate"),
        }
    }
}

fn numeric(a: &Value, b: &Value) -> Option<(f64, f64)> {
    Some((as_f64(a)?, as_f64(b)?))
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|i| loosely_equal(i, needle)),
        Value::Object(map) => map.contains_key(&display(needle)),
        other => display(other).contains(&display(needle)),
    }
}

/// How multiple conditions combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    And,
    Or,
}

pub fn evaluate_all(conditions: &[Condition], logic: Logic, item: &Value) -> bool {
    match logic {
        Logic::And => conditions.iter().all(|c| c.evaluate(item)),
        Logic::Or => conditions.iter().any(|c| c.evaluate(item)),
    }
}

// ── Templates ───────────────────────────────────────────────────

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid placeholder regex"))
}

/// Expand `{{path}}` placeholders against a record.
///
/// `{{$vars.name}}` reads run variables, `{{$trigger.path}}` reads trigger
/// data and `{{$input}}` is the whole record as JSON.
pub fn render_template(template: &str, item: &Value, ctx: Option<&StepContext>) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let expr = caps[1].trim();
            resolve_placeholder(expr, item, ctx)
        })
        .into_owned()
}

fn resolve_placeholder(expr: &str, item: &Value, ctx: Option<&StepContext>) -> String {
    if expr == "$input" || expr == "." {
        return display(item);
    }
    if let Some(name) = expr.strip_prefix("$vars.") {
        let (head, rest) = name.split_once('.').unwrap_or((name, ""));
        return ctx
            .and_then(|c| c.get_variable(head))
            .and_then(|v| get_path(&v, rest).cloned())
            .map(|v| display(&v))
            .unwrap_or_default();
    }
    if let Some(path) = expr.strip_prefix("$trigger") {
        return ctx
            .and_then(|c| c.trigger.data.as_ref())
            .and_then(|d| get_path(d, path.trim_start_matches('.')))
            .map(display)
            .unwrap_or_default();
    }
    get_path(item, expr).map(display).unwrap_or_default()
}
