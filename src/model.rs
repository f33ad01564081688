//! Declarative test case documents and execution records.

use crate::error::{Result, RunnerError};
use crate::ui::Locator;
use crate::variables::VariableMapping;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A test case: configuration plus ordered steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub config: Config,
    #[serde(default)]
    pub teststeps: Vec<Step>,
}

impl TestCase {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Case-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    /// Base URL for relative request paths and the UI driver's start
    /// page. May contain templates.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub variables: VariableMapping,
    /// Variables this case exports when run as a referenced case.
    #[serde(default)]
    pub export: Vec<String>,
    /// Default datasource for SQL blocks.
    #[serde(default)]
    pub datasource: Option<String>,
    /// Verify TLS certificates.
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub setup_hooks: Vec<Hook>,
    #[serde(default)]
    pub teardown_hooks: Vec<Hook>,
}

/// A single declared step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// `API`, `UI` or `SQL`; checked at dispatch time.
    #[serde(default = "default_step_type")]
    pub step_type: String,
    #[serde(default)]
    pub request: Option<Request>,
    /// Another test case to run as this step.
    #[serde(default)]
    pub testcase: Option<CaseRef>,
    #[serde(default)]
    pub location: Vec<UiLocation>,
    #[serde(default)]
    pub sql: Vec<SqlBlock>,
    #[serde(default)]
    pub variables: VariableMapping,
    #[serde(default)]
    pub setup_hooks: Vec<Hook>,
    #[serde(default)]
    pub teardown_hooks: Vec<Hook>,
    /// Variable name → extraction expression.
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
    #[serde(default, alias = "validate")]
    pub validators: Vec<Validator>,
    /// Variables the referenced case must export.
    #[serde(default)]
    pub export: Vec<String>,
    #[serde(default)]
    pub skip: Option<Skip>,
}

fn default_step_type() -> String {
    StepType::Api.to_string()
}

/// The closed set of step types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepType {
    Api,
    Ui,
    Sql,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepType::Api => "API",
            StepType::Ui => "UI",
            StepType::Sql => "SQL",
        })
    }
}

impl FromStr for StepType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "API" => Ok(StepType::Api),
            "UI" => Ok(StepType::Ui),
            "SQL" => Ok(StepType::Sql),
            _ => Err(()),
        }
    }
}

/// What a step does, derived from its type and payload.
#[derive(Debug, Clone, Copy)]
pub enum StepAction<'a> {
    Request(&'a Request),
    Ui(&'a [UiLocation]),
    Sql(&'a [SqlBlock]),
    TestCase(&'a CaseRef),
}

impl Step {
    pub fn kind(&self) -> Result<StepType> {
        self.step_type
            .parse()
            .map_err(|_| RunnerError::UnknownStepType {
                step: self.name.clone(),
                step_type: self.step_type.clone(),
            })
    }

    /// Resolve the step into exactly one action.
    pub fn action(&self) -> Result<StepAction<'_>> {
        let invalid = |reason: &str| RunnerError::InvalidStep {
            step: self.name.clone(),
            reason: reason.to_string(),
        };

        match self.kind()? {
            StepType::Api => match (&self.request, &self.testcase) {
                (Some(request), None) => Ok(StepAction::Request(request)),
                (None, Some(case)) => Ok(StepAction::TestCase(case)),
                (Some(_), Some(_)) => Err(invalid(
                    "declares both a request and a referenced testcase",
                )),
                (None, None) => Err(invalid(
                    "is neither a request nor a referenced testcase",
                )),
            },
            StepType::Ui => {
                if !self.location.is_empty() || !self.validators.is_empty()
                {
                    Ok(StepAction::Ui(&self.location))
                } else if let Some(case) = &self.testcase {
                    Ok(StepAction::TestCase(case))
                } else {
                    Err(invalid(
                        "is neither a location list nor a referenced testcase",
                    ))
                }
            }
            StepType::Sql => {
                if self.sql.is_empty() {
                    Err(invalid("SQL step declares no sql blocks"))
                } else {
                    Ok(StepAction::Sql(&self.sql))
                }
            }
        }
    }
}

/// HTTP request template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub cookies: BTreeMap<String, Value>,
    /// JSON body.
    #[serde(default, alias = "req_json")]
    pub json: Option<Value>,
    /// Form (object) or raw (string) body.
    #[serde(default)]
    pub data: Option<Value>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        })
    }
}

/// Pointer to a referenced test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaseRef {
    /// File path, relative to the project root unless absolute.
    Path(String),
    Inline(Box<TestCase>),
}

/// One UI interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiLocation {
    #[serde(default)]
    pub desc: Option<String>,
    /// Action name, checked against [`crate::ui::UiAction`].
    pub action: String,
    #[serde(default)]
    pub by: Option<Locator>,
    /// Locator expression (xpath, css selector, id, ...).
    #[serde(default)]
    pub value: Option<String>,
    /// Action input: text to type, URL to open, script to run.
    #[serde(default)]
    pub data: Option<Value>,
    /// Delay after the action, in seconds.
    #[serde(default)]
    pub sleep: f64,
}

/// Statements run against one datasource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlBlock {
    #[serde(default)]
    pub datasource: Option<String>,
    #[serde(default, alias = "statements")]
    pub dml: Vec<String>,
}

/// A setup/teardown hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Hook {
    /// `"${func()}"`, evaluated for its side effect.
    Expression(String),
    /// `{var: "${func()}"}`, result bound to `var`.
    Assignment { name: String, value: Value },
    /// Anything else; logged and skipped.
    Malformed(Value),
}

impl From<Value> for Hook {
    fn from(value: Value) -> Self {
        match value {
            Value::String(expr) => Hook::Expression(expr),
            Value::Object(map) if map.len() == 1 => {
                let mut entries = map.into_iter();
                match entries.next() {
                    Some((name, value)) => Hook::Assignment { name, value },
                    None => Hook::Malformed(Value::Null),
                }
            }
            other => Hook::Malformed(other),
        }
    }
}

impl From<Hook> for Value {
    fn from(hook: Hook) -> Self {
        match hook {
            Hook::Expression(expr) => Value::String(expr),
            Hook::Assignment { name, value } => {
                let mut map = Map::new();
                map.insert(name, value);
                Value::Object(map)
            }
            Hook::Malformed(value) => value,
        }
    }
}

/// A single assertion.
///
/// Accepted shapes: `{eq: [check, expect]}` (optional third item is
/// the message), `{check, assert, expect, message}` and
/// `[comparator, check, expect]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Validator {
    pub comparator: String,
    pub check: Value,
    pub expect: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TryFrom<Value> for Validator {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let message_of = |v: Option<&Value>| {
            v.and_then(Value::as_str).map(str::to_string)
        };

        match &value {
            Value::Array(items) if items.len() >= 3 => {
                let comparator = items[0]
                    .as_str()
                    .ok_or_else(|| format!("invalid validator: {value}"))?;
                Ok(Validator {
                    comparator: comparator.to_string(),
                    check: items[1].clone(),
                    expect: items[2].clone(),
                    message: message_of(items.get(3)),
                })
            }
            Value::Object(map) if map.contains_key("check") => {
                let comparator = map
                    .get("assert")
                    .or_else(|| map.get("comparator"))
                    .and_then(Value::as_str)
                    .unwrap_or("equal");
                Ok(Validator {
                    comparator: comparator.to_string(),
                    check: map["check"].clone(),
                    expect: map.get("expect").cloned().unwrap_or(Value::Null),
                    message: message_of(
                        map.get("message").or_else(|| map.get("msg")),
                    ),
                })
            }
            Value::Object(map) if map.len() == 1 => {
                let (comparator, args) = map
                    .iter()
                    .next()
                    .ok_or_else(|| format!("invalid validator: {value}"))?;
                match args {
                    Value::Array(args) if (2..=3).contains(&args.len()) => {
                        Ok(Validator {
                            comparator: comparator.clone(),
                            check: args[0].clone(),
                            expect: args[1].clone(),
                            message: message_of(args.get(2)),
                        })
                    }
                    _ => Err(format!(
                        "validator '{comparator}' expects [check, expect], \
                         got {args}"
                    )),
                }
            }
            _ => Err(format!("invalid validator: {value}")),
        }
    }
}

/// Step skip declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Skip {
    Flag(bool),
    /// A reason, `"True"`, or a `$variable` reference.
    Reason(String),
}

// ── execution records ────────────────────────────────

/// Record of one executed step. Never mutated after it is appended to
/// the run's step data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub export_vars: VariableMapping,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<StepDetail>,
}

impl StepData {
    pub fn new(name: &str, step_type: Option<StepType>) -> Self {
        Self {
            name: name.to_string(),
            step_type,
            success: false,
            error: None,
            duration_ms: 0,
            export_vars: VariableMapping::new(),
            detail: None,
        }
    }
}

/// Kind-specific trace of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDetail {
    Request(RequestTrace),
    Ui(UiTrace),
    Sql(SqlTrace),
    TestCase { steps: Vec<StepData> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTrace {
    pub request: RequestInfo,
    pub response: ResponseInfo,
    #[serde(default)]
    pub validators: Vec<ValidationResult>,
}

/// Captured HTTP request information for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Captured HTTP response information for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiTrace {
    pub locations: Vec<UiLocation>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Base64 screenshot taken when validation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub validators: Vec<ValidationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlTrace {
    pub statements: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    #[serde(default)]
    pub validators: Vec<ValidationResult>,
}

/// Outcome of one assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub comparator: String,
    pub check: Value,
    pub check_value: Value,
    pub expect: Value,
    pub expect_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub passed: bool,
}

/// Aggregate result of a top-level run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub name: String,
    pub success: bool,
    pub case_id: String,
    pub time: CaseTime,
    pub in_out: CaseInOut,
    #[serde(default)]
    pub log: Option<PathBuf>,
    /// The fatal error that stopped the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub step_datas: Vec<StepData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseTime {
    pub start_at: DateTime<Utc>,
    pub start_at_iso_format: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseInOut {
    pub config_vars: VariableMapping,
    pub export_vars: VariableMapping,
}
