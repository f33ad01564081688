//! Test case execution.

use crate::client::{HttpClient, ReqwestClient};
use crate::db::DatabaseConnector;
use crate::error::{Result, RunnerError};
use crate::hooks::call_hooks;
use crate::logging::RunLog;
use crate::model::*;
use crate::parser;
use crate::project::ProjectMeta;
use crate::session::{RunMode, Session};
use crate::ui::UiDriverFactory;
use crate::variables::{merge_variables, VariableMapping};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs one test case against a borrowed [`Session`].
///
/// A referenced test case is run by a nested `CaseRunner` that shares
/// the caller's session and case id and returns only its exports.
pub struct CaseRunner<'s> {
    pub(crate) session: &'s Session,
    pub(crate) meta: &'s ProjectMeta,
    pub(crate) case_id: String,
    is_referenced: bool,
    session_variables: VariableMapping,
    export: Vec<String>,
    pub(crate) config: Config,
    success: bool,
    step_datas: Vec<StepData>,
    start_at: DateTime<Utc>,
    duration_ms: u64,
    log_path: Option<PathBuf>,
}

impl<'s> CaseRunner<'s> {
    pub fn new(session: &'s Session, meta: &'s ProjectMeta) -> Self {
        Self {
            session,
            meta,
            case_id: Uuid::new_v4().to_string(),
            is_referenced: false,
            session_variables: VariableMapping::new(),
            export: Vec::new(),
            config: Config::default(),
            success: false,
            step_datas: Vec::new(),
            start_at: Utc::now(),
            duration_ms: 0,
            log_path: None,
        }
    }

    pub fn with_case_id(mut self, case_id: &str) -> Self {
        self.case_id = case_id.to_string();
        self
    }

    /// Variables carried in from the caller; lowest precedence.
    pub fn with_variables(mut self, variables: VariableMapping) -> Self {
        self.session_variables = variables;
        self
    }

    /// Export names overriding `config.export`.
    pub fn with_export(mut self, export: Vec<String>) -> Self {
        self.export = export;
        self
    }

    pub fn with_log_path(mut self, log_path: Option<PathBuf>) -> Self {
        self.log_path = log_path;
        self
    }

    /// Runner for a referenced test case of this run.
    pub(crate) fn nested(
        &self,
        variables: VariableMapping,
        export: Vec<String>,
    ) -> CaseRunner<'s> {
        let mut runner = CaseRunner::new(self.session, self.meta)
            .with_case_id(&self.case_id)
            .with_variables(variables)
            .with_export(export);
        runner.is_referenced = true;
        runner
    }

    /// The parsed configuration of the last run.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn into_step_datas(self) -> Vec<StepData> {
        self.step_datas
    }

    /// Run `testcase` to completion.
    ///
    /// Returns `Ok(false)` when a step failed validation; any other
    /// failure is returned as an error after a failed step record has
    /// been appended.
    pub fn run_case<'a>(
        &'a mut self,
        testcase: &'a TestCase,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.success = true;
            self.step_datas.clear();
            self.duration_ms = 0;
            self.start_at = Utc::now();
            let started = Instant::now();

            self.config = self.parse_config(&testcase.config)?;
            info!(
                "Start to run testcase: {}, TestCase ID: {}",
                self.config.name, self.case_id
            );

            let meta = self.meta;
            let functions = &meta.functions;
            call_hooks(
                &testcase.config.setup_hooks,
                &mut self.config.variables,
                functions,
                "setup testcase",
            )?;

            if self.session.mode() == RunMode::Ui && !self.is_referenced {
                self.session.ui_driver(&self.config.base_url).await?;
            }

            let mut extracted = VariableMapping::new();
            let total = testcase.teststeps.len();
            for (idx, step) in testcase.teststeps.iter().enumerate() {
                if let Some(reason) = self.skip_reason(step, &extracted) {
                    info!("Skip step {}: {} ({})", idx + 1, step.name, reason);
                    continue;
                }
                info!("Running step {}/{}: {}", idx + 1, total, step.name);

                let step_started = Instant::now();
                match self.run_step(step, &extracted).await {
                    Ok(mut step_data) => {
                        step_data.duration_ms =
                            step_started.elapsed().as_millis() as u64;
                        let step_success = step_data.success;
                        extracted.extend(step_data.export_vars.clone());
                        self.step_datas.push(step_data);

                        if !step_success {
                            self.success = false;
                            info!("Stopping testcase due to step failure");
                            break;
                        }
                    }
                    Err(err) => {
                        let mut step_data =
                            StepData::new(&step.name, step.kind().ok());
                        step_data.error = Some(err.to_string());
                        step_data.duration_ms =
                            step_started.elapsed().as_millis() as u64;
                        self.step_datas.push(step_data);
                        self.success = false;
                        self.duration_ms = started.elapsed().as_millis() as u64;
                        error!("Step '{}' aborted: {}", step.name, err);
                        return Err(err);
                    }
                }
            }

            self.duration_ms = started.elapsed().as_millis() as u64;

            if !testcase.config.teardown_hooks.is_empty() {
                let mut scope =
                    merge_variables(&extracted, &self.config.variables);
                call_hooks(
                    &testcase.config.teardown_hooks,
                    &mut scope,
                    functions,
                    "teardown testcase",
                )?;
                for hook in &testcase.config.teardown_hooks {
                    if let Hook::Assignment { name, .. } = hook {
                        if let Some(value) = scope.get(name) {
                            extracted.insert(name.clone(), value.clone());
                        }
                    }
                }
            }

            self.session_variables.extend(extracted);
            info!(
                "Testcase finished: {} ({} ms) - Success: {}",
                self.config.name, self.duration_ms, self.success
            );
            Ok(self.success)
        })
    }

    /// Resolve config variables over the session variables, then the
    /// name and base URL.
    fn parse_config(&self, config: &Config) -> Result<Config> {
        let functions = &self.meta.functions;
        let mut parsed = config.clone();
        parsed.variables = parser::resolve_mapping_over(
            &config.variables,
            &self.session_variables,
            functions,
        )?;
        parsed.name = parser::stringify(&parser::resolve_string(
            &config.name,
            &parsed.variables,
            functions,
        )?);
        parsed.base_url = parser::stringify(&parser::resolve_string(
            &config.base_url,
            &parsed.variables,
            functions,
        )?);
        Ok(parsed)
    }

    /// Why `step` is skipped, if it is.
    fn skip_reason(
        &self,
        step: &Step,
        extracted: &VariableMapping,
    ) -> Option<String> {
        match step.skip.as_ref()? {
            Skip::Flag(true) => Some("skip: true".to_string()),
            Skip::Flag(false) => None,
            Skip::Reason(reason) => {
                let reason = reason.trim();
                if let Some(name) = variable_reference(reason) {
                    let scope = merge_variables(
                        &step.variables,
                        &merge_variables(
                            extracted,
                            &merge_variables(
                                &self.config.variables,
                                &self.session_variables,
                            ),
                        ),
                    );
                    match scope.get(name) {
                        Some(Value::String(s)) if s == "True" => {
                            Some(format!("{name} = True"))
                        }
                        Some(Value::Bool(true)) => {
                            Some(format!("{name} = true"))
                        }
                        _ => None,
                    }
                } else if reason.is_empty()
                    || reason == "False"
                    || reason == "false"
                {
                    None
                } else {
                    Some(reason.to_string())
                }
            }
        }
    }

    /// Exports declared by the caller, else by `config.export`.
    ///
    /// A name missing from the session variables is an error.
    pub fn export_variables(&self) -> Result<VariableMapping> {
        let mut exported = VariableMapping::new();
        for name in self.export_names() {
            let value = self.session_variables.get(name).ok_or_else(|| {
                let mut available: Vec<String> =
                    self.session_variables.keys().cloned().collect();
                available.sort();
                RunnerError::ExportNotFound {
                    name: name.clone(),
                    available,
                }
            })?;
            exported.insert(name.clone(), value.clone());
        }
        Ok(exported)
    }

    /// Whichever declared exports are bound.
    pub(crate) fn bound_exports(&self) -> VariableMapping {
        self.export_names()
            .iter()
            .filter_map(|name| {
                self.session_variables
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    fn export_names(&self) -> &[String] {
        if self.export.is_empty() {
            &self.config.export
        } else {
            &self.export
        }
    }

    /// Summary of the last run. Exports are strict only when the run
    /// succeeded.
    pub fn summary(&self) -> Result<RunSummary> {
        let export_vars = if self.success {
            self.export_variables()?
        } else {
            self.bound_exports()
        };
        Ok(self.build_summary(self.success, export_vars, None))
    }

    /// Summary of a run stopped by `error`: unsuccessful, with whichever
    /// exports are bound and every step recorded so far.
    pub fn aborted_summary(&self, error: &RunnerError) -> RunSummary {
        self.build_summary(false, self.bound_exports(), Some(error.to_string()))
    }

    fn build_summary(
        &self,
        success: bool,
        export_vars: VariableMapping,
        error: Option<String>,
    ) -> RunSummary {
        RunSummary {
            name: self.config.name.clone(),
            success,
            case_id: self.case_id.clone(),
            time: CaseTime {
                start_at: self.start_at,
                start_at_iso_format: self.start_at.to_rfc3339(),
                duration_ms: self.duration_ms,
            },
            in_out: CaseInOut {
                config_vars: self.config.variables.clone(),
                export_vars,
            },
            log: self.log_path.clone(),
            error,
            step_datas: self.step_datas.clone(),
        }
    }
}

/// `name` for `"$name"` or `"${name}"`.
fn variable_reference(text: &str) -> Option<&str> {
    let rest = text.strip_prefix('$')?;
    let name = rest
        .strip_prefix('{')
        .and_then(|r| r.strip_suffix('}'))
        .unwrap_or(rest);
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then_some(name)
}

/// Test runner trait
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Execute a test case
    ///
    /// A fatal error is returned as [`RunnerError::Aborted`], which
    /// carries the execution record up to the failing step.
    async fn run(&self, testcase: &TestCase) -> Result<RunSummary>;
}

/// Default test runner
///
/// Owns the collaborators of every top-level run. Each call to
/// [`TestRunner::run`] gets a fresh [`Session`], which is closed when
/// the run ends whether it succeeded or not.
pub struct DefaultTestRunner {
    meta: Arc<ProjectMeta>,
    http: Arc<dyn HttpClient>,
    ui_factory: Option<Arc<dyn UiDriverFactory>>,
    database: Option<Arc<dyn DatabaseConnector>>,
    mode: RunMode,
    log_dir: Option<PathBuf>,
    variables: VariableMapping,
}

impl DefaultTestRunner {
    /// Create a new test runner rooted at the current directory
    pub fn new() -> Self {
        Self {
            meta: Arc::new(ProjectMeta::new(".")),
            http: Arc::new(ReqwestClient::new()),
            ui_factory: None,
            database: None,
            mode: RunMode::Api,
            log_dir: None,
            variables: VariableMapping::new(),
        }
    }

    /// Create a new test runner with a custom client
    pub fn with_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = client;
        self
    }

    pub fn with_project_meta(mut self, meta: ProjectMeta) -> Self {
        self.meta = Arc::new(meta);
        self
    }

    pub fn with_ui_driver_factory(
        mut self,
        factory: Arc<dyn UiDriverFactory>,
    ) -> Self {
        self.ui_factory = Some(factory);
        self
    }

    pub fn with_database(
        mut self,
        connector: Arc<dyn DatabaseConnector>,
    ) -> Self {
        self.database = Some(connector);
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Write one `<case_id>.run.log` per run into `dir`.
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Session variables every run starts with.
    pub fn with_variables(mut self, variables: VariableMapping) -> Self {
        self.variables = variables;
        self
    }
}

impl Default for DefaultTestRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestRunner for DefaultTestRunner {
    #[instrument(skip(self, testcase), fields(name = %testcase.config.name))]
    async fn run(&self, testcase: &TestCase) -> Result<RunSummary> {
        let case_id = Uuid::new_v4().to_string();
        let session = Session::new(
            self.http.clone(),
            self.ui_factory.clone(),
            self.database.clone(),
            self.mode,
        );

        let log = match &self.log_dir {
            Some(dir) => match RunLog::create(dir, &case_id) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("Run log disabled: {:#}", e);
                    None
                }
            },
            None => None,
        };

        let mut runner = CaseRunner::new(&session, &self.meta)
            .with_case_id(&case_id)
            .with_variables(self.variables.clone())
            .with_log_path(log.as_ref().map(|l| l.path().to_path_buf()));

        let outcome = match &log {
            Some(log) => {
                runner
                    .run_case(testcase)
                    .with_subscriber(log.dispatch())
                    .await
            }
            None => runner.run_case(testcase).await,
        };

        session.quit_driver().await;
        if let Some(log) = &log {
            debug!("Generated testcase log: {}", log.path().display());
        }

        outcome.and_then(|_| runner.summary()).map_err(|error| {
            let mut summary = runner.aborted_summary(&error);
            if summary.name.is_empty() {
                summary.name = testcase.config.name.clone();
            }
            RunnerError::Aborted {
                error: Box::new(error),
                summary: Box::new(summary),
            }
        })
    }
}
