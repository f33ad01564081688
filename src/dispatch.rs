//! Step dispatch: HTTP requests, UI interactions, SQL queries and
//! referenced test cases.

use crate::client::{HttpRequest, RequestBody};
use crate::db::{merge_rows, Row};
use crate::error::{Result, RunnerError};
use crate::extractor::extract;
use crate::hooks::call_hooks;
use crate::loader::TestCaseLoader;
use crate::model::*;
use crate::parser::{self, stringify};
use crate::response;
use crate::runner::CaseRunner;
use crate::ui::UiAction;
use crate::validator::{ensure_passed, validate};
use crate::variables::{merge_variables, VariableMapping};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

impl<'s> CaseRunner<'s> {
    /// Run one step. `extracted` holds what earlier steps of this run
    /// extracted.
    #[instrument(skip(self, step, extracted), fields(step = %step.name))]
    pub(crate) async fn run_step(
        &self,
        step: &Step,
        extracted: &VariableMapping,
    ) -> Result<StepData> {
        let action = step.action()?;
        debug!("run step begin: {} >>>>>>", step.name);

        // step variables > extracted variables > config variables
        let lower = merge_variables(extracted, &self.config.variables);
        let mut variables = parser::resolve_mapping_over(
            &step.variables,
            &lower,
            &self.meta.functions,
        )?;

        let step_data = match action {
            StepAction::Request(request) => {
                self.run_sql_prelude(step, &mut variables).await?;
                self.run_step_request(step, request, variables).await?
            }
            StepAction::Ui(locations) => {
                let result =
                    match self.run_sql_prelude(step, &mut variables).await {
                        Ok(()) => {
                            self.run_step_ui(step, locations, variables).await
                        }
                        Err(err) => Err(err),
                    };
                if !matches!(&result, Ok(data) if data.success) {
                    self.session.quit_driver().await;
                }
                result?
            }
            StepAction::Sql(blocks) => {
                self.run_step_sql(step, blocks, variables).await?
            }
            StepAction::TestCase(case) => {
                self.run_sql_prelude(step, &mut variables).await?;
                self.run_step_testcase(step, case, variables).await?
            }
        };

        debug!("run step end: {} <<<<<<", step.name);
        Ok(step_data)
    }

    // ── HTTP ─────────────────────────────────────────────

    async fn run_step_request(
        &self,
        step: &Step,
        request: &Request,
        mut variables: VariableMapping,
    ) -> Result<StepData> {
        let functions = &self.meta.functions;
        let mut step_data = StepData::new(&step.name, Some(StepType::Api));

        let request: Request =
            parser::resolve_as(request, &variables, functions)?;
        let http_request = self.build_request(&step.name, &request)?;

        variables.insert(
            "request".into(),
            response::request_context(&http_request),
        );
        call_hooks(
            &step.setup_hooks,
            &mut variables,
            functions,
            "setup request",
        )?;

        let http_response = self
            .session
            .http()
            .request(&http_request)
            .await
            .map_err(RunnerError::Http)?;
        debug!(
            "Received response with status: {}",
            http_response.status
        );

        variables.insert(
            "response".into(),
            response::response_context(&http_response),
        );
        call_hooks(
            &step.teardown_hooks,
            &mut variables,
            functions,
            "teardown request",
        )?;
        let context = variables.get("response").cloned().unwrap_or_default();

        let extracted = extract(&step.extract, &context, &variables, functions)?;
        variables.extend(extracted.clone());
        let results = validate(&step.validators, &context, &variables, functions)?;

        let request_info = RequestInfo {
            method: http_request.method.to_string(),
            url: http_request.url.clone(),
            headers: http_request.headers.clone().into_iter().collect(),
            body: http_request.body.as_ref().map(RequestBody::render),
        };
        let response_info = ResponseInfo {
            status: http_response.status,
            headers: http_response.headers.clone(),
            body: Some(http_response.body.clone()),
            elapsed_ms: http_response.elapsed_ms,
        };

        if let Err(failure) = ensure_passed(&results) {
            error!("{}", failure);
            log_request_details(&request_info, &response_info);
            step_data.error = Some(failure.to_string());
        } else {
            step_data.success = true;
        }

        step_data.export_vars = extracted;
        step_data.detail = Some(StepDetail::Request(RequestTrace {
            request: request_info,
            response: response_info,
            validators: results,
        }));
        Ok(step_data)
    }

    fn build_request(
        &self,
        step_name: &str,
        request: &Request,
    ) -> Result<HttpRequest> {
        let mut headers: BTreeMap<String, String> = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), stringify(v)))
            .collect();
        if !headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(REQUEST_ID_HEADER))
        {
            headers.insert(REQUEST_ID_HEADER.to_string(), self.request_id());
        }

        let body = match (&request.json, &request.data) {
            (Some(json), _) => Some(RequestBody::Json(json.clone())),
            (None, Some(Value::Object(fields))) => Some(RequestBody::Form(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), stringify(v)))
                    .collect(),
            )),
            (None, None | Some(Value::Null)) => None,
            (None, Some(raw)) => Some(RequestBody::Text(stringify(raw))),
        };

        Ok(HttpRequest {
            method: request.method,
            url: response::build_url(&self.config.base_url, &request.url)?,
            headers,
            params: request
                .params
                .iter()
                .map(|(k, v)| (k.clone(), stringify(v)))
                .collect(),
            cookies: request
                .cookies
                .iter()
                .map(|(k, v)| (k.clone(), stringify(v)))
                .collect(),
            body,
            timeout: match request.timeout {
                Some(secs) => seconds(step_name, "timeout", secs)?,
                None => None,
            },
            verify: self.config.verify,
        })
    }

    /// `<case_id>-<last 6 digits of the ms timestamp>`.
    fn request_id(&self) -> String {
        let millis = Utc::now().timestamp_millis().to_string();
        let tail = &millis[millis.len().saturating_sub(6)..];
        format!("{}-{}", self.case_id, tail)
    }

    // ── UI ───────────────────────────────────────────────

    async fn run_step_ui(
        &self,
        step: &Step,
        locations: &[UiLocation],
        mut variables: VariableMapping,
    ) -> Result<StepData> {
        let functions = &self.meta.functions;
        let mut step_data = StepData::new(&step.name, Some(StepType::Ui));
        let driver = self.session.ui_driver(&self.config.base_url).await?;

        call_hooks(&step.setup_hooks, &mut variables, functions, "setup ui")?;

        let mut performed = Vec::with_capacity(locations.len());
        for location in locations {
            let location: UiLocation =
                parser::resolve_as(location, &variables, functions)?;
            let action: UiAction = location.action.parse()?;
            info!(
                "UI {} {}",
                action,
                location.desc.as_deref().unwrap_or_default()
            );
            driver
                .perform(action, &location)
                .await
                .map_err(RunnerError::Ui)?;
            if let Some(delay) = seconds(&step.name, "sleep", location.sleep)? {
                tokio::time::sleep(delay).await;
            }
            performed.push(location);
        }

        call_hooks(
            &step.teardown_hooks,
            &mut variables,
            functions,
            "teardown ui",
        )?;

        let page = driver.snapshot().await.map_err(RunnerError::Ui)?;
        variables.insert("page".into(), page.clone());
        let extracted = extract(&step.extract, &page, &variables, functions)?;
        variables.extend(extracted.clone());
        let results = validate(&step.validators, &page, &variables, functions)?;

        let mut screenshot = None;
        if let Err(failure) = ensure_passed(&results) {
            error!("{}", failure);
            step_data.error = Some(failure.to_string());
            match driver.screenshot().await {
                Ok(image) => screenshot = Some(image),
                Err(e) => warn!("Failed to take screenshot: {:#}", e),
            }
        } else {
            step_data.success = true;
        }

        step_data.export_vars = extracted;
        step_data.detail = Some(StepDetail::Ui(UiTrace {
            locations: performed,
            session_id: driver.session_id(),
            screenshot,
            validators: results,
        }));
        Ok(step_data)
    }

    // ── SQL ──────────────────────────────────────────────

    async fn run_step_sql(
        &self,
        step: &Step,
        blocks: &[SqlBlock],
        mut variables: VariableMapping,
    ) -> Result<StepData> {
        let functions = &self.meta.functions;
        let mut step_data = StepData::new(&step.name, Some(StepType::Sql));

        call_hooks(&step.setup_hooks, &mut variables, functions, "setup sql")?;
        let (statements, rows) =
            self.execute_sql(step, blocks, &mut variables).await?;
        call_hooks(
            &step.teardown_hooks,
            &mut variables,
            functions,
            "teardown sql",
        )?;

        let context = response::rows_context(&rows);
        let extracted = extract(&step.extract, &context, &variables, functions)?;
        variables.extend(extracted.clone());
        let results = validate(&step.validators, &context, &variables, functions)?;

        if let Err(failure) = ensure_passed(&results) {
            error!("{}", failure);
            step_data.error = Some(failure.to_string());
        } else {
            step_data.success = true;
        }

        step_data.export_vars = extracted;
        step_data.detail = Some(StepDetail::Sql(SqlTrace {
            statements,
            rows,
            validators: results,
        }));
        Ok(step_data)
    }

    /// Run the `sql` blocks of an API or UI step into its variables.
    async fn run_sql_prelude(
        &self,
        step: &Step,
        variables: &mut VariableMapping,
    ) -> Result<()> {
        if step.sql.is_empty() {
            return Ok(());
        }
        debug!("Running {} sql blocks before '{}'", step.sql.len(), step.name);
        self.execute_sql(step, &step.sql, variables).await?;
        Ok(())
    }

    /// Execute `blocks`, merging every row into `variables`.
    ///
    /// Every datasource is checked before the first statement runs.
    async fn execute_sql(
        &self,
        step: &Step,
        blocks: &[SqlBlock],
        variables: &mut VariableMapping,
    ) -> Result<(Vec<String>, Vec<Row>)> {
        let mut targets = Vec::with_capacity(blocks.len());
        for block in blocks {
            let datasource = block
                .datasource
                .as_deref()
                .filter(|d| !d.trim().is_empty())
                .or(self.config.datasource.as_deref())
                .filter(|d| !d.trim().is_empty())
                .ok_or_else(|| RunnerError::MissingDatasource(step.name.clone()))?;
            let key = datasource.trim().to_ascii_uppercase();
            let url = self
                .meta
                .env_var(&key)
                .ok_or_else(|| RunnerError::DatasourceNotFound(key.clone()))?;
            targets.push((key, url, block));
        }
        let connector = self.session.database()?;

        let functions = &self.meta.functions;
        let mut statements = Vec::new();
        let mut all_rows = Vec::new();
        for (key, url, block) in targets {
            debug!("Connecting to datasource {}", key);
            let database = connector
                .connect(&url)
                .await
                .map_err(RunnerError::Database)?;
            for dml in &block.dml {
                let statement =
                    stringify(&parser::resolve_string(dml, variables, functions)?);
                debug!("Execute SQL: {}", statement);
                let rows = database
                    .fetch_all(&statement)
                    .await
                    .map_err(RunnerError::Database)?;
                merge_rows(&rows, variables);
                statements.push(statement);
                all_rows.extend(rows);
            }
        }
        Ok((statements, all_rows))
    }

    // ── referenced testcase ──────────────────────────────

    async fn run_step_testcase(
        &self,
        step: &Step,
        case_ref: &CaseRef,
        mut variables: VariableMapping,
    ) -> Result<StepData> {
        let functions = &self.meta.functions;
        let mut step_data = StepData::new(&step.name, step.kind().ok());

        call_hooks(
            &step.setup_hooks,
            &mut variables,
            functions,
            "setup testcase",
        )?;

        let loaded;
        let testcase = match case_ref {
            CaseRef::Inline(testcase) => testcase.as_ref(),
            CaseRef::Path(raw) => {
                let relative =
                    stringify(&parser::resolve_string(raw, &variables, functions)?);
                let path = self.meta.resolve_path(&relative);
                if !path.is_file() {
                    return Err(RunnerError::InvalidTestCaseRef(
                        path.display().to_string(),
                    ));
                }
                loaded = TestCaseLoader::new()
                    .load_testcase(&path)
                    .map_err(|reason| RunnerError::Load {
                        path: path.clone(),
                        reason,
                    })?;
                &loaded
            }
        };

        let mut nested = self.nested(variables.clone(), step.export.clone());
        let success = nested.run_case(testcase).await?;

        call_hooks(
            &step.teardown_hooks,
            &mut variables,
            functions,
            "teardown testcase",
        )?;

        step_data.success = success;
        step_data.export_vars = if success {
            nested.export_variables()?
        } else {
            step_data.error = Some(format!(
                "referenced testcase '{}' failed",
                nested.config().name
            ));
            nested.bound_exports()
        };
        if !step_data.export_vars.is_empty() {
            info!("export variables: {:?}", step_data.export_vars);
        }
        step_data.detail = Some(StepDetail::TestCase {
            steps: nested.into_step_datas(),
        });
        Ok(step_data)
    }
}

/// A duration given in seconds. Zero, negative and NaN mean none; a
/// value `Duration` cannot hold is an invalid step.
fn seconds(
    step_name: &str,
    field: &str,
    secs: f64,
) -> Result<Option<Duration>> {
    if secs.is_nan() || secs <= 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| RunnerError::InvalidStep {
            step: step_name.to_string(),
            reason: format!("{field} of {secs} seconds: {e}"),
        })
}

fn log_request_details(request: &RequestInfo, response: &ResponseInfo) {
    error!("====== request details ======");
    error!("{} {}", request.method, request.url);
    error!("headers: {:?}", request.headers);
    if let Some(body) = &request.body {
        error!("body: {}", body);
    }
    error!("====== response details ======");
    error!("status_code: {}", response.status);
    error!("headers: {:?}", response.headers);
    if let Some(body) = &response.body {
        error!("body: {}", body);
    }
}
