use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use autorunner::{
    Database, DatabaseConnector, DefaultTestRunner, FunctionRegistry,
    HttpClient, HttpRequest, HttpResponse, ProjectMeta, Row, RunMode,
    RunnerError, StepDetail, TestCase, TestRunner, UiAction, UiDriver,
    UiDriverFactory, UiLocation, VariableMapping,
};
use serde_json::{json, Value};

// ── collaborators ───────────────────────────────────────

#[derive(Default)]
struct RecordingHttp {
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingHttp {
    fn urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }
}

#[async_trait]
impl HttpClient for RecordingHttp {
    async fn request(
        &self,
        request: &HttpRequest,
    ) -> anyhow::Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(HttpResponse {
            status: 200,
            body: json!({
                "pong": true,
                "url": request.url,
                "method": request.method.to_string(),
            })
            .to_string(),
            url: request.url.clone(),
            ..HttpResponse::default()
        })
    }
}

#[derive(Default)]
struct UiLog {
    created: usize,
    opened: Vec<String>,
    performed: Vec<UiAction>,
    quit: usize,
}

struct FakeDriver {
    log: Arc<Mutex<UiLog>>,
}

#[async_trait]
impl UiDriver for FakeDriver {
    async fn open(&self, url: &str) -> anyhow::Result<()> {
        self.log.lock().unwrap().opened.push(url.to_string());
        Ok(())
    }

    async fn perform(
        &self,
        action: UiAction,
        _location: &UiLocation,
    ) -> anyhow::Result<()> {
        self.log.lock().unwrap().performed.push(action);
        Ok(())
    }

    async fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(json!({"title": "Dashboard", "url": "http://app.test/home"}))
    }

    async fn screenshot(&self) -> anyhow::Result<String> {
        Ok("aW1hZ2U=".to_string())
    }

    fn session_id(&self) -> Option<String> {
        Some("fake-session".to_string())
    }

    async fn quit(&self) -> anyhow::Result<()> {
        self.log.lock().unwrap().quit += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FakeDriverFactory {
    log: Arc<Mutex<UiLog>>,
}

#[async_trait]
impl UiDriverFactory for FakeDriverFactory {
    async fn create(&self) -> anyhow::Result<Box<dyn UiDriver>> {
        self.log.lock().unwrap().created += 1;
        Ok(Box::new(FakeDriver {
            log: self.log.clone(),
        }))
    }
}

#[derive(Default)]
struct FakeDatabase {
    connected: Arc<Mutex<Vec<String>>>,
    executed: Arc<Mutex<Vec<String>>>,
}

struct FakeConnection {
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Database for FakeConnection {
    async fn fetch_all(&self, statement: &str) -> anyhow::Result<Vec<Row>> {
        self.executed.lock().unwrap().push(statement.to_string());
        let mut row = Row::new();
        row.insert("user_id".into(), json!(7));
        row.insert("status".into(), json!("active"));
        Ok(vec![row])
    }
}

#[async_trait]
impl DatabaseConnector for FakeDatabase {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn Database>> {
        self.connected.lock().unwrap().push(url.to_string());
        Ok(Box::new(FakeConnection {
            executed: self.executed.clone(),
        }))
    }
}

// ── helpers ─────────────────────────────────────────────

fn testcase(yaml: &str) -> TestCase {
    TestCase::from_yaml(yaml)
        .unwrap_or_else(|e| panic!("failed to parse testcase yaml: {e}"))
}

fn api_runner(http: &Arc<RecordingHttp>) -> DefaultTestRunner {
    DefaultTestRunner::new().with_client(http.clone())
}

// ── API ─────────────────────────────────────────────────

#[tokio::test]
async fn test_ping_exports_extracted_value() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config:
  name: ping
  base_url: http://api.test
  export: [pong]
teststeps:
  - name: ping
    request: {method: GET, url: /ping}
    extract: {pong: body.pong}
    validate:
      - eq: [status_code, 200]
"#,
    );

    let result = api_runner(&http).run(&case).await.unwrap();
    assert!(result.success);
    assert_eq!(result.in_out.export_vars["pong"], json!(true));
    assert_eq!(http.urls(), vec!["http://api.test/ping".to_string()]);
}

#[tokio::test]
async fn test_skip_by_variable_reference() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config:
  name: skipping
  base_url: http://api.test
  variables: {skip: "True", keep: false}
teststeps:
  - name: skipped
    skip: $skip
    request: {method: GET, url: /skipped}
  - name: not skipped
    skip: $keep
    request: {method: GET, url: /kept}
  - name: skipped with reason
    skip: not deployed yet
    request: {method: GET, url: /reason}
"#,
    );

    let result = api_runner(&http).run(&case).await.unwrap();
    assert!(result.success);
    assert_eq!(result.step_datas.len(), 1);
    assert_eq!(result.step_datas[0].name, "not skipped");
    assert_eq!(http.urls(), vec!["http://api.test/kept".to_string()]);
}

#[tokio::test]
async fn test_variable_precedence() {
    let http = Arc::new(RecordingHttp::default());
    let session: VariableMapping = [
        ("user".to_string(), json!("session")),
        ("region".to_string(), json!("eu")),
    ]
    .into_iter()
    .collect();
    let case = testcase(
        r#"
config:
  name: precedence
  base_url: http://api.test
  variables: {user: config}
teststeps:
  - name: config wins over session
    request: {method: GET, url: "/$region/$user"}
    extract: {user: body.method}
  - name: extracted wins over config
    request: {method: GET, url: "/$user"}
  - name: step wins over extracted
    variables: {user: step}
    request: {method: GET, url: "/$user"}
"#,
    );

    let result = api_runner(&http)
        .with_variables(session)
        .run(&case)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(
        http.urls(),
        vec![
            "http://api.test/eu/config".to_string(),
            "http://api.test/GET".to_string(),
            "http://api.test/step".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_missing_export_is_an_error() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config:
  name: exports
  base_url: http://api.test
  export: [token]
teststeps:
  - name: ping
    request: {method: GET, url: /ping}
    extract: {pong: body.pong}
"#,
    );

    let err = api_runner(&http).run(&case).await.unwrap_err();
    match err.cause() {
        RunnerError::ExportNotFound { name, available } => {
            assert_eq!(name, "token");
            assert!(available.contains(&"pong".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unknown_step_type_aborts_run() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config: {name: bad type, base_url: http://api.test}
teststeps:
  - name: grpc
    step_type: GRPC
    request: {method: GET, url: /x}
"#,
    );

    let err = api_runner(&http).run(&case).await.unwrap_err();
    assert!(matches!(err.cause(), RunnerError::UnknownStepType { .. }));
    assert!(http.urls().is_empty());
}

#[tokio::test]
async fn test_teardown_hook_assignment_is_exported() {
    let http = Arc::new(RecordingHttp::default());
    let mut functions = FunctionRegistry::with_builtins();
    functions.register("shout", |args| {
        let text = args.first().and_then(Value::as_str).unwrap_or_default();
        Ok(json!(text.to_uppercase()))
    });
    let case = testcase(
        r#"
config:
  name: teardown
  base_url: http://api.test
  variables: {word: quiet}
  export: [loud]
  teardown_hooks:
    - {loud: "${shout($word)}"}
teststeps:
  - name: ping
    request: {method: GET, url: /ping}
"#,
    );

    let result = api_runner(&http)
        .with_project_meta(ProjectMeta::new(".").with_functions(functions))
        .run(&case)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.in_out.export_vars["loud"], json!("QUIET"));
}

#[tokio::test]
async fn test_aborted_run_keeps_step_records() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config:
  name: aborted
  base_url: http://api.test
  export: [pong]
teststeps:
  - name: ping
    request: {method: GET, url: /ping}
    extract: {pong: body.pong}
  - name: unbound
    request: {method: GET, url: /$missing}
  - name: never runs
    request: {method: GET, url: /after}
"#,
    );

    let err = api_runner(&http).run(&case).await.unwrap_err();
    assert!(matches!(
        err.cause(),
        RunnerError::UnresolvedVariable(name) if name == "missing"
    ));

    let summary = err.partial_summary().expect("aborted run keeps its record");
    assert!(!summary.success);
    assert_eq!(summary.name, "aborted");
    assert_eq!(summary.step_datas.len(), 2);
    assert!(summary.step_datas[0].success);
    assert!(!summary.step_datas[1].success);
    assert!(summary.step_datas[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("missing")));
    assert!(summary.error.as_deref().is_some_and(|e| e.contains("missing")));
    assert_eq!(summary.in_out.export_vars["pong"], json!(true));
    assert_eq!(http.urls(), vec!["http://api.test/ping".to_string()]);
}

#[tokio::test]
async fn test_huge_timeout_is_an_invalid_step() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config: {name: timeouts, base_url: http://api.test}
teststeps:
  - name: forever
    request: {method: GET, url: /ping, timeout: 1.0e30}
"#,
    );

    let err = api_runner(&http).run(&case).await.unwrap_err();
    assert!(matches!(
        err.cause(),
        RunnerError::InvalidStep { step, .. } if step == "forever"
    ));
    assert!(http.urls().is_empty());
}

// ── referenced testcase ─────────────────────────────────

#[tokio::test]
async fn test_inline_testcase_exports_into_caller() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config:
  name: caller
  base_url: http://api.test
  variables: {who: caller}
teststeps:
  - name: nested
    variables: {who: nested}
    export: [seen]
    testcase:
      config:
        name: inner
        base_url: http://inner.test
        variables: {who: $who}
      teststeps:
        - name: inner ping
          request: {method: GET, url: "/$who"}
          extract: {seen: body.url}
  - name: use export
    request: {method: GET, url: /after}
    validate:
      - eq: [status_code, 200]
      - endswith: [$seen, /nested]
"#,
    );

    let result = api_runner(&http).run(&case).await.unwrap();
    assert!(result.success, "{:?}", result.step_datas);
    assert_eq!(
        result.step_datas[0].export_vars["seen"],
        json!("http://inner.test/nested")
    );
    assert!(matches!(
        result.step_datas[0].detail,
        Some(StepDetail::TestCase { ref steps }) if steps.len() == 1
    ));
}

#[tokio::test]
async fn test_failed_inline_testcase_fails_step() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config: {name: caller, base_url: http://api.test}
teststeps:
  - name: nested
    export: [seen]
    testcase:
      config: {name: inner, base_url: http://inner.test}
      teststeps:
        - name: inner ping
          request: {method: GET, url: /inner}
          extract: {seen: body.url}
          validate:
            - eq: [status_code, 500]
  - name: never runs
    request: {method: GET, url: /after}
"#,
    );

    let result = api_runner(&http).run(&case).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.step_datas.len(), 1);
    assert!(!result.step_datas[0].success);
    assert_eq!(http.urls(), vec!["http://inner.test/inner".to_string()]);
}

#[tokio::test]
async fn test_missing_testcase_file_is_an_error() {
    let http = Arc::new(RecordingHttp::default());
    let dir = tempfile::tempdir().unwrap();
    let case = testcase(
        r#"
config: {name: caller, base_url: http://api.test}
teststeps:
  - name: nested
    testcase: cases/missing.yml
"#,
    );

    let err = api_runner(&http)
        .with_project_meta(ProjectMeta::new(dir.path()))
        .run(&case)
        .await
        .unwrap_err();
    assert!(matches!(err.cause(), RunnerError::InvalidTestCaseRef(_)));
}

// ── SQL ─────────────────────────────────────────────────

#[tokio::test]
async fn test_sql_step_merges_rows() {
    let http = Arc::new(RecordingHttp::default());
    let database = Arc::new(FakeDatabase::default());
    let case = testcase(
        r#"
config:
  name: sql
  base_url: http://api.test
  datasource: demo_db
  variables: {status: active}
teststeps:
  - name: rows
    step_type: SQL
    sql:
      - dml: ["select * from users where status = '$status'"]
    extract: {count: row_count}
    validate:
      - eq: [rows[0].user_id, 7]
  - name: api with sql prelude
    sql:
      - datasource: demo_db
        dml: ["select id from users"]
    request: {method: GET, url: "/users/$user_id"}
"#,
    );

    let result = api_runner(&http)
        .with_database(database.clone())
        .with_project_meta(
            ProjectMeta::new(".").with_env("DEMO_DB", "mock://demo"),
        )
        .run(&case)
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.step_datas);
    assert_eq!(result.step_datas[0].export_vars["count"], json!(1));
    assert_eq!(
        *database.executed.lock().unwrap(),
        vec![
            "select * from users where status = 'active'".to_string(),
            "select id from users".to_string(),
        ]
    );
    assert_eq!(
        *database.connected.lock().unwrap(),
        vec!["mock://demo".to_string(), "mock://demo".to_string()]
    );
    assert_eq!(http.urls(), vec!["http://api.test/users/7".to_string()]);
}

#[tokio::test]
async fn test_unmapped_datasource_fails_before_any_statement() {
    let http = Arc::new(RecordingHttp::default());
    let database = Arc::new(FakeDatabase::default());
    let case = testcase(
        r#"
config: {name: sql, base_url: http://api.test}
teststeps:
  - name: rows
    step_type: SQL
    sql:
      - datasource: demo_db
        dml: ["select 1"]
      - datasource: autorunner_unmapped_db
        dml: ["select 2"]
"#,
    );

    let err = api_runner(&http)
        .with_database(database.clone())
        .with_project_meta(
            ProjectMeta::new(".").with_env("DEMO_DB", "mock://demo"),
        )
        .run(&case)
        .await
        .unwrap_err();
    assert!(matches!(
        err.cause(),
        RunnerError::DatasourceNotFound(key) if key == "AUTORUNNER_UNMAPPED_DB"
    ));
    assert!(database.executed.lock().unwrap().is_empty());
    assert!(database.connected.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sql_without_datasource_is_an_error() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config: {name: sql, base_url: http://api.test}
teststeps:
  - name: rows
    step_type: SQL
    sql:
      - dml: ["select 1"]
"#,
    );

    let err = api_runner(&http)
        .with_database(Arc::new(FakeDatabase::default()))
        .run(&case)
        .await
        .unwrap_err();
    assert!(matches!(
        err.cause(),
        RunnerError::MissingDatasource(step) if step == "rows"
    ));
}

// ── UI ──────────────────────────────────────────────────

#[tokio::test]
async fn test_ui_step_runs_locations_and_validates_page() {
    let http = Arc::new(RecordingHttp::default());
    let factory = Arc::new(FakeDriverFactory::default());
    let case = testcase(
        r#"
config: {name: ui, base_url: http://app.test}
teststeps:
  - name: login form
    step_type: UI
    location:
      - {action: input, by: id, value: username, data: alice}
      - {action: click, by: xpath, value: "//button[@type='submit']"}
    extract: {title: title}
    validate:
      - eq: [title, Dashboard]
"#,
    );

    let result = api_runner(&http)
        .with_ui_driver_factory(factory.clone())
        .run(&case)
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.step_datas);
    assert_eq!(result.step_datas[0].export_vars["title"], json!("Dashboard"));

    let log = factory.log.lock().unwrap();
    assert_eq!(log.created, 1);
    assert_eq!(log.opened, vec!["http://app.test".to_string()]);
    assert_eq!(log.performed, vec![UiAction::Input, UiAction::Click]);
    assert_eq!(log.quit, 1);
}

#[tokio::test]
async fn test_unknown_ui_action_quits_driver() {
    let http = Arc::new(RecordingHttp::default());
    let factory = Arc::new(FakeDriverFactory::default());
    let case = testcase(
        r#"
config: {name: ui, base_url: http://app.test}
teststeps:
  - name: bad action
    step_type: UI
    location:
      - {action: click, by: id, value: go}
      - {action: teleport, by: id, value: elsewhere}
"#,
    );

    let err = api_runner(&http)
        .with_ui_driver_factory(factory.clone())
        .run(&case)
        .await
        .unwrap_err();
    match err.cause() {
        RunnerError::UnknownUiAction { action, supported } => {
            assert_eq!(action, "teleport");
            assert!(supported.contains("click"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let log = factory.log.lock().unwrap();
    assert_eq!(log.performed, vec![UiAction::Click]);
    assert_eq!(log.quit, 1);
}

#[tokio::test]
async fn test_failed_ui_validation_quits_driver_and_keeps_screenshot() {
    let http = Arc::new(RecordingHttp::default());
    let factory = Arc::new(FakeDriverFactory::default());
    let case = testcase(
        r#"
config: {name: ui, base_url: http://app.test}
teststeps:
  - name: wrong page
    step_type: UI
    location:
      - {action: click, by: id, value: go}
    validate:
      - eq: [title, Nope]
  - name: never runs
    step_type: UI
    location:
      - {action: refresh}
"#,
    );

    let result = api_runner(&http)
        .with_ui_driver_factory(factory.clone())
        .run(&case)
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.step_datas.len(), 1);
    match &result.step_datas[0].detail {
        Some(StepDetail::Ui(trace)) => {
            assert_eq!(trace.screenshot.as_deref(), Some("aW1hZ2U="));
            assert_eq!(trace.session_id.as_deref(), Some("fake-session"));
            assert!(!trace.validators[0].passed);
        }
        other => panic!("unexpected detail: {other:?}"),
    }

    let log = factory.log.lock().unwrap();
    assert_eq!(log.performed, vec![UiAction::Click]);
    assert_eq!(log.quit, 1);
}

#[tokio::test]
async fn test_nested_ui_steps_share_the_callers_driver() {
    let http = Arc::new(RecordingHttp::default());
    let factory = Arc::new(FakeDriverFactory::default());
    let case = testcase(
        r#"
config: {name: ui flow, base_url: http://app.test}
teststeps:
  - name: open menu
    step_type: UI
    location:
      - {action: click, by: id, value: menu}
  - name: fill profile
    step_type: UI
    testcase:
      config: {name: profile form, base_url: http://app.test/profile}
      teststeps:
        - name: type name
          step_type: UI
          location:
            - {action: input, by: name, value: fullname, data: Alice}
  - name: save
    step_type: UI
    location:
      - {action: submit, by: id, value: profile-form}
"#,
    );

    let result = api_runner(&http)
        .with_ui_driver_factory(factory.clone())
        .run(&case)
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.step_datas);
    assert_eq!(result.step_datas.len(), 3);

    let log = factory.log.lock().unwrap();
    assert_eq!(log.created, 1);
    assert_eq!(log.opened, vec!["http://app.test".to_string()]);
    assert_eq!(
        log.performed,
        vec![UiAction::Click, UiAction::Input, UiAction::Submit]
    );
    assert_eq!(log.quit, 1);
}

#[tokio::test]
async fn test_ui_mode_opens_driver_eagerly() {
    let http = Arc::new(RecordingHttp::default());
    let factory = Arc::new(FakeDriverFactory::default());
    let case = testcase(
        r#"
config: {name: api in ui mode, base_url: http://app.test}
teststeps:
  - name: ping
    request: {method: GET, url: /ping}
"#,
    );

    let result = api_runner(&http)
        .with_ui_driver_factory(factory.clone())
        .with_mode(RunMode::Ui)
        .run(&case)
        .await
        .unwrap();
    assert!(result.success);

    let log = factory.log.lock().unwrap();
    assert_eq!(log.created, 1);
    assert_eq!(log.opened, vec!["http://app.test".to_string()]);
    assert!(log.performed.is_empty());
    assert_eq!(log.quit, 1);
}

#[tokio::test]
async fn test_ui_step_without_driver_factory_fails() {
    let http = Arc::new(RecordingHttp::default());
    let case = testcase(
        r#"
config: {name: ui, base_url: http://app.test}
teststeps:
  - name: click
    step_type: UI
    location:
      - {action: click, by: id, value: go}
"#,
    );

    let err = api_runner(&http).run(&case).await.unwrap_err();
    assert!(matches!(err.cause(), RunnerError::UiDriverUnavailable));
}

// ── run log ─────────────────────────────────────────────

#[tokio::test]
async fn test_run_log_is_written_per_case() {
    let http = Arc::new(RecordingHttp::default());
    let dir = tempfile::tempdir().unwrap();
    let case = testcase(
        r#"
config: {name: logged, base_url: http://api.test}
teststeps:
  - name: ping
    request: {method: GET, url: /ping}
"#,
    );

    let result = api_runner(&http)
        .with_log_dir(dir.path())
        .run(&case)
        .await
        .unwrap();
    let log = result.log.expect("run log path should be reported");
    assert!(log.starts_with(dir.path()));
    let content = std::fs::read_to_string(&log).unwrap();
    assert!(content.contains("Running step 1/1: ping"), "{content}");
}
