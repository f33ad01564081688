//! autorunner CLI - declarative API/UI/SQL test case runner.

use anyhow::{anyhow, Context, Result};
use autorunner::logging::init_tracing;
use autorunner::{
    DefaultTestRunner, ProjectMeta, RunMode, RunSummary, StepData,
    StepDetail, TestCase, TestCaseLoader, TestRunner,
};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Instant;
use tracing::{debug, error, info};

const BODY_PREVIEW_CHARS: usize = 500;

/// autorunner - declarative test case execution tool.
#[derive(Parser, Debug)]
#[command(name = "autorunner", version, about)]
struct Cli {
    /// Test case file or directory path.
    #[arg(short = 'p', long = "path")]
    test_path: Option<String>,

    /// Only run test cases whose name contains this text.
    #[arg(short = 'f', long = "filter")]
    test_filter: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Base URL override for all test cases.
    #[arg(short = 'b', long = "base-url")]
    base_url: Option<String>,

    /// Directory to save one report per test case.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Directory for per-run log files. Defaults to `<project>/logs`.
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Execution mode; `ui` opens the browser driver when a run starts.
    #[arg(long = "mode", env = "TYPE", default_value = "api")]
    mode: RunMode,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

impl ReportFormat {
    fn extension(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Yaml => "yaml",
            ReportFormat::Text => "txt",
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    passed: usize,
    failed: usize,
    errored: usize,
}

impl Totals {
    fn all_passed(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

// ── console output ──────────────────────────────────────

fn status_label(success: bool) -> &'static str {
    if success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    }
}

fn preview(body: &str) -> String {
    match body.char_indices().nth(BODY_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...(truncated)", &body[..idx]),
        None => body.to_string(),
    }
}

fn print_steps(steps: &[StepData], depth: usize, verbose: bool) {
    let indent = "  ".repeat(depth + 1);
    for (i, step) in steps.iter().enumerate() {
        let mark = if step.success {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        let kind = step
            .step_type
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            "{indent}{}. {mark} [{kind}] {} ({} ms)",
            i + 1,
            step.name,
            step.duration_ms
        );
        if let Some(err) = &step.error {
            error!("{indent}   \x1b[31m{}\x1b[0m", err);
        }

        match &step.detail {
            Some(StepDetail::TestCase { steps }) => {
                print_steps(steps, depth + 1, verbose)
            }
            Some(StepDetail::Request(trace)) if verbose => {
                debug!(
                    "{indent}   {} {} -> {}",
                    trace.request.method,
                    trace.request.url,
                    trace.response.status
                );
                if let Some(body) = &trace.request.body {
                    debug!("{indent}   request body: {}", preview(body));
                }
                if let Some(body) = &trace.response.body {
                    debug!("{indent}   response body: {}", preview(body));
                }
            }
            Some(StepDetail::Sql(trace)) if verbose => {
                for statement in &trace.statements {
                    debug!("{indent}   sql: {}", statement);
                }
                debug!("{indent}   {} rows", trace.rows.len());
            }
            _ => {}
        }
    }
}

fn print_summary(result: &RunSummary, verbose: bool) {
    info!(
        "{} {} ({} ms, case id {})",
        status_label(result.success),
        result.name,
        result.time.duration_ms,
        result.case_id
    );
    print_steps(&result.step_datas, 0, verbose);

    if !result.in_out.export_vars.is_empty() {
        info!("  exports: {:?}", result.in_out.export_vars);
    }
    if let Some(log) = &result.log {
        info!("  log: {}", log.display());
    }
}

// ── reports ─────────────────────────────────────────────

fn render_text_steps(out: &mut String, steps: &[StepData], depth: usize) {
    let indent = "  ".repeat(depth + 1);
    for (i, step) in steps.iter().enumerate() {
        let _ = writeln!(
            out,
            "{indent}{}. {} [{}] {} ms",
            i + 1,
            step.name,
            if step.success { "PASS" } else { "FAIL" },
            step.duration_ms
        );
        if let Some(err) = &step.error {
            for line in err.lines() {
                let _ = writeln!(out, "{indent}   {line}");
            }
        }
        if let Some(StepDetail::TestCase { steps }) = &step.detail {
            render_text_steps(out, steps, depth + 1);
        }
    }
}

fn render_report(result: &RunSummary, format: ReportFormat) -> Result<String> {
    let content = match format {
        ReportFormat::Json => serde_json::to_string_pretty(result)?,
        ReportFormat::Yaml => serde_yaml::to_string(result)?,
        ReportFormat::Text => {
            let mut out = String::new();
            let _ = writeln!(out, "Test case: {}", result.name);
            let _ = writeln!(out, "Case ID:   {}", result.case_id);
            let _ = writeln!(
                out,
                "Status:    {}",
                if result.success { "PASS" } else { "FAIL" }
            );
            let _ = writeln!(out, "Started:   {}", result.time.start_at_iso_format);
            let _ = writeln!(out, "Duration:  {} ms", result.time.duration_ms);
            if let Some(err) = &result.error {
                let _ = writeln!(out, "Error:     {err}");
            }
            let _ = writeln!(out, "\nSteps:");
            render_text_steps(&mut out, &result.step_datas, 0);
            if !result.in_out.export_vars.is_empty() {
                let _ = writeln!(out, "\nExports:");
                let mut names: Vec<_> =
                    result.in_out.export_vars.keys().collect();
                names.sort();
                for name in names {
                    let _ = writeln!(
                        out,
                        "  {name} = {}",
                        result.in_out.export_vars[name]
                    );
                }
            }
            out
        }
    };
    Ok(content)
}

fn write_report(
    result: &RunSummary,
    dir: &Path,
    format: ReportFormat,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).context(format!(
        "Failed to create report directory: {}",
        dir.display()
    ))?;

    let file_name = format!(
        "{}-{}.{}",
        result.name.replace([' ', '/'], "_"),
        Utc::now().timestamp(),
        format.extension()
    );
    let path = dir.join(file_name);
    fs::write(&path, render_report(result, format)?)
        .context(format!("Failed to write report: {}", path.display()))?;
    Ok(path)
}

// ── discovery and execution ─────────────────────────────

fn discover_testcases(test_path: Option<&str>) -> Result<Vec<TestCase>> {
    let loader = TestCaseLoader::new();

    let testcases = match test_path.map(PathBuf::from) {
        Some(path) if !path.exists() => {
            return Err(anyhow!("Path does not exist: {}", path.display()));
        }
        Some(path) if path.is_file() => vec![loader
            .load_testcase(&path)
            .context(format!("Failed to load testcase: {}", path.display()))?],
        Some(dir) => loader.load_testcases_from_dir(&dir).context(format!(
            "Failed to load testcases from directory: {}",
            dir.display()
        ))?,
        None => loader.load_all_testcases()?,
    };

    if testcases.is_empty() {
        return Err(anyhow!("No test cases found"));
    }
    Ok(testcases)
}

fn select_testcases(
    testcases: Vec<TestCase>,
    filter: Option<&str>,
    base_url: Option<&str>,
) -> Vec<TestCase> {
    let needle = filter.map(str::to_lowercase);
    testcases
        .into_iter()
        .filter(|t| match &needle {
            Some(needle) => t.config.name.to_lowercase().contains(needle),
            None => true,
        })
        .map(|mut t| {
            if let Some(base_url) = base_url {
                t.config.base_url = base_url.to_string();
            }
            t
        })
        .collect()
}

async fn run_testcases(
    runner: &DefaultTestRunner,
    testcases: &[TestCase],
    cli: &Cli,
) -> Totals {
    let mut totals = Totals::default();
    let total = testcases.len();

    for (idx, testcase) in testcases.iter().enumerate() {
        info!("Test {}/{}: {}", idx + 1, total, testcase.config.name);
        let outcome = runner.run(testcase).await;
        if let Err(e) = &outcome {
            let kind = if e.is_configuration_error() {
                "configuration error"
            } else {
                "execution error"
            };
            error!(
                "\x1b[31m{} {} - {}: {}\x1b[0m",
                status_label(false),
                testcase.config.name,
                kind,
                e
            );
        }

        let summary = match &outcome {
            Ok(summary) => Some(summary),
            Err(e) => e.partial_summary(),
        };
        if let Some(summary) = summary {
            print_summary(summary, cli.verbose);
            if let Some(dir) = &cli.report_dir {
                match write_report(summary, dir, cli.report_format) {
                    Ok(path) => info!("Report saved: {}", path.display()),
                    Err(e) => error!("Failed to save report: {:#}", e),
                }
            }
        }

        match outcome {
            Ok(summary) if summary.success => totals.passed += 1,
            Ok(_) => totals.failed += 1,
            Err(_) => totals.errored += 1,
        }
    }
    totals
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let testcases = select_testcases(
        discover_testcases(cli.test_path.as_deref())?,
        cli.test_filter.as_deref(),
        cli.base_url.as_deref(),
    );
    if testcases.is_empty() {
        return Err(anyhow!("No tests matching the filter were found"));
    }

    let meta = ProjectMeta::load(cli.test_path.as_deref().unwrap_or("."))
        .context("Failed to load project metadata")?;
    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| meta.root_dir.join("logs"));
    info!(
        "Project root: {} (mode: {})",
        meta.root_dir.display(),
        cli.mode
    );

    let runner = DefaultTestRunner::new()
        .with_project_meta(meta)
        .with_mode(cli.mode)
        .with_log_dir(log_dir);

    info!("Running {} test(s)...", testcases.len());
    let started = Instant::now();
    let totals = run_testcases(&runner, &testcases, &cli).await;
    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Errors: {}\n  Duration: {} ms",
        totals.passed + totals.failed + totals.errored,
        totals.passed,
        totals.failed,
        totals.errored,
        started.elapsed().as_millis()
    );

    if !totals.all_passed() {
        exit(1);
    }
    Ok(())
}
