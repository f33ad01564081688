//! Error taxonomy of the execution engine.

use crate::model::RunSummary;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a test case run.
///
/// Validation failures are the only variant the runner converts into
/// a recorded `success = false` instead of propagating; everything
/// else stops the run where it happens.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A step declared a `step_type` outside the supported set.
    #[error(
        "unknown step type '{step_type}' in step '{step}', \
         expected one of: API, UI, SQL"
    )]
    UnknownStepType { step: String, step_type: String },

    /// The step payload does not match its declared type.
    #[error("invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    /// A UI location requested an action outside the vocabulary.
    #[error("unknown UI action '{action}', supported actions: {supported}")]
    UnknownUiAction { action: String, supported: String },

    /// A validator used a comparator the engine does not know.
    #[error("unknown comparator '{0}'")]
    UnknownComparator(String),

    /// A SQL block has no datasource, neither its own nor the case's.
    #[error("no datasource configured for SQL step '{0}'")]
    MissingDatasource(String),

    /// The datasource name has no connection string in the environment.
    #[error("datasource '{0}' is not mapped in the environment")]
    DatasourceNotFound(String),

    /// A referenced test case could not be located.
    #[error("invalid referenced testcase: {0}")]
    InvalidTestCaseRef(String),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// UI step requested but no driver factory was configured.
    #[error("no UI driver available for UI steps")]
    UiDriverUnavailable,

    /// SQL step requested but no database connector was configured.
    #[error("no database backend configured for SQL steps")]
    DatabaseUnavailable,

    #[error("variable '{0}' not found")]
    UnresolvedVariable(String),

    #[error("function '{0}' not found")]
    UnresolvedFunction(String),

    #[error("function '{name}' failed: {reason:#}")]
    Function { name: String, reason: anyhow::Error },

    /// One or more assertions failed; the message lists all of them.
    #[error("validation failed:\n{0}")]
    Validation(String),

    #[error(
        "failed to export variable '{name}' from session variables \
         {available:?}"
    )]
    ExportNotFound { name: String, available: Vec<String> },

    #[error("HTTP request failed: {0:#}")]
    Http(anyhow::Error),

    #[error("UI driver error: {0:#}")]
    Ui(anyhow::Error),

    #[error("database error: {0:#}")]
    Database(anyhow::Error),

    #[error("failed to load testcase {}: {reason:#}", path.display())]
    Load { path: PathBuf, reason: anyhow::Error },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A fatal error stopped a top-level run. `summary` holds every step
    /// recorded up to and including the one that failed.
    #[error("{error}")]
    Aborted {
        error: Box<RunnerError>,
        summary: Box<RunSummary>,
    },
}

impl RunnerError {
    /// `true` for errors caused by the test case definition or the
    /// environment rather than by the system under test.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self.cause(),
            Self::UnknownStepType { .. }
                | Self::InvalidStep { .. }
                | Self::UnknownUiAction { .. }
                | Self::UnknownComparator(_)
                | Self::MissingDatasource(_)
                | Self::DatasourceNotFound(_)
                | Self::InvalidTestCaseRef(_)
                | Self::InvalidUrl { .. }
                | Self::UiDriverUnavailable
                | Self::DatabaseUnavailable
        )
    }

    /// The error that stopped the run, looking through [`Self::Aborted`].
    pub fn cause(&self) -> &RunnerError {
        match self {
            Self::Aborted { error, .. } => error.cause(),
            other => other,
        }
    }

    /// The execution record of an aborted run.
    pub fn partial_summary(&self) -> Option<&RunSummary> {
        match self {
            Self::Aborted { summary, .. } => Some(summary.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;
