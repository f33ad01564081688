//! Declarative test case execution engine.
//!
//! A test case is a configuration plus an ordered list of steps. Each
//! step is an HTTP request, a UI interaction, a SQL query or another
//! test case. Variables flow forward from step to step and across
//! referenced test cases under a fixed precedence.

pub mod client;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod expression;
pub mod extractor;
pub mod functions;
pub mod hooks;
pub mod loader;
pub mod logging;
pub mod model;
pub mod parser;
pub mod project;
pub mod response;
pub mod runner;
pub mod session;
pub mod ui;
pub mod validator;
pub mod variables;

pub use client::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use db::{Database, DatabaseConnector, Row};
pub use error::{Result, RunnerError};
pub use functions::FunctionRegistry;
pub use loader::TestCaseLoader;
pub use model::*;
pub use project::ProjectMeta;
pub use runner::*;
pub use session::{RunMode, Session};
pub use ui::{Locator, UiAction, UiDriver, UiDriverFactory};
pub use variables::{merge_variables, VariableMapping};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
