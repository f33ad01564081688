//! Collaborator handles shared by a top-level run and its nested runs.

use crate::client::HttpClient;
use crate::db::DatabaseConnector;
use crate::error::{Result, RunnerError};
use crate::ui::{UiDriver, UiDriverFactory};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Execution mode, selected by the `TYPE` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Api,
    /// The UI driver is opened when the run starts.
    Ui,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" | "" => Ok(RunMode::Api),
            "ui" => Ok(RunMode::Ui),
            other => Err(format!("unknown run mode '{other}', expected api or ui")),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Api => "api",
            RunMode::Ui => "ui",
        })
    }
}

/// HTTP client, UI driver slot and database connector of one top-level
/// run. Nested runs borrow it; only the owner closes it.
pub struct Session {
    http: Arc<dyn HttpClient>,
    ui_factory: Option<Arc<dyn UiDriverFactory>>,
    database: Option<Arc<dyn DatabaseConnector>>,
    driver: Mutex<Option<Arc<dyn UiDriver>>>,
    mode: RunMode,
}

impl Session {
    pub fn new(
        http: Arc<dyn HttpClient>,
        ui_factory: Option<Arc<dyn UiDriverFactory>>,
        database: Option<Arc<dyn DatabaseConnector>>,
        mode: RunMode,
    ) -> Self {
        Self {
            http,
            ui_factory,
            database,
            driver: Mutex::new(None),
            mode,
        }
    }

    pub fn http(&self) -> &dyn HttpClient {
        self.http.as_ref()
    }

    pub fn database(&self) -> Result<&dyn DatabaseConnector> {
        self.database
            .as_deref()
            .ok_or(RunnerError::DatabaseUnavailable)
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// The shared driver, created and opened at `base_url` on first
    /// use.
    pub async fn ui_driver(&self, base_url: &str) -> Result<Arc<dyn UiDriver>> {
        let mut slot = self.driver.lock().await;
        if let Some(driver) = slot.as_ref() {
            return Ok(driver.clone());
        }

        let factory = self
            .ui_factory
            .as_ref()
            .ok_or(RunnerError::UiDriverUnavailable)?;
        let driver: Arc<dyn UiDriver> =
            Arc::from(factory.create().await.map_err(RunnerError::Ui)?);
        if !base_url.is_empty() {
            driver.open(base_url).await.map_err(RunnerError::Ui)?;
        }
        info!(
            "Started UI driver session {}",
            driver.session_id().unwrap_or_default()
        );
        *slot = Some(driver.clone());
        Ok(driver)
    }

    /// Close the shared driver if one is open. A later UI step starts
    /// a new one.
    pub async fn quit_driver(&self) {
        let driver = self.driver.lock().await.take();
        if let Some(driver) = driver {
            debug!("Quitting UI driver");
            if let Err(e) = driver.quit().await {
                warn!("Failed to quit UI driver: {:#}", e);
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("ui", &self.ui_factory.is_some())
            .field("database", &self.database.is_some())
            .field("mode", &self.mode)
            .finish()
    }
}
