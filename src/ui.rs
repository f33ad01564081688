//! Browser automation collaborator used by UI steps.
//!
//! The engine only defines the driver interface. A concrete
//! WebDriver-backed implementation is supplied by the embedding
//! application through [`UiDriverFactory`].

use crate::error::RunnerError;
use crate::model::UiLocation;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The closed vocabulary of UI actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAction {
    Open,
    Click,
    DoubleClick,
    Input,
    Clear,
    Select,
    Hover,
    Submit,
    SwitchFrame,
    SwitchDefault,
    Refresh,
    Back,
    Forward,
    ExecuteScript,
    Screenshot,
    Wait,
}

impl UiAction {
    pub const ALL: [UiAction; 16] = [
        UiAction::Open,
        UiAction::Click,
        UiAction::DoubleClick,
        UiAction::Input,
        UiAction::Clear,
        UiAction::Select,
        UiAction::Hover,
        UiAction::Submit,
        UiAction::SwitchFrame,
        UiAction::SwitchDefault,
        UiAction::Refresh,
        UiAction::Back,
        UiAction::Forward,
        UiAction::ExecuteScript,
        UiAction::Screenshot,
        UiAction::Wait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UiAction::Open => "open",
            UiAction::Click => "click",
            UiAction::DoubleClick => "double_click",
            UiAction::Input => "input",
            UiAction::Clear => "clear",
            UiAction::Select => "select",
            UiAction::Hover => "hover",
            UiAction::Submit => "submit",
            UiAction::SwitchFrame => "switch_frame",
            UiAction::SwitchDefault => "switch_default",
            UiAction::Refresh => "refresh",
            UiAction::Back => "back",
            UiAction::Forward => "forward",
            UiAction::ExecuteScript => "execute_script",
            UiAction::Screenshot => "screenshot",
            UiAction::Wait => "wait",
        }
    }

    /// Comma separated list of every action name.
    pub fn supported() -> String {
        Self::ALL
            .iter()
            .map(UiAction::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for UiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UiAction {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| RunnerError::UnknownUiAction {
                action: name.to_string(),
                supported: Self::supported(),
            })
    }
}

/// Element locator strategies, named as in WebDriver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locator {
    Id,
    Name,
    Xpath,
    #[serde(alias = "css selector", alias = "css_selector")]
    Css,
    #[serde(alias = "class name")]
    ClassName,
    #[serde(alias = "tag name")]
    TagName,
    #[serde(alias = "link text")]
    LinkText,
    #[serde(alias = "partial link text")]
    PartialLinkText,
}

/// A live browser session.
#[async_trait]
pub trait UiDriver: Send + Sync {
    /// Navigate to `url`.
    async fn open(&self, url: &str) -> Result<()>;

    /// Perform one already resolved location.
    async fn perform(&self, action: UiAction, location: &UiLocation) -> Result<()>;

    /// Page state validators run against (`title`, `url`, `source`
    /// and anything else the driver exposes).
    async fn snapshot(&self) -> Result<Value>;

    /// Base64 encoded screenshot.
    async fn screenshot(&self) -> Result<String>;

    fn session_id(&self) -> Option<String>;

    async fn quit(&self) -> Result<()>;
}

/// Creates the shared driver on first use.
#[async_trait]
pub trait UiDriverFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn UiDriver>>;
}
