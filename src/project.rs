//! Process-wide project context: root directory, template functions
//! and `.env` values.

use crate::functions::FunctionRegistry;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DOT_ENV: &str = ".env";

/// Lookup context loaded once per process and shared read-only by
/// every run.
#[derive(Debug, Clone)]
pub struct ProjectMeta {
    /// Directory referenced test cases are resolved against.
    pub root_dir: PathBuf,
    pub functions: FunctionRegistry,
    env: HashMap<String, String>,
}

impl ProjectMeta {
    /// Project rooted at `root_dir` with the built-in functions and no
    /// `.env` values.
    pub fn new<P: AsRef<Path>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            functions: FunctionRegistry::with_builtins(),
            env: HashMap::new(),
        }
    }

    /// Locate the project root for `start` and load its `.env`.
    ///
    /// The root is the nearest ancestor (of `start` itself when it is
    /// a directory) that contains a `.env` file. Without one, the
    /// current working directory is used.
    pub fn load<P: AsRef<Path>>(start: P) -> Result<Self> {
        let start = start.as_ref();
        let search_from = if start.is_file() {
            start.parent().unwrap_or(start)
        } else {
            start
        };
        let search_from = fs::canonicalize(search_from)
            .unwrap_or_else(|_| search_from.to_path_buf());

        let root = search_from
            .ancestors()
            .find(|dir| dir.join(DOT_ENV).is_file())
            .map(Path::to_path_buf);

        let meta = match root {
            Some(root) => {
                let env_path = root.join(DOT_ENV);
                let content = fs::read_to_string(&env_path).context(
                    format!("Failed to read {}", env_path.display()),
                )?;
                let mut meta = Self::new(&root);
                meta.env = parse_dot_env(&content);
                info!(
                    "Loaded {} variables from {}",
                    meta.env.len(),
                    env_path.display()
                );
                meta
            }
            None => {
                let cwd = std::env::current_dir()
                    .context("Failed to read current directory")?;
                debug!(
                    "No {DOT_ENV} found above {}, using {} as project root",
                    search_from.display(),
                    cwd.display()
                );
                Self::new(cwd)
            }
        };
        Ok(meta)
    }

    /// Replace the function registry.
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Add a project-level environment value.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Look up an environment value: the process environment first,
    /// then the project `.env` file.
    pub fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| self.env.get(key).cloned())
    }

    /// Resolve `path` against the project root unless it is absolute.
    pub fn resolve_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }
}

/// Parse `KEY=VALUE` lines; blank lines and `#` comments are skipped
/// and surrounding quotes are stripped.
fn parse_dot_env(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| {
                    value.strip_prefix('\'').and_then(|v| v.strip_suffix('\''))
                })
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
