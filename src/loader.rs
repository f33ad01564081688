//! Test case discovery and loading.

use crate::model::TestCase;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Loads test case documents from files and directories.
#[derive(Debug)]
pub struct TestCaseLoader {
    /// Directories searched by [`TestCaseLoader::load_all_testcases`].
    pub test_paths: Vec<PathBuf>,
}

impl TestCaseLoader {
    pub fn new() -> Self {
        Self {
            test_paths: vec![
                PathBuf::from("testcases"),
                PathBuf::from("tests/testcases"),
            ],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.test_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single test case file.
    ///
    /// `.json` files are parsed as JSON, everything else as YAML.
    pub fn load_testcase<P: AsRef<Path>>(&self, path: P) -> Result<TestCase> {
        let path = path.as_ref();
        info!("Loading testcase from {}", path.display());

        let content = fs::read_to_string(path).context(format!(
            "Failed to read testcase file: {}",
            path.display()
        ))?;

        let testcase = if is_json(path) {
            TestCase::from_json(&content).context(format!(
                "Failed to parse JSON from {}",
                path.display()
            ))?
        } else {
            TestCase::from_yaml(&content).context(format!(
                "Failed to parse YAML from {}",
                path.display()
            ))?
        };

        debug!("Successfully loaded testcase: {}", testcase.config.name);
        Ok(testcase)
    }

    /// Load every test case file directly inside `dir`, sorted by file
    /// name. Files that fail to parse are logged and skipped.
    pub fn load_testcases_from_dir<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Result<Vec<TestCase>> {
        let dir = dir.as_ref();
        info!("Loading testcases from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).context(format!(
            "Failed to read directory: {}",
            dir.display()
        ))? {
            let path = entry?.path();
            if path.is_file() && is_testcase_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut testcases = Vec::new();
        for path in paths {
            match self.load_testcase(&path) {
                Ok(testcase) => testcases.push(testcase),
                Err(err) => {
                    debug!(
                        "Failed to load testcase from {}: {:#}",
                        path.display(),
                        err
                    );
                }
            }
        }

        info!(
            "Loaded {} testcases from {}",
            testcases.len(),
            dir.display()
        );
        Ok(testcases)
    }

    /// Load from every configured search path that exists.
    pub fn load_all_testcases(&self) -> Result<Vec<TestCase>> {
        let mut all_testcases = Vec::new();

        for path in &self.test_paths {
            if path.is_dir() {
                match self.load_testcases_from_dir(path) {
                    Ok(mut testcases) => all_testcases.append(&mut testcases),
                    Err(err) => {
                        debug!(
                            "Failed to load testcases from {}: {:#}",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }

        info!("Loaded {} testcases in total", all_testcases.len());
        Ok(all_testcases)
    }
}

impl Default for TestCaseLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// `true` for `.yaml`, `.yml` and `.json` files.
fn is_testcase_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}
