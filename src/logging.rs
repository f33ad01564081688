//! Console tracing setup and per-run log files.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the global console subscriber.
///
/// `RUST_LOG` wins; otherwise `debug` with `verbose`, else `info`.
pub fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

/// Log file of one top-level run, `<dir>/<case_id>.run.log`.
///
/// Events emitted while the run executes under [`RunLog::dispatch`]
/// go to the console and, at debug level, to the file. The file is
/// closed once the `RunLog` and every clone of its dispatch are
/// dropped.
pub struct RunLog {
    path: PathBuf,
    dispatch: Dispatch,
}

impl RunLog {
    pub fn create(dir: &Path, case_id: &str) -> Result<Self> {
        fs::create_dir_all(dir).context(format!(
            "Failed to create log directory: {}",
            dir.display()
        ))?;
        let path = dir.join(format!("{case_id}.run.log"));
        let file = File::create(&path)
            .context(format!("Failed to create log file: {}", path.display()))?;

        let console = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::from_default_env());
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::DEBUG);
        let subscriber =
            tracing_subscriber::registry().with(console).with(file_layer);

        Ok(Self {
            path,
            dispatch: Dispatch::new(subscriber),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch.clone()
    }
}
