//! Bundle stage: one bundler run over the script sources.
//!
//! The bundler is driven entirely by its own configuration file
//! (`webpack.config.js` by default); this stage only points its output at
//! the JS output directory. What happens on failure is the
//! `bundle.fail_on_error` setting: by default the error is logged and the
//! pipeline carries on with the previous bundle in place.

use crate::config::{BundleConfig, Layout};
use crate::stage::{StageError, StageId, StageReport};
use crate::tool::{self, ToolError};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("bundler config {} not found", .0.display())]
    MissingConfig(PathBuf),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Runs the module bundler once.
pub trait Bundler: Sync {
    fn bundle(&self, config_file: &Path, output: &Path) -> Result<(), BundleError>;
}

/// `webpack` command-line bundler.
pub struct WebpackCli {
    command: Vec<String>,
    cwd: PathBuf,
}

impl WebpackCli {
    pub fn new(command: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
        }
    }
}

impl Bundler for WebpackCli {
    fn bundle(&self, config_file: &Path, output: &Path) -> Result<(), BundleError> {
        if !config_file.exists() {
            return Err(BundleError::MissingConfig(config_file.to_path_buf()));
        }
        let mut cmd = tool::command(&self.command, &self.cwd)?;
        cmd.arg("--config")
            .arg(config_file)
            .arg("--output-path")
            .arg(output);
        tool::run(&mut cmd, None)?;
        Ok(())
    }
}

/// Run the bundle stage under the configured error policy.
pub fn run(
    bundler: &dyn Bundler,
    layout: &Layout,
    config: &BundleConfig,
) -> Result<StageReport, StageError> {
    let started = Instant::now();
    let mut report = StageReport::new(StageId::Bundle);
    let config_file = layout.root.join(&config.config_file);

    match bundler.bundle(&config_file, &layout.js_output) {
        Ok(()) => report.processed = 1,
        Err(e) if config.fail_on_error => return Err(e.into()),
        Err(e) => {
            tracing::error!(stage = "bundle", "{e}");
            report.failed = 1;
        }
    }

    report.duration = started.elapsed();
    Ok(report)
}
