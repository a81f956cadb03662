//! Template stage: hierarchical templates → pretty-printed markup.
//!
//! Every `*.pug` file under the template root is compiled, except partials
//! (`_layout.pug`, `_header.pug`, …) which only exist to be included. Output
//! keeps the relative directory:
//!
//! ```text
//! src/pug/index.pug        → dist/index.html
//! src/pug/about/index.pug  → dist/about/index.html
//! src/pug/_layout.pug      → (nothing)
//! ```
//!
//! A compile error in one template is reported through the [`Notifier`] and
//! the remaining templates are still compiled.

use crate::config::Layout;
use crate::notice::{Notice, Notifier};
use crate::stage::{self, StageError, StageId, StageReport};
use crate::tool::{self, ToolError};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Compiles one template file to markup.
pub trait TemplateCompiler: Sync {
    /// Render `source`. `basedir` resolves absolute includes.
    fn render(&self, source: &Path, basedir: &Path) -> Result<String, ToolError>;
}

/// `pug` command-line compiler, fed through stdin in pretty mode.
pub struct PugCli {
    command: Vec<String>,
    cwd: PathBuf,
}

impl PugCli {
    pub fn new(command: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
        }
    }
}

impl TemplateCompiler for PugCli {
    fn render(&self, source: &Path, basedir: &Path) -> Result<String, ToolError> {
        let input = std::fs::read(source).map_err(|e| ToolError::Input {
            path: source.to_path_buf(),
            source: e,
        })?;
        let mut cmd = tool::command(&self.command, &self.cwd)?;
        cmd.arg("--pretty")
            .arg("--path")
            .arg(source)
            .arg("--basedir")
            .arg(basedir);
        tool::run_to_string(&mut cmd, Some(&input))
    }
}

const EXTENSIONS: &[&str] = &["pug"];

/// Template sources that produce output (partials excluded).
pub fn entries(template_root: &Path) -> Result<Vec<PathBuf>, StageError> {
    let exts: Vec<String> = EXTENSIONS.iter().map(|e| e.to_string()).collect();
    Ok(stage::discover(template_root, &exts)?
        .into_iter()
        .filter(|p| !stage::is_partial(p))
        .collect())
}

/// Run the template stage.
pub fn run(
    compiler: &dyn TemplateCompiler,
    notifier: &dyn Notifier,
    layout: &Layout,
) -> Result<StageReport, StageError> {
    let started = Instant::now();
    let mut report = StageReport::new(StageId::Templates);
    let sources = entries(&layout.templates)?;

    let results: Vec<Result<bool, StageError>> = sources
        .par_iter()
        .map(|source| {
            let markup = match compiler.render(source, &layout.templates) {
                Ok(m) => m,
                Err(e) => {
                    notifier.notify(Notice::error(
                        "pug",
                        format_args!("{}: {e}", source.display()),
                    ));
                    return Ok(false);
                }
            };
            let out = stage::rebase(source, &layout.templates, &layout.output, "html");
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out, markup)?;
            tracing::debug!(source = %source.display(), output = %out.display(), "compiled template");
            Ok(true)
        })
        .collect();

    for result in results {
        if result? {
            report.processed += 1;
        } else {
            report.failed += 1;
        }
    }
    report.duration = started.elapsed();
    Ok(report)
}
