//! Stage compositions: `series` and `parallel` trees over stages.
//!
//! The exported task graph is fixed:
//!
//! ```text
//! build = series(
//!     parallel(sass, bundle, pug),
//!     tinypng,
//!     copy,
//!     webp,
//!     cache,
//! )
//! image = series(tinypng, webp, copy)
//! ```
//!
//! `build` and `image` disagree on whether `copy` runs before or after
//! `webp`; each entry point keeps its own order. In `build`, `webp` sees the
//! freshly copied files; in `image`, `webp` refreshes the previous output
//! and `copy` then lands next to the derivatives (different extension, so
//! nothing is overwritten).
//!
//! Parallel branches run on scoped threads and are all joined before the
//! composition moves on. A series stops at the first failing stage.

use crate::config::Layout;
use crate::stage::{StageError, StageId, StageReport};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Anything that can execute a single stage.
pub trait StageRunner: Sync {
    fn run_stage(&self, stage: StageId) -> Result<StageReport, StageError>;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CompositionError {
    #[error("parallel stages {first} and {second} both touch {}", .path.display())]
    Conflict {
        first: StageId,
        second: StageId,
        path: PathBuf,
    },
    #[error("stage {0} appears more than once")]
    Duplicate(StageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composition {
    Stage(StageId),
    Series(Vec<Composition>),
    Parallel(Vec<Composition>),
}

pub fn stage(id: StageId) -> Composition {
    Composition::Stage(id)
}

pub fn series(items: impl IntoIterator<Item = Composition>) -> Composition {
    Composition::Series(items.into_iter().collect())
}

pub fn parallel(items: impl IntoIterator<Item = Composition>) -> Composition {
    Composition::Parallel(items.into_iter().collect())
}

/// The full production build.
pub fn build() -> Composition {
    series([
        parallel([
            stage(StageId::Styles),
            stage(StageId::Bundle),
            stage(StageId::Templates),
        ]),
        stage(StageId::Compress),
        stage(StageId::Copy),
        stage(StageId::NextGen),
        stage(StageId::CacheBust),
    ])
}

/// The standalone image pipeline.
pub fn image() -> Composition {
    series([
        stage(StageId::Compress),
        stage(StageId::NextGen),
        stage(StageId::Copy),
    ])
}

/// Look up a composition by task name. Single stages are their own composition.
pub fn named(name: &str) -> Option<Composition> {
    match name {
        "build" => Some(build()),
        "image" => Some(image()),
        other => StageId::from_task_name(other).map(stage),
    }
}

impl Composition {
    /// Every stage in declaration order.
    pub fn stages(&self) -> Vec<StageId> {
        let mut out = Vec::new();
        self.collect_stages(&mut out);
        out
    }

    fn collect_stages(&self, out: &mut Vec<StageId>) {
        match self {
            Composition::Stage(id) => out.push(*id),
            Composition::Series(items) | Composition::Parallel(items) => {
                for item in items {
                    item.collect_stages(out);
                }
            }
        }
    }

    /// Check the tree before running it.
    ///
    /// - no stage appears twice;
    /// - no two parallel branches write the same path, and no branch reads
    ///   a path another parallel branch writes (paths overlap when one is a
    ///   prefix of the other).
    pub fn validate(&self, layout: &Layout) -> Result<(), CompositionError> {
        let mut seen = std::collections::HashSet::new();
        for id in self.stages() {
            if !seen.insert(id) {
                return Err(CompositionError::Duplicate(id));
            }
        }
        self.validate_branches(layout)
    }

    fn validate_branches(&self, layout: &Layout) -> Result<(), CompositionError> {
        match self {
            Composition::Stage(_) => Ok(()),
            Composition::Series(items) => items.iter().try_for_each(|c| c.validate_branches(layout)),
            Composition::Parallel(items) => {
                for (i, a) in items.iter().enumerate() {
                    for b in &items[i + 1..] {
                        check_pair(a, b, layout)?;
                        check_pair(b, a, layout)?;
                    }
                }
                items.iter().try_for_each(|c| c.validate_branches(layout))
            }
        }
    }

    /// Execute the tree, returning one report per stage in completion order.
    pub fn run<R: StageRunner + ?Sized>(&self, runner: &R) -> Result<Vec<StageReport>, StageError> {
        let mut reports = Vec::new();
        self.run_into(runner, &mut reports)?;
        Ok(reports)
    }

    fn run_into<R: StageRunner + ?Sized>(
        &self,
        runner: &R,
        reports: &mut Vec<StageReport>,
    ) -> Result<(), StageError> {
        match self {
            Composition::Stage(id) => {
                tracing::info!(stage = %id, "starting");
                let report = runner.run_stage(*id)?;
                tracing::info!(
                    stage = %id,
                    processed = report.processed,
                    skipped = report.skipped,
                    failed = report.failed,
                    "finished in {:.2?}",
                    report.duration
                );
                reports.push(report);
                Ok(())
            }
            Composition::Series(items) => {
                for item in items {
                    item.run_into(runner, reports)?;
                }
                Ok(())
            }
            Composition::Parallel(items) => {
                let results: Vec<Result<Vec<StageReport>, StageError>> =
                    std::thread::scope(|s| {
                        let handles: Vec<_> = items
                            .iter()
                            .map(|item| s.spawn(move || item.run(runner)))
                            .collect();
                        handles
                            .into_iter()
                            .map(|h| match h.join() {
                                Ok(result) => result,
                                Err(panic) => std::panic::resume_unwind(panic),
                            })
                            .collect()
                    });
                let mut first_error = None;
                for result in results {
                    match result {
                        Ok(mut branch) => reports.append(&mut branch),
                        Err(e) if first_error.is_none() => first_error = Some(e),
                        Err(e) => tracing::error!("additional parallel failure: {e}"),
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }
}

fn check_pair(a: &Composition, b: &Composition, layout: &Layout) -> Result<(), CompositionError> {
    for first in a.stages() {
        for written in first.writes(layout) {
            for second in b.stages() {
                let touched = second.reads(layout).into_iter().chain(second.writes(layout));
                for path in touched {
                    if path.starts_with(&written) || written.starts_with(&path) {
                        return Err(CompositionError::Conflict {
                            first,
                            second,
                            path: written,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Composition::Stage(id) => write!(f, "{id}"),
            Composition::Series(items) | Composition::Parallel(items) => {
                let name = if matches!(self, Composition::Series(_)) {
                    "series"
                } else {
                    "parallel"
                };
                write!(f, "{name}(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}
