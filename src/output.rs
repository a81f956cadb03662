//! CLI output formatting for pipeline runs.
//!
//! # Output Format
//!
//! ## Run summary
//!
//! ```text
//! sass      2 compiled                         0.41s
//! bundle    1 compiled                         2.10s
//! pug       5 compiled, 1 failed               0.88s
//! tinypng   3 compressed, 12 unchanged         4.02s
//! copy      15 copied                          0.01s
//! webp      3 encoded, 12 unchanged            0.30s
//! cache     1 stamped                          0.00s
//!
//! 7 stages, 1 failure
//! ```
//!
//! ## Plan
//!
//! ```text
//! build
//!     series
//!         parallel
//!             sass     src/scss → dist/css
//!             bundle   src/js → dist/js
//!             pug      src/pug → dist/index.html
//!         tinypng  src/img → src/img
//!         ...
//! ```
//!
//! # Architecture
//!
//! Each view has a `format_*` function (returns `Vec<String>`) for testability
//! and a `print_*` wrapper that writes to stdout. Format functions are pure:
//! no I/O, no side effects.

use crate::compose::Composition;
use crate::config::Layout;
use crate::stage::{StageId, StageReport};
use std::path::Path;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Verb used for "processed" per stage.
fn processed_verb(stage: StageId) -> &'static str {
    match stage {
        StageId::Templates | StageId::Styles | StageId::Bundle => "compiled",
        StageId::Compress => "compressed",
        StageId::Copy => "copied",
        StageId::NextGen => "encoded",
        StageId::CacheBust => "stamped",
    }
}

/// Show `path` relative to the project root when it lives under it.
fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

// ============================================================================
// Run summary
// ============================================================================

/// One line per stage report plus a totals line.
pub fn format_reports(reports: &[StageReport]) -> Vec<String> {
    let mut lines = Vec::with_capacity(reports.len() + 2);
    let mut failures = 0;

    for report in reports {
        let mut parts = vec![format!("{} {}", report.processed, processed_verb(report.stage))];
        if report.skipped > 0 {
            parts.push(format!("{} unchanged", report.skipped));
        }
        if report.failed > 0 {
            parts.push(format!("{} failed", report.failed));
            failures += report.failed;
        }
        lines.push(format!(
            "{:<9} {:<32} {:.2}s",
            report.stage.task_name(),
            parts.join(", "),
            report.duration.as_secs_f64()
        ));
    }

    lines.push(String::new());
    let stages = match reports.len() {
        1 => "1 stage".to_string(),
        n => format!("{n} stages"),
    };
    lines.push(match failures {
        0 => stages,
        1 => format!("{stages}, 1 failure"),
        n => format!("{stages}, {n} failures"),
    });
    lines
}

/// Print the run summary to stdout.
pub fn print_reports(reports: &[StageReport]) {
    for line in format_reports(reports) {
        println!("{}", line);
    }
}

// ============================================================================
// Plan
// ============================================================================

/// The composition tree with each stage's declared inputs and outputs.
pub fn format_plan(name: &str, composition: &Composition, layout: &Layout) -> Vec<String> {
    let mut lines = vec![name.to_string()];
    walk_plan(composition, layout, 1, &mut lines);
    lines
}

fn walk_plan(composition: &Composition, layout: &Layout, depth: usize, lines: &mut Vec<String>) {
    match composition {
        Composition::Stage(id) => {
            let paths = |ps: Vec<std::path::PathBuf>| {
                ps.iter()
                    .map(|p| display_path(&layout.root, p))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            lines.push(format!(
                "{}{:<8} {} \u{2192} {}",
                indent(depth),
                id.task_name(),
                paths(id.reads(layout)),
                paths(id.writes(layout))
            ));
        }
        Composition::Series(items) | Composition::Parallel(items) => {
            let kind = if matches!(composition, Composition::Series(_)) {
                "series"
            } else {
                "parallel"
            };
            lines.push(format!("{}{}", indent(depth), kind));
            for item in items {
                walk_plan(item, layout, depth + 1, lines);
            }
        }
    }
}

/// Print a plan to stdout.
pub fn print_plan(name: &str, composition: &Composition, layout: &Layout) {
    for line in format_plan(name, composition, layout) {
        println!("{}", line);
    }
}
