//! Stage identities, reports, errors, and shared file discovery.
//!
//! A stage is one pipeline step that turns a known input file set into a
//! known output file set through an external collaborator. Every stage
//! declares the paths it reads and writes ([`StageId::reads`],
//! [`StageId::writes`]) so compositions can be checked for overlapping
//! writes before anything runs.

use crate::bundle::BundleError;
use crate::cachebust::CacheBustError;
use crate::config::Layout;
use crate::images::compress::CompressError;
use crate::images::nextgen::NextGenError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

/// The seven pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    Templates,
    Styles,
    Bundle,
    Compress,
    Copy,
    NextGen,
    CacheBust,
}

impl StageId {
    pub const ALL: [StageId; 7] = [
        StageId::Templates,
        StageId::Styles,
        StageId::Bundle,
        StageId::Compress,
        StageId::Copy,
        StageId::NextGen,
        StageId::CacheBust,
    ];

    /// Task name used on the command line and in logs.
    pub fn task_name(self) -> &'static str {
        match self {
            StageId::Templates => "pug",
            StageId::Styles => "sass",
            StageId::Bundle => "bundle",
            StageId::Compress => "tinypng",
            StageId::Copy => "copy",
            StageId::NextGen => "webp",
            StageId::CacheBust => "cache",
        }
    }

    pub fn from_task_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.task_name() == name)
    }

    /// Paths this stage reads.
    pub fn reads(self, layout: &Layout) -> Vec<PathBuf> {
        match self {
            StageId::Templates => vec![layout.templates.clone()],
            StageId::Styles => vec![layout.styles.clone()],
            StageId::Bundle => vec![layout.scripts.clone()],
            StageId::Compress => vec![layout.images.clone()],
            StageId::Copy => vec![layout.images.clone()],
            StageId::NextGen => vec![layout.image_output.clone()],
            StageId::CacheBust => vec![layout.cache_bust_target.clone()],
        }
    }

    /// Paths this stage writes. Templates write individual `.html` files into
    /// the output root rather than owning it, so their declared output is the
    /// cache-bust target, the one page other stages care about.
    pub fn writes(self, layout: &Layout) -> Vec<PathBuf> {
        match self {
            StageId::Templates => vec![layout.cache_bust_target.clone()],
            StageId::Styles => vec![layout.css_output.clone()],
            StageId::Bundle => vec![layout.js_output.clone()],
            StageId::Compress => vec![layout.images.clone()],
            StageId::Copy => vec![layout.image_output.clone()],
            StageId::NextGen => vec![layout.image_output.clone()],
            StageId::CacheBust => vec![layout.cache_bust_target.clone()],
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_name())
    }
}

/// What a stage did in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: StageId,
    /// Files (or bundler runs) that produced output.
    pub processed: usize,
    /// Files left alone because their fingerprint was current.
    pub skipped: usize,
    /// Files whose processing failed without failing the stage.
    pub failed: usize,
    pub duration: Duration,
}

impl StageReport {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            processed: 0,
            skipped: 0,
            failed: 0,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Bundle failed: {0}")]
    Bundle(#[from] BundleError),
    #[error("Compression failed: {0}")]
    Compress(#[from] CompressError),
    #[error("Next-gen encoding failed: {0}")]
    NextGen(#[from] NextGenError),
    #[error("Cache busting failed: {0}")]
    CacheBust(#[from] CacheBustError),
}

/// True when the file name starts with `_` (a partial, never compiled alone).
pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('_'))
}

/// True when `path` has one of `extensions` (case-insensitive).
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Every file under `root` with one of `extensions`, sorted.
///
/// A missing root yields no files, the same as an empty source glob.
pub fn discover(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, StageError> {
    if !root.exists() {
        tracing::debug!(root = %root.display(), "source directory missing, nothing to do");
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry?;
        if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Map `source` under `from_root` to the same relative location under
/// `to_root`, with the extension replaced.
pub fn rebase(source: &Path, from_root: &Path, to_root: &Path, extension: &str) -> PathBuf {
    let rel = source.strip_prefix(from_root).unwrap_or(source);
    to_root.join(rel).with_extension(extension)
}
