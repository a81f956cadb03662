//! Copy stage: mirror the source image tree into the output image tree.
//!
//! Every file is copied on every run, whatever its type. The compression
//! signature file lives in the source tree but is bookkeeping, not an asset,
//! so it is left behind.

use crate::config::Layout;
use crate::stage::{StageError, StageId, StageReport};
use std::fs;
use std::path::Path;
use std::time::Instant;
use walkdir::WalkDir;

/// Run the copy stage. `signature_file` is an absolute path that is never copied.
pub fn run(layout: &Layout, signature_file: &Path) -> Result<StageReport, StageError> {
    let started = Instant::now();
    let mut report = StageReport::new(StageId::Copy);

    if !layout.images.exists() {
        tracing::debug!(root = %layout.images.display(), "no source images");
        return Ok(report);
    }

    for entry in WalkDir::new(&layout.images).follow_links(true) {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || path == signature_file {
            continue;
        }
        let rel = path.strip_prefix(&layout.images).unwrap_or(path);
        let dest = layout.image_output.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, &dest)?;
        report.processed += 1;
    }

    report.duration = started.elapsed();
    Ok(report)
}
