//! Next-gen stage: WebP siblings for every raster in the output image tree.
//!
//! `dist/img/hero.jpg` gains `dist/img/hero.webp`. A raster is encoded only
//! when its content hash differs from the one recorded in
//! `dist/img/.nextgen-manifest.json` or its sibling is missing, so a second
//! run over an unchanged tree encodes nothing.
//!
//! Rasters that share a stem (`hero.jpg`, `hero.png`) would write the same
//! sibling. The first in path order owns it; the others are skipped with a
//! warning.

use crate::cache::{self, FingerprintManifest};
use crate::config::{Layout, NextGenConfig};
use crate::stage::{self, StageError, StageId, StageReport};
use image::{DynamicImage, ImageReader};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NextGenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },
    #[error("Failed to encode {}: {message}", .path.display())]
    Encode { path: PathBuf, message: String },
}

/// Encodes one raster into the next-gen format.
pub trait NextGenEncoder: Sync {
    /// Extension of the produced file, without the dot.
    fn extension(&self) -> &'static str;

    fn encode(&self, source: &Path, dest: &Path) -> Result<(), NextGenError>;
}

/// Lossless WebP through the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebpEncoder;

impl NextGenEncoder for WebpEncoder {
    fn extension(&self) -> &'static str {
        "webp"
    }

    fn encode(&self, source: &Path, dest: &Path) -> Result<(), NextGenError> {
        let img = ImageReader::open(source)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| NextGenError::Decode {
                path: source.to_path_buf(),
                message: e.to_string(),
            })?;
        // The WebP encoder takes 8-bit RGB(A) only.
        let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
        let file = std::fs::File::create(dest)?;
        let writer = std::io::BufWriter::new(file);
        rgba.write_with_encoder(image::codecs::webp::WebPEncoder::new_lossless(writer))
            .map_err(|e| NextGenError::Encode {
                path: dest.to_path_buf(),
                message: e.to_string(),
            })
    }
}

enum Outcome {
    Skipped(String),
    Encoded(String, String),
}

/// Run the next-gen stage over the output image tree.
pub fn run(
    encoder: &dyn NextGenEncoder,
    layout: &Layout,
    config: &NextGenConfig,
) -> Result<StageReport, StageError> {
    let started = Instant::now();
    let mut report = StageReport::new(StageId::NextGen);
    let root = &layout.image_output;
    let manifest_path = cache::nextgen_manifest_path(root);
    let mut manifest = FingerprintManifest::load(&manifest_path);
    let sources = stage::discover(root, &config.extensions)?;

    let mut claimed = HashSet::new();
    let mut jobs = Vec::with_capacity(sources.len());
    for source in &sources {
        let dest = source.with_extension(encoder.extension());
        if claimed.insert(dest.clone()) {
            jobs.push((source, dest));
        } else {
            tracing::warn!(
                stage = "webp",
                source = %source.display(),
                output = %dest.display(),
                "output already produced from another image, skipping"
            );
            report.skipped += 1;
        }
    }

    let results: Vec<Result<Outcome, NextGenError>> = jobs
        .par_iter()
        .map(|(source, dest)| {
            let key = cache::relative_key(root, source);
            let hash = cache::hash_file(source)?;
            if manifest.is_current(&key, &hash) && dest.exists() {
                return Ok(Outcome::Skipped(key));
            }
            encoder.encode(source, dest)?;
            tracing::debug!(source = %source.display(), output = %dest.display(), "encoded");
            Ok(Outcome::Encoded(key, hash))
        })
        .collect();

    let mut first_error = None;
    let mut live = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(Outcome::Skipped(key)) => {
                report.skipped += 1;
                live.push(key);
            }
            Ok(Outcome::Encoded(key, hash)) => {
                report.processed += 1;
                live.push(key.clone());
                manifest.record(key, hash);
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(stage = "webp", "{e}");
                first_error.get_or_insert(e);
            }
        }
    }

    // Successful encodes are recorded even when a sibling failed.
    manifest.retain_keys(live.iter().map(String::as_str));
    manifest.save(&manifest_path)?;

    if let Some(e) = first_error {
        return Err(e.into());
    }
    report.duration = started.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use image::RgbImage;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingEncoder {
        calls: Mutex<Vec<PathBuf>>,
    }

    impl NextGenEncoder for CountingEncoder {
        fn extension(&self) -> &'static str {
            "webp"
        }

        fn encode(&self, source: &Path, dest: &Path) -> Result<(), NextGenError> {
            self.calls.lock().unwrap().push(source.to_path_buf());
            fs::write(dest, b"webp")?;
            Ok(())
        }
    }

    fn write_png(path: &Path, shade: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_fn(8, 6, |x, y| image::Rgb([x as u8 * 20, y as u8 * 30, shade]))
            .save(path)
            .unwrap();
    }

    fn project() -> (TempDir, Layout) {
        let tmp = TempDir::new().unwrap();
        let layout = PathsConfig::default().resolve(tmp.path());
        write_png(&layout.image_output.join("hero.png"), 10);
        write_png(&layout.image_output.join("gallery/one.png"), 20);
        fs::write(layout.image_output.join("icon.svg"), "<svg/>").unwrap();
        (tmp, layout)
    }

    #[test]
    fn second_run_encodes_nothing() {
        let (_tmp, layout) = project();
        let encoder = CountingEncoder::default();
        let config = NextGenConfig::default();

        let first = run(&encoder, &layout, &config).unwrap();
        assert_eq!(first.processed, 2);
        let mtime = fs::metadata(layout.image_output.join("hero.webp"))
            .unwrap()
            .modified()
            .unwrap();

        let second = run(&encoder, &layout, &config).unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(encoder.calls.lock().unwrap().len(), 2);
        let mtime_after = fs::metadata(layout.image_output.join("hero.webp"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(mtime, mtime_after);
    }

    #[test]
    fn changed_source_is_reencoded() {
        let (_tmp, layout) = project();
        let encoder = CountingEncoder::default();
        let config = NextGenConfig::default();
        run(&encoder, &layout, &config).unwrap();

        write_png(&layout.image_output.join("hero.png"), 200);
        let report = run(&encoder, &layout, &config).unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn deleted_sibling_is_restored() {
        let (_tmp, layout) = project();
        let encoder = CountingEncoder::default();
        let config = NextGenConfig::default();
        run(&encoder, &layout, &config).unwrap();

        fs::remove_file(layout.image_output.join("hero.webp")).unwrap();
        let report = run(&encoder, &layout, &config).unwrap();
        assert_eq!(report.processed, 1);
        assert!(layout.image_output.join("hero.webp").exists());
    }

    #[test]
    fn shared_stem_is_encoded_once() {
        let (_tmp, layout) = project();
        RgbImage::new(4, 4)
            .save(layout.image_output.join("hero.jpg"))
            .unwrap();
        let encoder = CountingEncoder::default();
        let config = NextGenConfig::default();

        let report = run(&encoder, &layout, &config).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.skipped, 1);
        let calls = encoder.calls.lock().unwrap().clone();
        assert!(calls.contains(&layout.image_output.join("hero.jpg")));
        assert!(!calls.contains(&layout.image_output.join("hero.png")));

        let again = run(&encoder, &layout, &config).unwrap();
        assert_eq!(again.processed, 0);
        assert_eq!(again.skipped, 3);
        let manifest =
            FingerprintManifest::load(&cache::nextgen_manifest_path(&layout.image_output));
        assert_eq!(manifest.entries.len(), 2);
    }

    #[test]
    fn webp_encoder_writes_decodable_file() {
        let (_tmp, layout) = project();
        let report = run(&WebpEncoder, &layout, &NextGenConfig::default()).unwrap();
        assert_eq!(report.processed, 2);

        let out = layout.image_output.join("gallery/one.webp");
        let decoded = image::open(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
        assert!(!layout.image_output.join("icon.webp").exists());
    }

    #[test]
    fn undecodable_raster_fails_stage_but_keeps_others() {
        let (_tmp, layout) = project();
        fs::write(layout.image_output.join("broken.png"), b"not a png").unwrap();

        let result = run(&WebpEncoder, &layout, &NextGenConfig::default());
        assert!(matches!(result, Err(StageError::NextGen(_))));
        assert!(layout.image_output.join("hero.webp").exists());

        let manifest =
            FingerprintManifest::load(&cache::nextgen_manifest_path(&layout.image_output));
        assert_eq!(manifest.entries.len(), 2);
    }
}
