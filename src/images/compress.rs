//! Compress stage: lossy-optimize source rasters through the Tinify API.
//!
//! Compressed bytes overwrite the source image in place. The hash of what was
//! written is recorded in the signature file (`src/img/.tinypng-sigs`), so an
//! image is sent to the service once per content change rather than once per
//! build. At most `compress.parallel` uploads are in flight.
//!
//! A failure for one image is logged and counted; the rest of the batch is
//! still processed and the stage succeeds. A local I/O error fails the stage,
//! but only after the whole batch ran and the signatures of the images that
//! were compressed and written have been saved.

use crate::cache::{self, FingerprintManifest};
use crate::config::{CompressConfig, Layout};
use crate::stage::{self, StageError, StageId, StageReport};
use rayon::prelude::*;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("no compression API key: set compress.api_key or {}", crate::config::API_KEY_ENV)]
    MissingApiKey,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service rejected the image ({status}): {message}")]
    Service { status: u16, message: String },
    #[error("service response did not include an output URL")]
    MissingOutput,
    #[error("cannot start upload pool: {0}")]
    Pool(String),
}

/// Shrinks one image.
pub trait Compressor: Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError>;
}

/// Tinify HTTP client: upload to `/shrink`, then download the result.
pub struct TinifyClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ShrinkResponse {
    output: ShrinkOutput,
}

#[derive(Deserialize)]
struct ShrinkOutput {
    url: String,
}

impl TinifyClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    /// Build a client from config; fails when no API key is configured.
    pub fn from_config(config: &CompressConfig) -> Result<Self, CompressError> {
        let key = config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(CompressError::MissingApiKey)?;
        Ok(Self::new(config.endpoint.clone(), key))
    }
}

impl Compressor for TinifyClient {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth("api", Some(&self.api_key))
            .body(data.to_vec())
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().unwrap_or_default();
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("no message")
                .to_string();
            return Err(CompressError::Service {
                status: status.as_u16(),
                message,
            });
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let url = match location {
            Some(url) => url,
            None => {
                let body: ShrinkResponse =
                    response.json().map_err(|_| CompressError::MissingOutput)?;
                body.output.url
            }
        };

        let download = self
            .client
            .get(&url)
            .basic_auth("api", Some(&self.api_key))
            .send()?
            .error_for_status()?;
        Ok(download.bytes()?.to_vec())
    }
}

enum Outcome {
    Skipped,
    Compressed { key: String, hash: String, saved: i64 },
    Failed,
}

/// Run the compress stage over the source image tree.
pub fn run(
    compressor: &dyn Compressor,
    layout: &Layout,
    config: &CompressConfig,
) -> Result<StageReport, StageError> {
    let started = Instant::now();
    let mut report = StageReport::new(StageId::Compress);
    let signature_path = layout.root.join(&config.signature_file);
    let mut signatures = FingerprintManifest::load(&signature_path);
    let sources = stage::discover(&layout.images, &config.extensions)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.parallel)
        .build()
        .map_err(|e| CompressError::Pool(e.to_string()))?;

    let results: Vec<Result<Outcome, StageError>> = pool.install(|| {
        sources
            .par_iter()
            .map(|source| compress_one(compressor, &layout.images, &signatures, source))
            .collect()
    });

    let mut saved_total = 0i64;
    let mut first_error = None;
    for result in results {
        match result {
            Ok(Outcome::Skipped) => report.skipped += 1,
            Ok(Outcome::Failed) => report.failed += 1,
            Ok(Outcome::Compressed { key, hash, saved }) => {
                report.processed += 1;
                saved_total += saved;
                signatures.record(key, hash);
            }
            Err(e) => {
                tracing::error!(stage = "tinypng", "{e}");
                first_error.get_or_insert(e);
            }
        }
    }

    signatures.save(&signature_path)?;
    if report.processed > 0 {
        tracing::info!(stage = "tinypng", "saved {} bytes", saved_total);
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    report.duration = started.elapsed();
    Ok(report)
}

fn compress_one(
    compressor: &dyn Compressor,
    root: &Path,
    signatures: &FingerprintManifest,
    source: &Path,
) -> Result<Outcome, StageError> {
    let key = cache::relative_key(root, source);
    let original = fs::read(source)?;
    if signatures.is_current(&key, &cache::hash_bytes(&original)) {
        return Ok(Outcome::Skipped);
    }

    let compressed = match compressor.compress(&original) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(stage = "tinypng", image = %key, "{e}");
            return Ok(Outcome::Failed);
        }
    };

    fs::write(source, &compressed)?;
    let saved = original.len() as i64 - compressed.len() as i64;
    tracing::debug!(image = %key, before = original.len(), after = compressed.len(), "compressed");
    Ok(Outcome::Compressed {
        key,
        hash: cache::hash_bytes(&compressed),
        saved,
    })
}
