//! Cache-busting stage: stamp asset references in the generated page.
//!
//! Two rewrites run over the full text of the target page, in order:
//!
//! | Pattern | Replacement | Example |
//! |---|---|---|
//! | `\.(js\|css)\?ver` | `.$1?ver=<token>` | `app.js?ver` → `app.js?ver=9f3c…` |
//! | `\.(webp\|jpg\|jpeg\|png\|svg\|gif)` | `.$1?ver=<token>` | `logo.png` → `logo.png?ver=9f3c…` |
//!
//! Script and stylesheet references opt in through the `?ver` marker; image
//! references are stamped wherever they appear. The token is generated once
//! per process and passed in, so every substitution of one run agrees.

use crate::config::Layout;
use crate::stage::{StageError, StageId, StageReport};
use rand::RngCore;
use rand::rngs::OsRng;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Instant;
use thiserror::Error;

static SCRIPT_STYLE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(js|css)\?ver").expect("static regex must compile")
});

static IMAGE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(webp|jpg|jpeg|png|svg|gif)").expect("static regex must compile")
});

#[derive(Error, Debug)]
pub enum CacheBustError {
    #[error("cache-bust target {} does not exist", .0.display())]
    MissingTarget(PathBuf),
}

/// Per-run cache-busting token: 8 random bytes as 16 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheToken(String);

impl CacheToken {
    /// A fresh random token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// A fixed token, for reproducible output.
    pub fn from_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Apply both rewrites to `text`.
pub fn apply(text: &str, token: &CacheToken) -> String {
    let stamped = SCRIPT_STYLE_REF.replace_all(text, |caps: &regex::Captures<'_>| {
        format!(".{}?ver={}", &caps[1], token)
    });
    IMAGE_REF
        .replace_all(&stamped, |caps: &regex::Captures<'_>| {
            format!(".{}?ver={}", &caps[1], token)
        })
        .into_owned()
}

/// Run the cache-busting stage on the configured target page.
pub fn run(layout: &Layout, token: &CacheToken) -> Result<StageReport, StageError> {
    let started = Instant::now();
    let target = &layout.cache_bust_target;
    if !target.is_file() {
        return Err(CacheBustError::MissingTarget(target.clone()).into());
    }

    let text = std::fs::read_to_string(target)?;
    let stamped = apply(&text, token);
    std::fs::write(target, stamped)?;
    tracing::debug!(target = %target.display(), token = %token, "stamped asset references");

    let mut report = StageReport::new(StageId::CacheBust);
    report.processed = 1;
    report.duration = started.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use std::fs;
    use tempfile::TempDir;

    fn token() -> CacheToken {
        CacheToken::from_value("deadbeef")
    }

    #[test]
    fn stamps_scripts_styles_and_images() {
        let html = r#"<script src="js/app.js?ver"></script><img src="img/logo.png">"#;
        assert_eq!(
            apply(html, &token()),
            r#"<script src="js/app.js?ver=deadbeef"></script><img src="img/logo.png?ver=deadbeef">"#
        );
    }

    #[test]
    fn unmarked_scripts_are_left_alone() {
        let html = r#"<script src="js/app.js"></script><link href="css/main.css?ver">"#;
        assert_eq!(
            apply(html, &token()),
            r#"<script src="js/app.js"></script><link href="css/main.css?ver=deadbeef">"#
        );
    }

    #[test]
    fn every_image_kind_is_stamped() {
        for ext in ["webp", "jpg", "jpeg", "png", "svg", "gif"] {
            let out = apply(&format!("a.{ext}"), &token());
            assert_eq!(out, format!("a.{ext}?ver=deadbeef"));
        }
    }

    #[test]
    fn fresh_tokens_differ_and_are_hex() {
        let a = CacheToken::generate();
        let b = CacheToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn run_rewrites_target_in_place() {
        let tmp = TempDir::new().unwrap();
        let layout = PathsConfig::default().resolve(tmp.path());
        fs::create_dir_all(&layout.output).unwrap();
        fs::write(&layout.cache_bust_target, r#"<link href="css/main.css?ver">"#).unwrap();

        let report = run(&layout, &token()).unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(
            fs::read_to_string(&layout.cache_bust_target).unwrap(),
            r#"<link href="css/main.css?ver=deadbeef">"#
        );
    }

    #[test]
    fn missing_target_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let layout = PathsConfig::default().resolve(tmp.path());
        assert!(matches!(
            run(&layout, &token()),
            Err(StageError::CacheBust(CacheBustError::MissingTarget(_)))
        ));
    }
}
