//! Pipeline configuration module.
//!
//! Handles loading, validating, and merging `sitepipe.toml`. The file is
//! sparse: stock defaults are serialized to a TOML table and the user file is
//! merged on top before deserializing, so a project only lists what it
//! changes.
//!
//! ## Config File Location
//!
//! `sitepipe.toml` lives in the project root (next to `src/` and `dist/`).
//! A different file can be passed with `--config`.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [paths]
//! templates = "src/pug"
//! styles = "src/scss"
//! scripts = "src/js"
//! images = "src/img"
//! output = "dist"
//! css_output = "dist/css"
//! js_output = "dist/js"
//! image_output = "dist/img"
//! cache_bust_target = "dist/index.html"
//!
//! [templates]
//! command = ["npx", "pug"]
//!
//! [styles]
//! command = ["npx", "sass"]
//! prefixer = ["npx", "postcss"]
//! browsers = ["defaults"]
//!
//! [bundle]
//! command = ["npx", "webpack"]
//! config_file = "webpack.config.js"
//! fail_on_error = false
//!
//! [compress]
//! # api_key = "..."          # or TINIFY_API_KEY
//! skip_without_key = false
//! endpoint = "https://api.tinify.com/shrink"
//! parallel = 10
//! signature_file = "src/img/.tinypng-sigs"
//! extensions = ["png", "jpg", "jpeg"]
//!
//! [nextgen]
//! extensions = ["png", "jpg", "jpeg"]
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! debounce_ms = 1000
//! open = true
//! ignore = [".git", "node_modules", "target"]
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config file name, looked up in the project root.
pub const CONFIG_FILENAME: &str = "sitepipe.toml";

/// Environment variable that overrides `compress.api_key`.
pub const API_KEY_ENV: &str = "TINIFY_API_KEY";

/// Environment variable that selects the build mode when `--production` is absent.
pub const MODE_ENV: &str = "SITEPIPE_MODE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Build mode. Production enables media-query grouping in the stylesheet stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl Mode {
    /// Resolve the mode from the CLI flag, falling back to `SITEPIPE_MODE`.
    pub fn resolve(production_flag: bool, env_value: Option<&str>) -> Self {
        if production_flag {
            return Mode::Production;
        }
        match env_value {
            Some(v) if v.eq_ignore_ascii_case("production") => Mode::Production,
            _ => Mode::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Mode::Production
    }
}

/// Pipeline configuration loaded from `sitepipe.toml`.
///
/// All fields have defaults matching the conventional `src/` → `dist/` layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Source and output locations, relative to the project root.
    pub paths: PathsConfig,
    /// Template compiler invocation.
    pub templates: TemplatesConfig,
    /// Stylesheet compiler invocation and prefixing targets.
    pub styles: StylesConfig,
    /// Bundler invocation and error policy.
    pub bundle: BundleConfig,
    /// Remote image compression settings.
    pub compress: CompressConfig,
    /// Next-gen image variant settings.
    pub nextgen: NextGenConfig,
    /// Development server settings.
    pub server: ServerConfig,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.templates.command.is_empty() {
            return Err(ConfigError::Validation(
                "templates.command must not be empty".into(),
            ));
        }
        if self.styles.command.is_empty() {
            return Err(ConfigError::Validation(
                "styles.command must not be empty".into(),
            ));
        }
        if self.styles.prefixer.is_empty() {
            return Err(ConfigError::Validation(
                "styles.prefixer must not be empty".into(),
            ));
        }
        if self.bundle.command.is_empty() {
            return Err(ConfigError::Validation(
                "bundle.command must not be empty".into(),
            ));
        }
        if self.compress.parallel == 0 {
            return Err(ConfigError::Validation(
                "compress.parallel must be at least 1".into(),
            ));
        }
        if self.compress.extensions.is_empty() || self.nextgen.extensions.is_empty() {
            return Err(ConfigError::Validation(
                "image extension lists must not be empty".into(),
            ));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "server.port must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply environment overrides. Only the API key can be overridden.
    pub fn apply_env(&mut self, api_key: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.compress.api_key = Some(key);
        }
    }
}

/// Filesystem layout, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub templates: PathBuf,
    pub styles: PathBuf,
    pub scripts: PathBuf,
    pub images: PathBuf,
    pub output: PathBuf,
    pub css_output: PathBuf,
    pub js_output: PathBuf,
    pub image_output: PathBuf,
    /// The one generated markup file rewritten by the cache-busting stage.
    pub cache_bust_target: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            templates: "src/pug".into(),
            styles: "src/scss".into(),
            scripts: "src/js".into(),
            images: "src/img".into(),
            output: "dist".into(),
            css_output: "dist/css".into(),
            js_output: "dist/js".into(),
            image_output: "dist/img".into(),
            cache_bust_target: "dist/index.html".into(),
        }
    }
}

impl PathsConfig {
    /// Resolve every path against the project root.
    pub fn resolve(&self, root: &Path) -> Layout {
        Layout {
            root: root.to_path_buf(),
            templates: root.join(&self.templates),
            styles: root.join(&self.styles),
            scripts: root.join(&self.scripts),
            images: root.join(&self.images),
            output: root.join(&self.output),
            css_output: root.join(&self.css_output),
            js_output: root.join(&self.js_output),
            image_output: root.join(&self.image_output),
            cache_bust_target: root.join(&self.cache_bust_target),
        }
    }
}

/// Absolute project layout, produced by [`PathsConfig::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub templates: PathBuf,
    pub styles: PathBuf,
    pub scripts: PathBuf,
    pub images: PathBuf,
    pub output: PathBuf,
    pub css_output: PathBuf,
    pub js_output: PathBuf,
    pub image_output: PathBuf,
    pub cache_bust_target: PathBuf,
}

/// Template compiler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplatesConfig {
    /// Program and leading arguments of the template compiler CLI.
    pub command: Vec<String>,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            command: vec!["npx".into(), "pug".into()],
        }
    }
}

/// Stylesheet compiler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StylesConfig {
    /// Program and leading arguments of the stylesheet compiler CLI.
    pub command: Vec<String>,
    /// Program and leading arguments of the postcss CLI; autoprefixer must
    /// be installed next to it.
    pub prefixer: Vec<String>,
    /// Browserslist queries used to decide which vendor prefixes to add.
    pub browsers: Vec<String>,
}

impl Default for StylesConfig {
    fn default() -> Self {
        Self {
            command: vec!["npx".into(), "sass".into()],
            prefixer: vec!["npx".into(), "postcss".into()],
            browsers: vec!["defaults".into()],
        }
    }
}

/// Bundler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundleConfig {
    /// Program and leading arguments of the bundler CLI.
    pub command: Vec<String>,
    /// Bundler configuration file, relative to the project root.
    pub config_file: PathBuf,
    /// When false, a bundler failure is logged and the pipeline continues.
    pub fail_on_error: bool,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            command: vec!["npx".into(), "webpack".into()],
            config_file: "webpack.config.js".into(),
            fail_on_error: false,
        }
    }
}

/// Remote compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressConfig {
    /// Compression service API key. `TINIFY_API_KEY` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Without a key, skip the compression stage with a warning instead of
    /// failing every composition that includes it.
    pub skip_without_key: bool,
    /// Upload endpoint of the compression service.
    pub endpoint: String,
    /// Maximum simultaneous requests.
    pub parallel: usize,
    /// Signature manifest recording already-compressed images.
    pub signature_file: PathBuf,
    /// Raster extensions sent to the service.
    pub extensions: Vec<String>,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            skip_without_key: false,
            endpoint: "https://api.tinify.com/shrink".into(),
            parallel: 10,
            signature_file: "src/img/.tinypng-sigs".into(),
            extensions: vec!["png".into(), "jpg".into(), "jpeg".into()],
        }
    }
}

/// Next-gen variant settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NextGenConfig {
    /// Raster extensions that get a WebP sibling.
    pub extensions: Vec<String>,
}

impl Default for NextGenConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["png".into(), "jpg".into(), "jpeg".into()],
        }
    }
}

/// Development server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Quiet period before a burst of file changes triggers one reload.
    pub debounce_ms: u64,
    /// Open the site in a browser after the server starts.
    pub open: bool,
    /// Directory names under the project root that never trigger a reload.
    pub ignore: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            debounce_ms: 1000,
            open: true,
            ignore: vec![".git".into(), "node_modules".into(), "target".into()],
        }
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(PipelineConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value. `Ok(None)` if it does not exist.
pub fn load_raw_config(config_path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults, then deserialize and validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<PipelineConfig, ConfigError> {
    let base = stock_defaults_value();
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: PipelineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load the project config.
///
/// `explicit` is the `--config` path; without it `sitepipe.toml` in `root`
/// is used when present. An explicit path that does not exist is an error.
pub fn load_config(root: &Path, explicit: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let overlay = match explicit {
        Some(path) => {
            let path = root.join(path);
            match load_raw_config(&path)? {
                Some(v) => Some(v),
                None => {
                    return Err(ConfigError::Validation(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
            }
        }
        None => load_raw_config(&root.join(CONFIG_FILENAME))?,
    };
    resolve_config(overlay)
}

/// Returns a fully-commented stock `sitepipe.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# sitepipe configuration
# =======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys cause an error.

# ---------------------------------------------------------------------------
# Layout (relative to the project root)
# ---------------------------------------------------------------------------
[paths]
templates = "src/pug"
styles = "src/scss"
scripts = "src/js"
images = "src/img"
output = "dist"
css_output = "dist/css"
js_output = "dist/js"
image_output = "dist/img"
# The generated page whose asset references get a ?ver=<token> suffix.
cache_bust_target = "dist/index.html"

# ---------------------------------------------------------------------------
# Templates: files named _*.pug are partials and are never compiled alone
# ---------------------------------------------------------------------------
[templates]
command = ["npx", "pug"]

# ---------------------------------------------------------------------------
# Stylesheets
# ---------------------------------------------------------------------------
[styles]
command = ["npx", "sass"]
# postcss with the autoprefixer plugin; grid prefixes use autoplace mode.
prefixer = ["npx", "postcss"]
# Browserslist queries deciding which vendor prefixes are added.
browsers = ["defaults"]

# ---------------------------------------------------------------------------
# Bundler
# ---------------------------------------------------------------------------
[bundle]
command = ["npx", "webpack"]
config_file = "webpack.config.js"
# false: a bundler failure is logged and the build goes on.
# true: a bundler failure fails the build.
fail_on_error = false

# ---------------------------------------------------------------------------
# Remote image compression (Tinify)
# ---------------------------------------------------------------------------
[compress]
# api_key = "..."   # prefer the TINIFY_API_KEY environment variable
# false: a build that compresses fails up front without a key.
# true: compression is skipped with a warning and the rest still runs.
skip_without_key = false
endpoint = "https://api.tinify.com/shrink"
# Maximum simultaneous uploads.
parallel = 10
# Records images that are already compressed so they are not sent again.
signature_file = "src/img/.tinypng-sigs"
extensions = ["png", "jpg", "jpeg"]

# ---------------------------------------------------------------------------
# Next-gen image variants (WebP written next to each raster in dist/img)
# ---------------------------------------------------------------------------
[nextgen]
extensions = ["png", "jpg", "jpeg"]

# ---------------------------------------------------------------------------
# Development server
# ---------------------------------------------------------------------------
[server]
host = "127.0.0.1"
port = 8080
debounce_ms = 1000
open = true
ignore = [".git", "node_modules", "target"]
"##
}
