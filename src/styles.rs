//! Stylesheet stage: `*.scss` → post-processed CSS plus source maps.
//!
//! Entries are every non-partial `.scss` file under the stylesheet root.
//! Partials are reached through `@use`/`@import` with the stylesheet root on
//! the load path. For `src/scss/pages/home.scss` the stage writes:
//!
//! ```text
//! dist/css/pages/home.css
//!     ...
//!     /*# sourceMappingURL=sourcemaps/pages/home.css.map */
//! dist/css/sourcemaps/pages/home.css.map
//! ```
//!
//! The compiled CSS goes through [`PostProcessor`] before it is written.
//! Compile and post-processing errors are reported through the [`Notifier`]
//! and do not fail the stage; the entry's output and map are removed so no
//! unprocessed CSS is served. A run without errors ends with one success
//! notice.

use crate::cache;
use crate::config::{Layout, Mode};
use crate::css::{PostProcessor, Prefixer};
use crate::notice::{Notice, Notifier};
use crate::stage::{self, StageError, StageId, StageReport};
use crate::tool::{self, ToolError};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Directory under the CSS output root that holds the maps.
pub const SOURCEMAP_DIR: &str = "sourcemaps";

/// Compiler output for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCss {
    pub css: String,
    pub map: Option<String>,
}

/// Compiles one stylesheet entry.
pub trait StylesheetCompiler: Sync {
    /// Compile `source` with `load_path` for imports. `scratch` is the final
    /// CSS location; a compiler may write there while it works.
    fn compile(&self, source: &Path, load_path: &Path, scratch: &Path)
    -> Result<CompiledCss, ToolError>;
}

/// dart-sass command-line compiler, expanded style with a source map.
pub struct SassCli {
    command: Vec<String>,
    cwd: PathBuf,
}

impl SassCli {
    pub fn new(command: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
        }
    }
}

impl StylesheetCompiler for SassCli {
    fn compile(
        &self,
        source: &Path,
        load_path: &Path,
        scratch: &Path,
    ) -> Result<CompiledCss, ToolError> {
        let mut cmd = tool::command(&self.command, &self.cwd)?;
        cmd.arg("--style=expanded")
            .arg("--source-map")
            .arg("--source-map-urls=relative")
            .arg("--load-path")
            .arg(load_path)
            .arg(source)
            .arg(scratch);
        tool::run(&mut cmd, None)?;

        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|source| ToolError::Input {
                path: path.to_path_buf(),
                source,
            })
        };
        let css = read(scratch)?;
        let map_path = append_extension(scratch, "map");
        let map = if map_path.exists() {
            let map = read(&map_path)?;
            // The map is rewritten under sourcemaps/ by the stage.
            discard(&map_path);
            Some(map)
        } else {
            None
        };
        Ok(CompiledCss { css, map })
    }
}

/// Stylesheet sources that are compiled on their own (partials excluded).
pub fn entries(style_root: &Path) -> Result<Vec<PathBuf>, StageError> {
    Ok(stage::discover(style_root, &["scss".to_string()])?
        .into_iter()
        .filter(|p| !stage::is_partial(p))
        .collect())
}

/// Run the stylesheet stage.
pub fn run(
    compiler: &dyn StylesheetCompiler,
    prefixer: &dyn Prefixer,
    notifier: &dyn Notifier,
    layout: &Layout,
    mode: Mode,
) -> Result<StageReport, StageError> {
    let started = Instant::now();
    let mut report = StageReport::new(StageId::Styles);
    let post = PostProcessor::new(mode);
    let sources = entries(&layout.styles)?;

    let results: Vec<Result<bool, StageError>> = sources
        .par_iter()
        .map(|source| compile_one(compiler, prefixer, notifier, layout, post, source))
        .collect();

    for result in results {
        if result? {
            report.processed += 1;
        } else {
            report.failed += 1;
        }
    }

    if report.failed == 0 && report.processed > 0 {
        notifier.notify(Notice::success("sass", "Stylesheets compiled"));
    }
    report.duration = started.elapsed();
    Ok(report)
}

fn compile_one(
    compiler: &dyn StylesheetCompiler,
    prefixer: &dyn Prefixer,
    notifier: &dyn Notifier,
    layout: &Layout,
    post: PostProcessor,
    source: &Path,
) -> Result<bool, StageError> {
    let out = stage::rebase(source, &layout.styles, &layout.css_output, "css");
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let rel = cache::relative_key(&layout.css_output, &out);
    let map_rel = format!("{SOURCEMAP_DIR}/{rel}.map");
    let map_path = layout.css_output.join(&map_rel);

    let result = compiler
        .compile(source, &layout.styles, &out)
        .map_err(|e| e.to_string())
        .and_then(|compiled| {
            post.process(strip_source_map_comment(&compiled.css), prefixer)
                .map(|css| (css, compiled.map))
                .map_err(|e| e.to_string())
        });
    let (processed, map) = match result {
        Ok(done) => done,
        Err(message) => {
            discard(&out);
            discard(&map_path);
            notifier.notify(Notice::error(
                "sass",
                format_args!("{}: {message}", source.display()),
            ));
            return Ok(false);
        }
    };

    let mut css = processed.trim_end().to_string();
    css.push('\n');

    if let Some(map) = map {
        if let Some(parent) = map_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&map_path, relocate_map(&map, &rel))?;
        css.push_str(&format!("/*# sourceMappingURL={map_rel} */\n"));
    }

    fs::write(&out, css)?;
    tracing::debug!(source = %source.display(), output = %out.display(), "compiled stylesheet");
    Ok(true)
}

/// Drop the compiler's trailing `sourceMappingURL` comment; the stage writes
/// its own once the map has moved.
fn strip_source_map_comment(css: &str) -> &str {
    match css.rfind("/*# sourceMappingURL=") {
        Some(idx) => css[..idx].trim_end(),
        None => css,
    }
}

/// Adjust a map written next to `<rel>` so it is valid from
/// `sourcemaps/<rel>.map`: relative sources and `file` are re-rooted at the
/// new location. Unparseable maps are kept verbatim.
fn relocate_map(map: &str, rel: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(map) else {
        return map.to_string();
    };
    let mut rel_dir: Vec<&str> = rel.split('/').collect();
    rel_dir.pop();
    let up = "../".repeat(rel_dir.len() + 1);

    if let Some(sources) = value.get_mut("sources").and_then(|s| s.as_array_mut()) {
        for source in sources.iter_mut() {
            if let Some(s) = source.as_str()
                && !s.contains(':')
                && !s.starts_with('/')
            {
                let joined = normalize(rel_dir.iter().copied().chain(s.split('/')));
                *source = serde_json::Value::String(format!("{up}{joined}"));
            }
        }
    }
    if let Some(obj) = value.as_object_mut() {
        obj.insert("file".into(), serde_json::Value::String(format!("{up}{rel}")));
    }
    serde_json::to_string(&value).unwrap_or_else(|_| map.to_string())
}

/// Collapse `.` and `name/..` pairs in a `/`-separated relative path.
fn normalize<'a>(segments: impl Iterator<Item = &'a str>) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in segments {
        match seg {
            "" | "." => {}
            ".." if out.last().is_some_and(|last| *last != "..") => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.join("/")
}

/// Remove a stale output file. A missing file is fine; anything else is
/// logged since the stage outcome does not depend on it.
fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), "could not remove: {e}");
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::css::tests::{FailingPrefixer, NoPrefixes};
    use crate::notice::tests::RecordingNotifier;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Returns the source text as CSS with a map, writing it to the scratch
    /// path first like sass does; fails on sources containing `!fail`.
    #[derive(Default)]
    pub struct MockStyles {
        pub compiled: Mutex<Vec<PathBuf>>,
    }

    impl StylesheetCompiler for MockStyles {
        fn compile(
            &self,
            source: &Path,
            _load_path: &Path,
            scratch: &Path,
        ) -> Result<CompiledCss, ToolError> {
            self.compiled.lock().unwrap().push(source.to_path_buf());
            let text = fs::read_to_string(source).unwrap();
            fs::write(scratch, &text).unwrap();
            if text.contains("!fail") {
                return Err(ToolError::Failed {
                    program: "sass".into(),
                    status: "exit status: 65".into(),
                    message: "expected \"}\"".into(),
                });
            }
            Ok(CompiledCss {
                css: format!("{text}\n\n/*# sourceMappingURL=x.css.map */\n"),
                map: Some(r#"{"version":3,"sources":["../../src/scss/x.scss"],"mappings":""}"#.into()),
            })
        }
    }

    fn project() -> (TempDir, Layout) {
        let tmp = TempDir::new().unwrap();
        let layout = PathsConfig::default().resolve(tmp.path());
        let scss = &layout.styles;
        fs::create_dir_all(scss.join("pages")).unwrap();
        fs::write(scss.join("main.scss"), ".b { z-index: 1; color: red }").unwrap();
        fs::write(scss.join("pages/home.scss"), ".h { margin: 0 }").unwrap();
        fs::write(scss.join("_vars.scss"), "$x: 1;").unwrap();
        (tmp, layout)
    }

    #[test]
    fn entries_skip_partials() {
        let (_tmp, layout) = project();
        let files = entries(&layout.styles).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| !stage::is_partial(p)));
    }

    #[test]
    fn writes_css_and_relocated_map() {
        let (_tmp, layout) = project();
        let notifier = RecordingNotifier::default();
        let report = run(
            &MockStyles::default(),
            &NoPrefixes,
            &notifier,
            &layout,
            Mode::Development,
        )
        .unwrap();

        assert_eq!(report.processed, 2);
        let css = fs::read_to_string(layout.css_output.join("pages/home.css")).unwrap();
        assert!(css.trim_end().ends_with("/*# sourceMappingURL=sourcemaps/pages/home.css.map */"));
        assert_eq!(css.matches("sourceMappingURL").count(), 1);

        let map = fs::read_to_string(layout.css_output.join("sourcemaps/pages/home.css.map")).unwrap();
        let map: serde_json::Value = serde_json::from_str(&map).unwrap();
        assert_eq!(map["sources"][0], "../../../src/scss/x.scss");
        assert_eq!(map["file"], "../../pages/home.css");
    }

    #[test]
    fn output_is_post_processed() {
        let (_tmp, layout) = project();
        run(
            &MockStyles::default(),
            &NoPrefixes,
            &RecordingNotifier::default(),
            &layout,
            Mode::Development,
        )
        .unwrap();
        let css = fs::read_to_string(layout.css_output.join("main.css")).unwrap();
        assert!(css.find("color").unwrap() < css.find("z-index").unwrap(), "{css}");
    }

    #[test]
    fn success_notice_once_per_run() {
        let (_tmp, layout) = project();
        let notifier = RecordingNotifier::default();
        run(&MockStyles::default(), &NoPrefixes, &notifier, &layout, Mode::Development).unwrap();
        assert_eq!(notifier.successes().len(), 1);
        assert!(notifier.errors().is_empty());
    }

    #[test]
    fn compile_error_is_notified_without_success() {
        let (_tmp, layout) = project();
        fs::write(layout.styles.join("broken.scss"), "!fail").unwrap();
        let notifier = RecordingNotifier::default();
        let report = run(
            &MockStyles::default(),
            &NoPrefixes,
            &notifier,
            &layout,
            Mode::Development,
        )
        .unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(notifier.errors().len(), 1);
        assert!(notifier.successes().is_empty());
        assert!(!layout.css_output.join("broken.css").exists());
    }

    #[test]
    fn post_processing_error_leaves_no_output() {
        let (_tmp, layout) = project();
        let notifier = RecordingNotifier::default();
        run(&MockStyles::default(), &NoPrefixes, &notifier, &layout, Mode::Development).unwrap();
        let map = layout.css_output.join("sourcemaps/main.css.map");
        assert!(map.is_file());

        let report = run(
            &MockStyles::default(),
            &FailingPrefixer,
            &notifier,
            &layout,
            Mode::Development,
        )
        .unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(notifier.errors().len(), 2);
        assert!(notifier.errors()[0].message.contains("prefixing failed"));
        assert!(!layout.css_output.join("main.css").exists());
        assert!(!layout.css_output.join("pages/home.css").exists());
        assert!(!map.exists());
    }

    #[test]
    fn discard_ignores_missing_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.css");
        discard(&path);
        fs::write(&path, "x").unwrap();
        discard(&path);
        assert!(!path.exists());
    }

    #[test]
    fn strip_comment_only_touches_trailer() {
        assert_eq!(
            strip_source_map_comment(".a{}\n/*# sourceMappingURL=a.css.map */\n"),
            ".a{}"
        );
        assert_eq!(strip_source_map_comment(".a{}"), ".a{}");
    }

    #[test]
    fn relocate_keeps_absolute_sources() {
        let map = r#"{"version":3,"sources":["file:///x.scss","a.scss"]}"#;
        let out: serde_json::Value = serde_json::from_str(&relocate_map(map, "main.css")).unwrap();
        assert_eq!(out["sources"][0], "file:///x.scss");
        assert_eq!(out["sources"][1], "../a.scss");
        assert_eq!(out["file"], "../main.css");
    }

    #[test]
    fn normalize_collapses_parent_segments() {
        assert_eq!(normalize("pages/../../src/a.scss".split('/')), "../src/a.scss");
        assert_eq!(normalize("./a/./b".split('/')), "a/b");
    }

    #[test]
    fn unparseable_map_is_kept() {
        assert_eq!(relocate_map("not json", "a.css"), "not json");
    }
}
