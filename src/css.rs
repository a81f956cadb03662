//! CSS post-processing on the compiled stylesheet.
//!
//! Four steps run in this order:
//!
//! 1. media-query grouping (production only)
//! 2. vendor prefixing through the [`Prefixer`] (autoprefixer, with grid
//!    prefixes in `autoplace` mode)
//! 3. alphabetical sort of the declarations inside every rule
//! 4. media-query grouping again (production only), since prefixing can
//!    add rules
//!
//! Grouping and sorting work on a parsed `lightningcss` stylesheet that is
//! printed back unminified. They only move rules and declarations around:
//! nothing the author wrote is merged, shortened, or dropped, so fallback
//! declarations such as `background: red; background: linear-gradient(..)`
//! survive.
//!
//! Grouping merges every top-level `@media` block with the same query into
//! one block and moves the merged blocks to the end of the sheet, in order of
//! first appearance.

use crate::config::Mode;
use crate::tool::{self, ToolError};
use lightningcss::media_query::MediaList;
use lightningcss::properties::Property;
use lightningcss::rules::CssRule;
use lightningcss::rules::media::MediaRule;
use lightningcss::stylesheet::{ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::traits::ToCss;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

/// Grid prefixing mode handed to autoprefixer.
pub const GRID_MODE: &str = "autoplace";

const VENDOR_PREFIXES: [&str; 4] = ["-webkit-", "-moz-", "-ms-", "-o-"];

#[derive(Error, Debug)]
pub enum CssError {
    #[error("CSS processing error: {0}")]
    Process(String),
    #[error("prefixing failed: {0}")]
    Prefix(#[from] ToolError),
}

impl<T: std::fmt::Display> From<lightningcss::error::Error<T>> for CssError {
    fn from(e: lightningcss::error::Error<T>) -> Self {
        CssError::Process(e.to_string())
    }
}

/// Adds vendor prefixes to a stylesheet without touching anything else.
pub trait Prefixer: Sync {
    fn prefix(&self, css: &str) -> Result<String, ToolError>;
}

/// `postcss --use autoprefixer`, reading stdin and writing stdout.
///
/// Targets come from the configured browserslist queries through the
/// `BROWSERSLIST` environment variable, which takes precedence over any
/// browserslist config in the project.
pub struct PostcssCli {
    command: Vec<String>,
    browsers: Vec<String>,
    cwd: PathBuf,
}

impl PostcssCli {
    pub fn new(command: Vec<String>, browsers: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            browsers,
            cwd: cwd.into(),
        }
    }

    fn command(&self) -> Result<Command, ToolError> {
        let mut cmd = tool::command(&self.command, &self.cwd)?;
        cmd.args(["--use", "autoprefixer", "--no-map"])
            .env("BROWSERSLIST", self.browsers.join(", "))
            .env("AUTOPREFIXER_GRID", GRID_MODE);
        Ok(cmd)
    }
}

impl Prefixer for PostcssCli {
    fn prefix(&self, css: &str) -> Result<String, ToolError> {
        tool::run_to_string(&mut self.command()?, Some(css.as_bytes()))
    }
}

/// Configured post-processor, built once per stage run.
#[derive(Debug, Clone, Copy)]
pub struct PostProcessor {
    group_media: bool,
}

impl PostProcessor {
    pub fn new(mode: Mode) -> Self {
        Self {
            group_media: mode.is_production(),
        }
    }

    /// Run the full post-processing order over `css`.
    pub fn process(&self, css: &str, prefixer: &dyn Prefixer) -> Result<String, CssError> {
        let prefixed = if self.group_media {
            prefixer.prefix(&rewrite(css, group_media_queries)?)?
        } else {
            prefixer.prefix(css)?
        };
        rewrite(&prefixed, |rules| {
            sort_declarations(rules);
            if self.group_media {
                group_media_queries(rules)?;
            }
            Ok(())
        })
    }
}

/// Parse `css`, edit its top-level rules, and print it back unminified.
fn rewrite(
    css: &str,
    edit: impl FnOnce(&mut Vec<CssRule<'_>>) -> Result<(), CssError>,
) -> Result<String, CssError> {
    let mut sheet = StyleSheet::parse(css, ParserOptions::default())?;
    edit(&mut sheet.rules.0)?;
    Ok(sheet.to_css(PrinterOptions::default())?.code)
}

/// Merge same-query `@media` blocks and move them after all other rules.
fn group_media_queries(rules: &mut Vec<CssRule<'_>>) -> Result<(), CssError> {
    let mut kept = Vec::with_capacity(rules.len());
    let mut groups: Vec<(String, MediaRule<'_>)> = Vec::new();

    for rule in rules.drain(..) {
        match rule {
            CssRule::Media(media) => {
                let key = query_key(&media.query)?;
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, existing)) => existing.rules.0.extend(media.rules.0),
                    None => groups.push((key, media)),
                }
            }
            other => kept.push(other),
        }
    }

    kept.extend(groups.into_iter().map(|(_, media)| CssRule::Media(media)));
    *rules = kept;
    Ok(())
}

fn query_key(query: &MediaList<'_>) -> Result<String, CssError> {
    Ok(query.to_css_string(PrinterOptions::default())?)
}

/// Sort declarations alphabetically by unprefixed property name, recursing
/// into nested rule lists. The sort is stable: prefixed variants stay just
/// before their standard property and repeated fallbacks keep their order.
fn sort_declarations(rules: &mut [CssRule<'_>]) {
    for rule in rules {
        match rule {
            CssRule::Style(style) => {
                sort_by_name(&mut style.declarations.declarations);
                sort_by_name(&mut style.declarations.important_declarations);
                sort_declarations(&mut style.rules.0);
            }
            CssRule::Media(media) => sort_declarations(&mut media.rules.0),
            CssRule::Supports(supports) => sort_declarations(&mut supports.rules.0),
            _ => {}
        }
    }
}

fn sort_by_name(declarations: &mut [Property<'_>]) {
    declarations.sort_by_cached_key(|p| unprefixed(&p.property_id().name().to_string()).to_string());
}

fn unprefixed(name: &str) -> &str {
    VENDOR_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::path::Path;

    /// Returns the stylesheet unchanged.
    pub struct NoPrefixes;

    impl Prefixer for NoPrefixes {
        fn prefix(&self, css: &str) -> Result<String, ToolError> {
            Ok(css.to_string())
        }
    }

    /// Returns a fixed prefixed stylesheet whatever the input.
    struct Canned(&'static str);

    impl Prefixer for Canned {
        fn prefix(&self, _css: &str) -> Result<String, ToolError> {
            Ok(self.0.to_string())
        }
    }

    pub struct FailingPrefixer;

    impl Prefixer for FailingPrefixer {
        fn prefix(&self, _css: &str) -> Result<String, ToolError> {
            Err(ToolError::Failed {
                program: "postcss".into(),
                status: "exit status: 1".into(),
                message: "CssSyntaxError: Unknown word".into(),
            })
        }
    }

    fn dev() -> PostProcessor {
        PostProcessor::new(Mode::Development)
    }

    #[test]
    fn declarations_are_sorted() {
        let out = dev()
            .process(".a { z-index: 1; color: red; margin: 0 }", &NoPrefixes)
            .unwrap();
        let color = out.find("color").unwrap();
        let margin = out.find("margin").unwrap();
        let z = out.find("z-index").unwrap();
        assert!(color < margin && margin < z, "{out}");
    }

    #[test]
    fn fallback_declarations_survive() {
        let out = dev()
            .process(
                ".a { background: red; background: linear-gradient(red, blue) }",
                &NoPrefixes,
            )
            .unwrap();
        assert_eq!(out.matches("background:").count(), 2, "{out}");
        assert!(out.find("background: red").unwrap() < out.find("linear-gradient").unwrap());
    }

    #[test]
    fn longhands_are_not_merged() {
        let out = dev()
            .process(
                ".a { margin-top: 0; margin-right: 0; margin-bottom: 0; margin-left: 0 }",
                &NoPrefixes,
            )
            .unwrap();
        assert!(!out.contains("margin:"), "{out}");
        assert_eq!(out.matches("margin-").count(), 4, "{out}");
    }

    #[test]
    fn prefixed_variants_stay_before_standard_property() {
        let prefixed = ".a { z-index: 1; -webkit-user-select: none; -ms-user-select: none; user-select: none; color: red }";
        let out = dev().process(".a {}", &Canned(prefixed)).unwrap();
        let color = out.find("color").unwrap();
        let webkit = out.find("-webkit-user-select").unwrap();
        let ms = out.find("-ms-user-select").unwrap();
        let standard = out.find("\n  user-select").unwrap();
        let z = out.find("z-index").unwrap();
        assert!(color < webkit && webkit < ms && ms < standard && standard < z, "{out}");
    }

    #[test]
    fn grid_prefixes_are_kept() {
        let prefixed = ".g { display: -ms-grid; display: grid; -ms-grid-columns: 1fr 1fr; \
                        grid-template-columns: 1fr 1fr; grid-template-areas: \"a b\" }";
        let out = dev().process(".g {}", &Canned(prefixed)).unwrap();
        assert!(out.contains("-ms-grid-columns: 1fr 1fr"), "{out}");
        assert!(out.find("display: -ms-grid").unwrap() < out.find("display: grid").unwrap());
    }

    #[test]
    fn prefixer_sees_grouped_css_in_production() {
        struct Check;
        impl Prefixer for Check {
            fn prefix(&self, css: &str) -> Result<String, ToolError> {
                assert_eq!(css.matches("@media").count(), 1, "{css}");
                Ok(css.to_string())
            }
        }
        let css = "@media (min-width: 600px) { .a { color: red } }\n\
                   .b { color: blue }\n\
                   @media (min-width: 600px) { .c { color: green } }";
        PostProcessor::new(Mode::Production)
            .process(css, &Check)
            .unwrap();
    }

    #[test]
    fn production_groups_media_queries_at_end() {
        let css = "@media (min-width: 600px) { .a { color: red } }\n\
                   .b { color: blue }\n\
                   @media (min-width: 600px) { .c { color: green } }";
        let out = PostProcessor::new(Mode::Production)
            .process(css, &NoPrefixes)
            .unwrap();
        assert_eq!(out.matches("@media").count(), 1, "{out}");
        let b = out.find(".b").unwrap();
        let media = out.find("@media").unwrap();
        assert!(b < media, "{out}");
        assert!(out.contains(".a") && out.contains(".c"));
    }

    #[test]
    fn development_keeps_rule_order() {
        let css = "@media (min-width: 600px) { .a { color: red } }\n.b { color: blue }";
        let out = dev().process(css, &NoPrefixes).unwrap();
        assert!(out.find(".a").unwrap() < out.find(".b").unwrap(), "{out}");
    }

    #[test]
    fn distinct_queries_stay_separate() {
        let css = "@media (min-width: 600px) { .a { color: red } }\n\
                   @media print { .b { color: black } }";
        let out = PostProcessor::new(Mode::Production)
            .process(css, &NoPrefixes)
            .unwrap();
        assert_eq!(out.matches("@media").count(), 2, "{out}");
    }

    #[test]
    fn prefixer_failure_is_reported() {
        let result = dev().process(".a { color: red }", &FailingPrefixer);
        assert!(matches!(result, Err(CssError::Prefix(_))));
    }

    #[test]
    fn postcss_gets_targets_and_grid_mode() {
        let cli = PostcssCli::new(
            vec!["npx".into(), "postcss".into()],
            vec!["ie 11".into(), "last 2 versions".into()],
            Path::new("/site"),
        );
        let cmd = cli.command().unwrap();
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec!["postcss", "--use", "autoprefixer", "--no-map"]);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs.contains(&("BROWSERSLIST".as_ref(), Some("ie 11, last 2 versions".as_ref()))));
        assert!(envs.contains(&("AUTOPREFIXER_GRID".as_ref(), Some("autoplace".as_ref()))));
    }

    #[cfg(unix)]
    #[test]
    fn postcss_cli_pipes_css_through_the_command() {
        let script = r#"printf '/* %s | %s */\n' "$BROWSERSLIST" "$AUTOPREFIXER_GRID"; cat"#;
        let cli = PostcssCli::new(
            vec!["sh".into(), "-c".into(), script.into()],
            vec!["ie 11".into()],
            Path::new("."),
        );
        let out = cli.prefix(".a { color: red }").unwrap();
        assert_eq!(out, "/* ie 11 | autoplace */\n.a { color: red }");
    }
}
