//! Watch loop: rerun the matching stage when a source file changes.
//!
//! | Rule | Pattern | Stages |
//! |---|---|---|
//! | styles | `<styles>/**/*.scss` | sass |
//! | templates | `<templates>/**/*.pug` | pug |
//! | scripts | `<scripts>/**/*.js` | bundle |
//! | images | `<images>/**/*` | copy, webp |
//!
//! After its stages finish, every rule fires the reload callback. Each rule
//! has its own worker thread: changes for one rule are handled one batch at
//! a time, while different rules run concurrently. A burst of changes that
//! arrives while a rule is busy collapses into a single rerun. Stage errors
//! are logged and the loop keeps going.

use crate::compose::{self, StageRunner};
use crate::config::Layout;
use crate::stage::StageId;
use glob::Pattern;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use thiserror::Error;

/// Quiet period before a burst of source changes is dispatched.
pub const RULE_DEBOUNCE: Duration = Duration::from_millis(200);

/// How often the dispatcher checks the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize file watcher: {0}")]
    WatcherInit(#[source] notify::Error),
    #[error("Failed to watch {}: {source}", .path.display())]
    WatchPath {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("Invalid watch pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// One source glob bound to the stages it triggers.
#[derive(Debug, Clone)]
pub struct WatchRule {
    pub name: &'static str,
    /// Directory the pattern lives under; this is what gets watched.
    pub root: PathBuf,
    pub pattern: Pattern,
    pub stages: Vec<StageId>,
}

impl WatchRule {
    fn new(
        name: &'static str,
        root: &Path,
        glob_tail: &str,
        stages: Vec<StageId>,
    ) -> Result<Self, WatchError> {
        let pattern = format!(
            "{}/{glob_tail}",
            Pattern::escape(&root.to_string_lossy())
        );
        let compiled = Pattern::new(&pattern).map_err(|source| WatchError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        Ok(Self {
            name,
            root: root.to_path_buf(),
            pattern: compiled,
            stages,
        })
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.pattern.matches_path(path)
    }
}

/// The four standard rules for `layout`.
pub fn rules(layout: &Layout) -> Result<Vec<WatchRule>, WatchError> {
    Ok(vec![
        WatchRule::new("styles", &layout.styles, "**/*.scss", vec![StageId::Styles])?,
        WatchRule::new("templates", &layout.templates, "**/*.pug", vec![StageId::Templates])?,
        WatchRule::new("scripts", &layout.scripts, "**/*.js", vec![StageId::Bundle])?,
        WatchRule::new(
            "images",
            &layout.images,
            "**/*",
            vec![StageId::Copy, StageId::NextGen],
        )?,
    ])
}

/// Indices of the rules any of `paths` matches.
pub fn matching_rules<'a>(
    rules: &[WatchRule],
    paths: impl IntoIterator<Item = &'a Path>,
) -> Vec<usize> {
    let mut hit = vec![false; rules.len()];
    for path in paths {
        for (i, rule) in rules.iter().enumerate() {
            if rule.matches(path) {
                hit[i] = true;
            }
        }
    }
    hit.iter()
        .enumerate()
        .filter_map(|(i, h)| h.then_some(i))
        .collect()
}

/// Run the watch loop until `stop` is set.
///
/// `on_change` runs after each rule's stages, successful or not.
pub fn run(
    runner: &dyn StageRunner,
    rules: &[WatchRule],
    on_change: &(dyn Fn() + Sync),
    stop: &AtomicBool,
) -> Result<(), WatchError> {
    let (tx, rx) = mpsc::channel();
    let mut debouncer = new_debouncer(RULE_DEBOUNCE, tx).map_err(WatchError::WatcherInit)?;
    for rule in rules {
        if !rule.root.exists() {
            tracing::warn!(rule = rule.name, root = %rule.root.display(), "not watching missing directory");
            continue;
        }
        debouncer
            .watcher()
            .watch(&rule.root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::WatchPath {
                path: rule.root.clone(),
                source,
            })?;
        tracing::info!(rule = rule.name, "watching {}", rule.pattern);
    }

    std::thread::scope(|s| {
        let mut triggers = Vec::with_capacity(rules.len());
        for rule in rules {
            let (trigger, pending) = mpsc::channel::<()>();
            triggers.push(trigger);
            s.spawn(move || worker(runner, rule, pending, on_change));
        }

        while !stop.load(Ordering::SeqCst) {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(events)) => {
                    let hits = matching_rules(rules, events.iter().map(|e| e.path.as_path()));
                    for i in hits {
                        let _ = triggers[i].send(());
                    }
                }
                Ok(Err(error)) => tracing::warn!("watch error: {error:?}"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Dropping the triggers ends the workers.
        drop(triggers);
    });

    drop(debouncer);
    Ok(())
}

fn worker(
    runner: &dyn StageRunner,
    rule: &WatchRule,
    pending: mpsc::Receiver<()>,
    on_change: &(dyn Fn() + Sync),
) {
    let composition = compose::series(rule.stages.iter().copied().map(compose::stage));
    while pending.recv().is_ok() {
        while pending.try_recv().is_ok() {}
        tracing::info!(rule = rule.name, "change detected, running {composition}");
        if let Err(e) = composition.run(runner) {
            tracing::error!(rule = rule.name, "{e}");
        }
        on_change();
    }
}
