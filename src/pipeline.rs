//! The configured pipeline: collaborators, layout, mode, and token in one
//! place, executing compositions stage by stage.
//!
//! ```text
//! PipelineConfig ─┐
//! project root ───┼─► Pipeline ──run_stage(StageId)──► templates / styles / bundle /
//! Mode, token ────┤                                    images::{compress, copy, nextgen} /
//! Collaborators ──┘                                    cachebust
//! ```
//!
//! [`Collaborators::from_config`] wires the real external tools. Tests swap
//! in mocks through the public fields.

use crate::bundle::{self, Bundler, WebpackCli};
use crate::cachebust::{self, CacheToken};
use crate::compose::{Composition, CompositionError, StageRunner};
use crate::config::{Layout, Mode, PipelineConfig};
use crate::css::{PostcssCli, Prefixer};
use crate::images::compress::{self, CompressError, Compressor, TinifyClient};
use crate::images::nextgen::{self, NextGenEncoder, WebpEncoder};
use crate::images::copy;
use crate::notice::{ConsoleNotifier, Notifier};
use crate::stage::{StageError, StageId, StageReport};
use crate::styles::{self, SassCli, StylesheetCompiler};
use crate::templates::{self, PugCli, TemplateCompiler};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid composition: {0}")]
    Composition(#[from] CompositionError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// The external tools a pipeline drives.
pub struct Collaborators {
    pub templates: Box<dyn TemplateCompiler>,
    pub styles: Box<dyn StylesheetCompiler>,
    pub prefixer: Box<dyn Prefixer>,
    pub bundler: Box<dyn Bundler>,
    /// `None` when no API key is configured; the compress stage then fails
    /// or, with `compress.skip_without_key`, is skipped.
    pub compressor: Option<Box<dyn Compressor>>,
    pub encoder: Box<dyn NextGenEncoder>,
    pub notifier: Box<dyn Notifier>,
}

impl Collaborators {
    /// The command-line tools and HTTP client named in `config`, run from `root`.
    pub fn from_config(config: &PipelineConfig, root: &Path) -> Self {
        let compressor = match TinifyClient::from_config(&config.compress) {
            Ok(client) => Some(Box::new(client) as Box<dyn Compressor>),
            Err(e) => {
                tracing::debug!("compression unavailable: {e}");
                None
            }
        };
        Self {
            templates: Box::new(PugCli::new(config.templates.command.clone(), root)),
            styles: Box::new(SassCli::new(config.styles.command.clone(), root)),
            prefixer: Box::new(PostcssCli::new(
                config.styles.prefixer.clone(),
                config.styles.browsers.clone(),
                root,
            )),
            bundler: Box::new(WebpackCli::new(config.bundle.command.clone(), root)),
            compressor,
            encoder: Box::new(WebpEncoder),
            notifier: Box::new(ConsoleNotifier),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    layout: Layout,
    mode: Mode,
    token: CacheToken,
    collaborators: Collaborators,
}

impl Pipeline {
    /// A pipeline rooted at `root` with a freshly generated cache token.
    pub fn new(
        config: PipelineConfig,
        root: &Path,
        mode: Mode,
        collaborators: Collaborators,
    ) -> Self {
        let layout = config.paths.resolve(root);
        Self {
            config,
            layout,
            mode,
            token: CacheToken::generate(),
            collaborators,
        }
    }

    /// Replace the generated token.
    pub fn with_token(mut self, token: CacheToken) -> Self {
        self.token = token;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn token(&self) -> &CacheToken {
        &self.token
    }

    /// Validate `composition`, check that every stage it names can run, then run it.
    pub fn execute(&self, composition: &Composition) -> Result<Vec<StageReport>, PipelineError> {
        composition.validate(&self.layout)?;
        if composition.stages().contains(&StageId::Compress)
            && self.collaborators.compressor.is_none()
            && !self.config.compress.skip_without_key
        {
            return Err(StageError::from(CompressError::MissingApiKey).into());
        }
        tracing::info!(mode = ?self.mode, "running {composition}");
        Ok(composition.run(self)?)
    }
}

impl StageRunner for Pipeline {
    fn run_stage(&self, stage: StageId) -> Result<StageReport, StageError> {
        let c = &self.collaborators;
        let layout = &self.layout;
        match stage {
            StageId::Templates => templates::run(c.templates.as_ref(), c.notifier.as_ref(), layout),
            StageId::Styles => styles::run(
                c.styles.as_ref(),
                c.prefixer.as_ref(),
                c.notifier.as_ref(),
                layout,
                self.mode,
            ),
            StageId::Bundle => bundle::run(c.bundler.as_ref(), layout, &self.config.bundle),
            StageId::Compress => match &c.compressor {
                Some(compressor) => compress::run(compressor.as_ref(), layout, &self.config.compress),
                None if self.config.compress.skip_without_key => {
                    tracing::warn!(stage = "tinypng", "{}, skipping", CompressError::MissingApiKey);
                    Ok(StageReport::new(StageId::Compress))
                }
                None => Err(CompressError::MissingApiKey.into()),
            },
            StageId::Copy => copy::run(
                layout,
                &layout.root.join(&self.config.compress.signature_file),
            ),
            StageId::NextGen => nextgen::run(c.encoder.as_ref(), layout, &self.config.nextgen),
            StageId::CacheBust => cachebust::run(layout, &self.token),
        }
    }
}
