//! # sitepipe
//!
//! An asset build pipeline for static sites. It drives the usual front-end
//! tools (a template compiler, a stylesheet compiler, a bundler, an image
//! compression service) over a fixed project layout and composes them into
//! one build with a live-reloading dev server on top.
//!
//! # Architecture: Stages Composed in Series and Parallel
//!
//! Every step is a *stage* with declared inputs and outputs. Stages are
//! combined into a tree of `series` and `parallel` nodes:
//!
//! ```text
//! build = series(parallel(sass, bundle, pug), tinypng, copy, webp, cache)
//! image = series(tinypng, webp, copy)
//! ```
//!
//! Before anything runs, the tree is validated: parallel branches may not
//! write where a sibling reads or writes. External tools sit behind traits
//! ([`templates::TemplateCompiler`], [`styles::StylesheetCompiler`],
//! [`css::Prefixer`], [`bundle::Bundler`], [`images::Compressor`],
//! [`images::NextGenEncoder`])
//! so tests run the whole pipeline against recording mocks.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | `sitepipe.toml` loading, merging over stock defaults, validation, mode |
//! | [`stage`] | Stage identities, declared paths, reports, the shared stage error |
//! | [`compose`] | `series`/`parallel` trees, validation, execution, the named tasks |
//! | [`pipeline`] | Wires config, layout, mode, token and collaborators; runs stages |
//! | [`templates`] | Template stage (pug) |
//! | [`styles`] | Stylesheet stage (sass + source maps) |
//! | [`css`] | CSS post-processing: prefixes, declaration order, media-query grouping |
//! | [`bundle`] | Script bundling stage (webpack) with its failure policy |
//! | [`images`] | Compression, copy, and next-gen encoding of images |
//! | [`cachebust`] | Per-run token and asset reference stamping |
//! | [`cache`] | Content-hash manifests for incremental stages |
//! | [`tool`] | Spawning external command-line tools |
//! | [`notice`] | User-facing success/failure notifications |
//! | [`watch`] | Source watch rules and the rerun loop |
//! | [`server`] | Static dev server with live reload |
//! | [`output`] | CLI output formatting for run summaries and plans |
//!
//! # Design Decisions
//!
//! ## Content Hashes Over Timestamps
//!
//! Incremental stages (compression, next-gen encoding) remember the SHA-256
//! of each source they handled. A file is redone only when its content
//! changes, so checkouts, copies, and clock skew never trigger rework, and
//! compressing an image in place does not make it look new to the next run.
//!
//! ## Tools Stay External
//!
//! Template, stylesheet, and bundler compilers are the projects' own
//! `node_modules` binaries, spawned per file. The pipeline owns ordering,
//! incremental state, and post-processing; it does not reimplement the
//! languages.

pub mod bundle;
pub mod cache;
pub mod cachebust;
pub mod compose;
pub mod config;
pub mod css;
pub mod images;
pub mod notice;
pub mod output;
pub mod pipeline;
pub mod server;
pub mod stage;
pub mod styles;
pub mod templates;
pub mod tool;
pub mod watch;
