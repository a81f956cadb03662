use clap::{Parser, Subcommand};
use sitepipe::compose::{self, Composition};
use sitepipe::config::{self, API_KEY_ENV, MODE_ENV, Mode};
use sitepipe::pipeline::{Collaborators, Pipeline};
use sitepipe::{output, server};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sitepipe")]
#[command(about = "Asset build pipeline for static sites")]
#[command(long_about = "\
Asset build pipeline for static sites

Compiles templates and stylesheets, bundles scripts, compresses and converts
images, stamps cache-busting tokens, and serves the result with live reload.

Project structure (defaults, all configurable in sitepipe.toml):

  ./
  ├── sitepipe.toml            # Optional, sparse overrides of the stock config
  ├── webpack.config.js        # Bundler configuration
  ├── src/
  │   ├── pug/                 # Templates (_partial.pug files are not compiled)
  │   ├── scss/                # Stylesheets (_partial.scss files are not compiled)
  │   ├── js/                  # Script sources, bundled by webpack
  │   └── img/                 # Source images (compressed in place)
  └── dist/                    # Output: pages, css/, js/, img/

The build runs:

  series(parallel(sass, bundle, pug), tinypng, copy, webp, cache)

Stylesheets are prefixed by postcss with autoprefixer (styles.prefixer).
Image compression needs a Tinify key in TINIFY_API_KEY or compress.api_key;
set compress.skip_without_key = true to build without one.

Run 'sitepipe plan build' to see the tree with paths, and
'sitepipe gen-config' for a documented sitepipe.toml.")]
#[command(version)]
struct Cli {
    /// Project root
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Config file (defaults to <root>/sitepipe.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Production mode: grouped media queries in stylesheets
    #[arg(long, global = true)]
    production: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full build
    Build,
    /// Serve the output with live reload and rerun stages on change
    #[command(alias = "default")]
    Dev,
    /// Compile stylesheets
    Sass,
    /// Compile templates
    Pug,
    /// Bundle scripts
    Bundle,
    /// Stamp cache-busting tokens into the main page
    Cache,
    /// Compress source images in place
    Tinypng,
    /// Encode next-gen image siblings
    Webp,
    /// Copy source images to the output
    Copy,
    /// Run the image pipeline: tinypng → webp → copy
    Image,
    /// Print a composition tree without running it
    Plan {
        /// build, image, or a single stage name
        #[arg(default_value = "build")]
        name: String,
    },
    /// Print a stock sitepipe.toml with all options documented
    GenConfig,
}

impl Command {
    /// Task name of the composition this command runs, if it runs one.
    fn task_name(&self) -> Option<&'static str> {
        match self {
            Command::Build => Some("build"),
            Command::Sass => Some("sass"),
            Command::Pug => Some("pug"),
            Command::Bundle => Some("bundle"),
            Command::Cache => Some("cache"),
            Command::Tinypng => Some("tinypng"),
            Command::Webp => Some("webp"),
            Command::Copy => Some("copy"),
            Command::Image => Some("image"),
            Command::Dev | Command::Plan { .. } | Command::GenConfig => None,
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
        _ => EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn lookup(name: &str) -> Result<Composition, String> {
    compose::named(name).ok_or_else(|| format!("unknown task '{name}'"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    init_logging(cli.verbose);

    let mut pipeline_config = config::load_config(&cli.root, cli.config.as_deref())?;
    pipeline_config.apply_env(std::env::var(API_KEY_ENV).ok());
    let mode = Mode::resolve(cli.production, std::env::var(MODE_ENV).ok().as_deref());

    if let Command::Plan { name } = &cli.command {
        let composition = lookup(name)?;
        let layout = pipeline_config.paths.resolve(&cli.root);
        composition.validate(&layout)?;
        output::print_plan(name, &composition, &layout);
        return Ok(());
    }

    let collaborators = Collaborators::from_config(&pipeline_config, &cli.root);
    let pipeline = Pipeline::new(pipeline_config, &cli.root, mode, collaborators);

    match cli.command.task_name() {
        Some(name) => {
            let composition = lookup(name)?;
            let reports = pipeline.execute(&composition)?;
            output::print_reports(&reports);
        }
        None => server::run_dev(&pipeline)?,
    }

    Ok(())
}
