use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::{Builder, Target};
use futures::StreamExt;
use log::LevelFilter;
use tokio_util::sync::CancellationToken;

use softcover_images::{
    ImagePipeline, ImageRequest, LoadPhase, Locator, PipelineConfig, PixelUnit,
    TransformSpec,
};

#[derive(Parser)]
#[command(
    name = "softcover-images",
    about = "Fetch, cache and inspect cover images"
)]
struct Cli {
    /// TOML pipeline configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `cache_dir` from the configuration
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    #[command(flatten)]
    size: SizeArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SizeArgs {
    /// Longest-side bound; omit for full resolution
    #[arg(long, global = true)]
    max_dimension: Option<u32>,
    #[arg(long, global = true, value_enum, default_value = "points")]
    unit: UnitArg,
    #[arg(long, global = true, default_value_t = 1)]
    scale: u32,
}

impl SizeArgs {
    fn spec(&self) -> TransformSpec {
        TransformSpec {
            max_dimension: self.max_dimension,
            unit: self.unit.into(),
            scale: self.scale,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum UnitArg {
    Points,
    Pixels,
}

impl From<UnitArg> for PixelUnit {
    fn from(value: UnitArg) -> Self {
        match value {
            UnitArg::Points => PixelUnit::Points,
            UnitArg::Pixels => PixelUnit::Pixels,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Load one image through every cache tier and save it
    Fetch {
        url: String,
        /// Output file; the format follows the extension
        #[arg(long, short, default_value = "cover.png")]
        out: PathBuf,
        /// Report download progress
        #[arg(long)]
        progress: bool,
    },
    /// Warm the caches for several images
    Prefetch {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Drop every cached copy of one image
    Invalidate { url: String },
    /// Empty the disk cache
    Clear,
    /// Show cache location, limits and usage
    Stats,
}

fn init_logger() {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        Builder::new()
            .target(Target::Stderr)
            .filter_level(LevelFilter::Warn)
            .filter_module("softcover_images", LevelFilter::Info)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = Some(dir.clone());
    }

    let pipeline = ImagePipeline::new(config)?;
    let spec = cli.size.spec();

    match cli.command {
        Command::Fetch { url, out, progress } => {
            fetch(&pipeline, &url, spec, &out, progress).await
        }
        Command::Prefetch { urls } => {
            let locators = urls
                .iter()
                .map(|url| parse_url(url))
                .collect::<Result<Vec<_>>>()?;
            let total = locators.len();
            let warmed = pipeline
                .prefetch(locators, spec, &CancellationToken::new())
                .await;
            println!("prefetched {warmed}/{total}");
            Ok(())
        }
        Command::Invalidate { url } => {
            let locator = parse_url(&url)?;
            pipeline.invalidate(&locator, Some(&spec)).await;
            println!("invalidated {locator}");
            Ok(())
        }
        Command::Clear => {
            pipeline.clear_all().await;
            println!("cleared {}", pipeline.disk().root().display());
            Ok(())
        }
        Command::Stats => {
            let disk = pipeline.disk();
            let limits = disk.limits();
            println!("cache dir: {}", disk.root().display());
            println!("ttl:       {:?}", limits.ttl);
            println!("budget:    {}", limits.max_bytes);
            println!("usage:     {}", disk.usage_bytes().await);
            Ok(())
        }
    }
}

fn parse_url(url: &str) -> Result<Locator> {
    Locator::parse(url).with_context(|| format!("invalid URL {url}"))
}

async fn fetch(
    pipeline: &ImagePipeline,
    url: &str,
    spec: TransformSpec,
    out: &Path,
    progress: bool,
) -> Result<()> {
    let locator = parse_url(url)?;
    let request = ImageRequest::new(locator, spec);
    let handle = if progress {
        pipeline.load_with_progress(request)
    } else {
        pipeline.load(request)
    };

    let mut phases = Box::pin(handle.into_stream());
    while let Some(phase) = phases.next().await {
        match phase {
            LoadPhase::Empty => {}
            LoadPhase::Progress(fraction) => {
                eprint!("\r{:>5.1}%", fraction * 100.0);
            }
            LoadPhase::Success(image) => {
                if progress {
                    eprintln!();
                }
                image
                    .as_dynamic()
                    .save(out)
                    .with_context(|| {
                        format!("failed to write {}", out.display())
                    })?;
                println!(
                    "{}x{} -> {}",
                    image.width(),
                    image.height(),
                    out.display()
                );
                return Ok(());
            }
            LoadPhase::Failure(err) => bail!("load failed: {err}"),
        }
    }
    bail!("load ended without a result")
}
