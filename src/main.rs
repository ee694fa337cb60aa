use std::fmt::Write as _;

use clap::Parser;
use color_eyre::eyre::{Result, eyre};
use image::Rgba;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use opcache::application::{FetchImagesUseCase, FetchRequest, init_shared_cache};
use opcache::domain::entities::CacheKey;
use opcache::infrastructure::config::{AppConfig, CliArgs, Command, ConfigStorage, FetchArgs};
use opcache::infrastructure::image::{CircleCrop, ProcessingPipeline, Resize, RoundedCorners};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level.to_tracing_level()).into())
        .from_env_lossy();

    if let Some(log_path) = &config.log_path {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let mut config = ConfigStorage::resolve(args.config.as_deref())?.load()?;
    config.merge_with_args(args);
    Ok(config)
}

fn build_pipeline(args: &FetchArgs) -> Option<ProcessingPipeline> {
    let background = Rgba(args.background);
    let mut pipeline = ProcessingPipeline::identity();

    if let Some((width, height)) = args.resize {
        pipeline = pipeline.then(Resize::new(width, height).with_scale(args.scale));
    }
    if let Some(radius) = args.rounded {
        pipeline = pipeline.then(RoundedCorners { radius, background });
    }
    if args.circle {
        pipeline = pipeline.then(CircleCrop { background });
    }

    (!pipeline.is_empty()).then_some(pipeline)
}

/// Variant name for the processing requested on the command line, so that
/// differently processed images never share a cache entry.
fn derive_variant(args: &FetchArgs) -> String {
    let mut variant = String::new();
    if let Some((width, height)) = args.resize {
        let _ = write!(variant, "{width}x{height}@{}", args.scale);
    }
    if let Some(radius) = args.rounded {
        let _ = write!(variant, "-r{radius}");
    }
    if args.circle {
        variant.push_str("-circle");
    }
    if args.rounded.is_some() || args.circle {
        let _ = write!(variant, "-{}", hex::encode(args.background));
    }
    variant
}

async fn run_fetch(config: &AppConfig, args: FetchArgs) -> Result<()> {
    let cache = init_shared_cache(config).await?;
    let processing = build_pipeline(&args);
    let variant = args.variant.clone().unwrap_or_else(|| derive_variant(&args));

    let requests = args
        .urls
        .iter()
        .map(|url| FetchRequest {
            key: CacheKey::new(url.as_str(), variant.as_str()),
            processing: processing.clone(),
        })
        .collect();

    let use_case = FetchImagesUseCase::new(cache.clone(), config.cache.encode_format);
    let results = use_case.execute(requests, args.output.as_deref()).await;
    cache.flush().await;

    let mut failed = 0usize;
    for (url, result) in args.urls.iter().zip(results) {
        match result {
            Ok(report) => println!("{report}"),
            Err(e) => {
                failed += 1;
                eprintln!("{url}: {e}");
            }
        }
    }

    if failed > 0 {
        return Err(eyre!("{failed} of {} fetches failed", args.urls.len()));
    }
    Ok(())
}

async fn run(config: AppConfig, command: Command) -> Result<()> {
    match command {
        Command::Fetch(args) => run_fetch(&config, args).await,
        Command::Remove { url, variant } => {
            let cache = init_shared_cache(&config).await?;
            match variant {
                Some(variant) => cache.remove(&CacheKey::new(url, variant)),
                None => cache.remove_all_for_url(&url),
            }
            cache.flush().await;
            Ok(())
        }
        Command::Clear => {
            let cache = init_shared_cache(&config).await?;
            cache.remove_all();
            cache.flush().await;
            Ok(())
        }
        Command::Purge => {
            let cache = init_shared_cache(&config).await?;
            if cache.disk().is_none() {
                warn!("Disk cache is disabled, nothing to purge");
            }
            let removed = cache.purge_expired().await;
            println!("Removed {removed} expired images");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = opcache::VERSION, "Starting {}", opcache::NAME);

    run(config, args.command).await
}
