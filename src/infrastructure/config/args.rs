use super::app_config::LogLevel;
use crate::infrastructure::image::EncodeFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "opcache",
    version,
    about = "Fetch images through a deduplicating memory and disk cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, value_name = "DIR", env = "OPCACHE_DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Keep images in memory only.
    #[arg(long, global = true)]
    pub no_disk: bool,

    /// Decoded bytes kept in memory.
    #[arg(long, value_name = "BYTES", global = true)]
    pub memory_cost_limit: Option<usize>,

    /// Format used for persisted images.
    #[arg(long, value_enum, global = true)]
    pub encode_format: Option<EncodeFormat>,

    /// HTTP request timeout in seconds.
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch one or more images concurrently through the cache.
    Fetch(FetchArgs),
    /// Remove an image from both cache tiers.
    Remove {
        /// Image URL.
        url: String,
        /// Variant name; all variants are removed when omitted.
        #[arg(long)]
        variant: Option<String>,
    },
    /// Remove every cached image.
    Clear,
    /// Delete expired files from the disk cache.
    Purge,
}

#[derive(Debug, clap::Args)]
pub struct FetchArgs {
    /// Image URLs.
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Variant name the processed image is cached under.
    #[arg(long)]
    pub variant: Option<String>,

    /// Resize to fill WIDTHxHEIGHT points.
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    pub resize: Option<(u32, u32)>,

    /// Display scale factor applied to --resize.
    #[arg(long, default_value_t = 1.0)]
    pub scale: f32,

    /// Round corners with this radius in pixels.
    #[arg(long, value_name = "RADIUS")]
    pub rounded: Option<f32>,

    /// Crop to a circle.
    #[arg(long)]
    pub circle: bool,

    /// Background fill as RRGGBB or RRGGBBAA hex.
    #[arg(long, value_parser = parse_color, default_value = "00000000")]
    pub background: [u8; 4],

    /// Directory to save fetched images into.
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value:?}"))?;
    let w = w.trim().parse().map_err(|e| format!("bad width: {e}"))?;
    let h = h.trim().parse().map_err(|e| format!("bad height: {e}"))?;
    Ok((w, h))
}

fn parse_color(value: &str) -> Result<[u8; 4], String> {
    let hex = value.trim_start_matches('#');
    let bytes = hex::decode(hex).map_err(|e| format!("bad color {value:?}: {e}"))?;
    match bytes.as_slice() {
        [r, g, b] => Ok([*r, *g, *b, 255]),
        [r, g, b, a] => Ok([*r, *g, *b, *a]),
        _ => Err(format!("expected RRGGBB or RRGGBBAA, got {value:?}")),
    }
}
