//! `hlsgrab` CLI - Download segmented (HLS) video into a single file

mod cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hlsgrab::Config;

use cmd::JobOverrides;

#[derive(Parser)]
#[command(name = "hlsgrab")]
#[command(about = "Download HLS playlists and reassemble them into one video file")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors; no progress output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Config file (default: ~/.config/hlsgrab/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one playlist or media URL
    Download {
        /// Master playlist, media playlist, or direct media URL
        url: String,

        /// Title used for the output file name
        #[arg(short, long)]
        title: Option<String>,

        /// Thumbnail image to embed
        #[arg(long)]
        thumbnail: Option<String>,

        #[command(flatten)]
        overrides: JobOverrides,
    },

    /// Download every entry of a batch file (JSON records or `url<TAB>title` lines)
    Batch {
        /// Batch file path
        file: PathBuf,

        #[command(flatten)]
        overrides: JobOverrides,
    },

    /// Resolve a URL and show what would be downloaded
    Info {
        /// Playlist or media URL
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config = match cli.config {
        Some(ref path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };

    match cli.command {
        Commands::Download {
            url,
            title,
            thumbnail,
            overrides,
        } => {
            let config = overrides.apply(config)?;
            cmd::download::cmd_download(config, &url, title, thumbnail, cli.quiet).await
        }
        Commands::Batch { file, overrides } => {
            let config = overrides.apply(config)?;
            cmd::batch::cmd_batch(config, &file, cli.quiet).await
        }
        Commands::Info { url } => {
            cmd::info::cmd_info(config, &url).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `RUST_LOG` wins; otherwise verbosity flags pick the level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hlsgrab={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
