mod downsample;
mod io;

use clap::{ArgAction, Parser, Subcommand};
use std::sync::Arc;
use thinline::{CacheConfig, ResultCache};
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "thinline",
    about = "Shape-preserving downsampling of large time series"
)]
struct Cli {
    /// Log progress (-v) and cache activity (-vv). RUST_LOG overrides.
    #[clap(long, short = 'v', global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Maximum number of downsampled series kept in memory
    #[clap(
        long,
        global = true,
        env = "THINLINE_CACHE_CAPACITY",
        default_value_t = thinline::DEFAULT_CAPACITY
    )]
    cache_capacity: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reduce series to a fixed number of points with LTTB
    Downsample(downsample::Opts),
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // One cache for the whole process, shared with every worker.
    let cache = Arc::new(ResultCache::from_config(&CacheConfig {
        capacity: cli.cache_capacity,
    })?);

    match cli.command {
        Command::Downsample(opts) => downsample::downsample(&opts, cache).await,
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
