use clap::Parser;
use lite_index::{
    BuildConfig, DEFAULT_CHECKPOINT_FREQUENCY, IndexStore, LedgerRange, StoreConfig,
    build_indices, connect_source,
};
use lite_index_batch::{Error, MapConfig, ReduceConfig, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Build indices over a ledger range in a single process.
    Single(SingleArgs),

    /// Run one map job of a batch build.
    Map(MapConfig),

    /// Run one reduce job merging the map job shards.
    Reduce(ReduceConfig),
}

#[derive(Debug, clap::Args)]
struct SingleArgs {
    /// Ledger source URL, `file://<dir>`.
    #[arg(long)]
    source: String,

    /// Store URL indices are written to.
    #[arg(long, default_value = "file://indexes")]
    target: String,

    /// First ledger to index.
    #[arg(long, default_value_t = 2)]
    start: u32,

    /// Last ledger to index, 0 for the latest available one.
    #[arg(long, default_value_t = 0)]
    end: u32,

    #[arg(long, default_value = "accounts,transactions", value_delimiter = ',')]
    modules: Vec<String>,

    #[arg(long, default_value_t = 1)]
    workers: usize,
}

/// Checkpoint index builder.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

async fn single(args: SingleArgs) -> Result<()> {
    let source = connect_source(&args.source)?;
    let store = Arc::new(IndexStore::connect(&args.target, StoreConfig::default()).await?);

    let config = BuildConfig {
        ledger_range: LedgerRange::new(args.start.max(2), args.end),
        modules: args.modules,
        workers: args.workers.max(1),
        checkpoint_frequency: DEFAULT_CHECKPOINT_FREQUENCY,
    };
    let builder = build_indices(config, source, store).await?;

    tracing::info!(
        last_built_ledger = builder.last_built_ledger(),
        store = %args.target,
        "Indices built"
    );
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Single(args) => single(args).await,
        Command::Map(config) => lite_index_batch::map(&config).await,
        Command::Reduce(config) => lite_index_batch::reduce(&config).await.map(|_| ()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(cli).await {
        if let Error::Config(_) = err {
            tracing::error!("{err}");
        } else {
            tracing::error!(?err, "Index job failed");
        }
        std::process::exit(1);
    }
}
