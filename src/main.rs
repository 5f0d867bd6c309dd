//! Walletscan command-line tool
//!
//! Follows a JSON-RPC endpoint and prints, one JSON document per line,
//! either the transactions touching watched wallets or the blocks
//! themselves.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use walletscan::config::{load_watchlist, parse_block_number, parse_header, parse_wallets};
use walletscan::rpc::HttpTransport;
use walletscan::types::BlockLike;
use walletscan::{BlockDetail, BlockFetcher, ChannelPipeline, DetailedBlock, FetcherConfig, LightBlock};

/// What the tool prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    /// Transactions touching a watched wallet
    Tx,
    /// Blocks with transaction hashes only
    Block,
    /// Blocks with full transaction objects
    BlockDetailed,
}

/// Block stream follower for watched wallets
#[derive(Parser)]
#[command(name = "walletscan")]
#[command(about = "Follow an Ethereum JSON-RPC endpoint and print matching transactions or blocks")]
struct Args {
    /// RPC endpoint URL (e.g., https://eth.llamarpc.com)
    #[arg(short, long)]
    endpoint: String,

    /// Extra HTTP header sent with every request, as "Name: value"
    #[arg(long)]
    header: Vec<String>,

    /// First block to fetch, hex (0x...) or decimal; defaults to the chain head
    #[arg(short, long)]
    start_block: Option<String>,

    /// Last block to fetch, hex (0x...) or decimal; 0 follows the chain forever
    #[arg(long, default_value = "0")]
    end_block: String,

    /// Delay between two polls of the chain height, in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Comma-separated wallet addresses to watch
    #[arg(short, long)]
    wallets: Option<String>,

    /// Path to watchlist file (one address per line)
    #[arg(long)]
    watchlist: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// What to print
    #[arg(short, long, value_enum, default_value_t = Target::Tx)]
    target: Target,
}

impl Args {
    fn fetcher_config(&self) -> Result<FetcherConfig> {
        if self.poll_interval_ms == 0 {
            bail!("--poll-interval-ms must be positive");
        }
        let mut transport = HttpTransport::new();
        for raw in &self.header {
            let (name, value) = parse_header(raw)?;
            transport = transport
                .with_header(&name, &value)
                .with_context(|| format!("Invalid header {:?}", raw))?;
        }

        let mut config = FetcherConfig::new(self.endpoint.clone())
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_end_block(parse_block_number(&self.end_block).context("Invalid --end-block")?)
            .with_transport(Arc::new(transport));
        if let Some(start) = &self.start_block {
            config = config.with_start_block(parse_block_number(start).context("Invalid --start-block")?);
        }
        Ok(config)
    }

    fn wallets(&self) -> Result<Vec<String>> {
        let mut wallets = Vec::new();
        if let Some(list) = &self.wallets {
            wallets.extend(parse_wallets(list).context("Invalid --wallets")?);
        }
        if let Some(path) = &self.watchlist {
            wallets.extend(load_watchlist(path)?);
        }
        Ok(wallets)
    }
}

/// Write every item of `queue` to `out` as a JSON line until the queue
/// closes. When `shutdown` completes first, `stop` is called once and the
/// queue is drained to closure.
async fn print_until_closed<T, W, S, F>(
    mut queue: mpsc::Receiver<T>,
    out: &mut W,
    shutdown: S,
    stop: F,
) -> Result<()>
where
    T: Serialize,
    W: Write,
    S: Future,
    F: Fn(),
{
    tokio::pin!(shutdown);
    let mut stopping = false;
    loop {
        let item = if stopping {
            queue.recv().await
        } else {
            tokio::select! {
                item = queue.recv() => item,
                _ = &mut shutdown => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    stop();
                    stopping = true;
                    continue;
                }
            }
        };
        let Some(item) = item else {
            return Ok(());
        };
        serde_json::to_writer(&mut *out, &item).context("Failed to encode output")?;
        writeln!(out).context("Failed to write output")?;
    }
}

async fn run_transactions(args: &Args) -> Result<()> {
    let wallets = args.wallets()?;
    if wallets.is_empty() {
        bail!("--target tx needs at least one wallet (--wallets or --watchlist)");
    }

    let pipeline = ChannelPipeline::new(args.fetcher_config()?)?;
    for wallet in &wallets {
        if !pipeline.subscribe(wallet) {
            warn!("Wallet {} listed twice", wallet);
        }
    }
    info!("Watching {} wallets", wallets.len());

    let txs = pipeline
        .take_transactions()
        .context("Transaction queue already taken")?;
    pipeline.start().await.context("Failed to start pipeline")?;
    print_until_closed(
        txs,
        &mut std::io::stdout().lock(),
        tokio::signal::ctrl_c(),
        || pipeline.stop(),
    )
    .await?;

    info!("Pipeline stopped at block {}", pipeline.current_block());
    match pipeline.last_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn run_blocks<B: BlockLike + Serialize>(args: &Args, detail: BlockDetail) -> Result<()> {
    let fetcher = BlockFetcher::<B>::new(args.fetcher_config()?, detail)?;
    let blocks = fetcher.take_blocks().context("Block queue already taken")?;
    fetcher.start().await.context("Failed to start block fetcher")?;
    print_until_closed(
        blocks,
        &mut std::io::stdout().lock(),
        tokio::signal::ctrl_c(),
        || fetcher.stop(),
    )
    .await?;

    info!("Block fetcher stopped at block {}", fetcher.current_block());
    match fetcher.last_error() {
        Some(err) => Err(err).context("block subscriber error"),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine readable
    let default_level = if args.quiet { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting walletscan");
    info!("Endpoint: {}", args.endpoint);
    info!("Target: {:?}", args.target);

    match args.target {
        Target::Tx => run_transactions(&args).await,
        Target::Block => run_blocks::<LightBlock>(&args, BlockDetail::Light).await,
        Target::BlockDetailed => run_blocks::<DetailedBlock>(&args, BlockDetail::Full).await,
    }
}
