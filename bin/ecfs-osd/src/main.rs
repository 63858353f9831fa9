//! ecfs OSD - storage node tool
//!
//! `status` opens the node's storage (rebuilding its indexes from disk) and
//! reports usage; `codec` runs an offline encode / degraded decode / repair
//! check of a coding scheme.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use ecfs_coding::{BlockMap, CodingEngine};
use ecfs_common::{BlockId, CodingScheme, OsdConfig, SymbolSet};
use ecfs_storage::SegmentStore;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ecfs-osd")]
#[command(about = "ecfs object storage daemon tools")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "ECFS_OSD_CONFIG", default_value = "/etc/ecfs/osd.toml")]
    config: PathBuf,

    /// Node id (overrides the configuration file)
    #[arg(long, env = "ECFS_NODE_ID")]
    node_id: Option<u32>,

    /// Log level (overrides the configuration file)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: text or json
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the storage directories and report block store and cache usage
    Status,

    /// Encode a segment, drop blocks, then decode and repair it
    Codec {
        /// Coding scheme: replication, striping, raid5, reed-solomon, rdp
        #[arg(long)]
        scheme: CodingScheme,

        /// Scheme setting, e.g. `3` or `4:2`
        #[arg(long)]
        setting: String,

        /// Segment file; a random segment of `--size` bytes is used if absent
        #[arg(long)]
        input: Option<PathBuf>,

        /// Size of the random segment
        #[arg(long, default_value_t = 1024 * 1024)]
        size: usize,

        /// Comma-separated ids of blocks to treat as lost
        #[arg(long, value_delimiter = ',')]
        fail: Vec<BlockId>,
    },
}

fn load_config(path: &Path) -> Result<OsdConfig> {
    if !path.exists() {
        return Ok(OsdConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // CLI takes precedence over the configuration file
    let mut config = load_config(&args.config)?;
    if let Some(node_id) = args.node_id {
        config.node.node_id = node_id.into();
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    config.validate()?;

    init_logging(&config.logging.level, &config.logging.format);
    info!(node_id = %config.node.node_id, config = %args.config.display(), "Starting ecfs OSD");

    match args.command {
        Command::Status => status(&config),
        Command::Codec {
            scheme,
            setting,
            input,
            size,
            fail,
        } => {
            let segment = match input {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut data = vec![0u8; size];
                    rand::thread_rng().fill_bytes(&mut data);
                    data
                }
            };
            codec_check(scheme, &setting, &segment, &fail)
        }
    }
}

fn status(config: &OsdConfig) -> Result<()> {
    let store = SegmentStore::open(&config.storage).context("failed to open storage")?;
    let cache = store.disk_cache();

    println!("node:            {}", config.node.node_id);
    println!("block dir:       {}", config.storage.block_dir.display());
    println!("blocks:          {}", store.block_count());
    println!(
        "block usage:     {} / {} bytes ({} free)",
        store.block_usage(),
        store.block_capacity(),
        store.block_free_space()
    );
    println!("segment cache:   {}", config.storage.segment_cache_dir.display());
    println!("cached segments: {}", cache.len());
    println!(
        "cache usage:     {} / {} bytes ({} free)",
        cache.usage(),
        cache.capacity(),
        cache.free_space()
    );
    Ok(())
}

/// Concatenate the requested ranges of each block, as a peer would send them
fn collect(blocks: &[ecfs_coding::Block], symbols: &SymbolSet) -> BlockMap {
    symbols
        .iter()
        .map(|(block_id, list)| {
            let block = &blocks[block_id as usize].data;
            let mut data = Vec::with_capacity(symbols.bytes_for(block_id));
            for symbol in list {
                data.extend_from_slice(&block[symbol.offset..symbol.end()]);
            }
            (block_id, Bytes::from(data))
        })
        .collect()
}

fn codec_check(scheme: CodingScheme, setting: &str, segment: &[u8], failed: &[BlockId]) -> Result<()> {
    let engine = CodingEngine::new(scheme, setting)?;
    let size = segment.len();
    let blocks = engine.encode(segment)?;
    println!(
        "{scheme} {setting}: {size} bytes -> {} blocks of {} bytes",
        blocks.len(),
        engine.block_size(size)
    );

    let mut health = vec![true; blocks.len()];
    for &id in failed {
        match health.get_mut(id as usize) {
            Some(healthy) => *healthy = false,
            None => bail!("block {id} out of range for {} blocks", blocks.len()),
        }
    }

    let required = engine.required_symbols(&health, size);
    if required.is_empty() {
        bail!("too few healthy blocks to decode");
    }
    let decoded = engine.decode(&collect(&blocks, &required), &required, size)?;
    if decoded != segment {
        bail!("decoded segment differs from the original");
    }
    println!(
        "decode: ok, read {} bytes from blocks {:?}",
        required.total_bytes(),
        required.block_ids().collect::<Vec<_>>()
    );

    if failed.is_empty() {
        return Ok(());
    }
    let symbols = engine.repair_symbols(failed, &health, size);
    if symbols.is_empty() {
        warn!(%scheme, "Scheme cannot repair the failed blocks");
        println!("repair: not possible");
        return Ok(());
    }
    let repaired = engine.repair(failed, &collect(&blocks, &symbols), &symbols, size)?;
    for block in &repaired {
        if block.data != blocks[block.block_id as usize].data {
            bail!("repaired block {} differs from the original", block.block_id);
        }
    }
    println!(
        "repair: ok, read {} bytes from blocks {:?}",
        symbols.total_bytes(),
        symbols.block_ids().collect::<Vec<_>>()
    );
    Ok(())
}
