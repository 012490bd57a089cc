use std::path::Path;

use tracing_subscriber::EnvFilter;
use visage::config::Config;
use visage::index::persist::{self, SnapshotLayout};
use visage::index::{IdentityIndex, IndexSettings};

#[derive(Debug)]
enum Command {
    Stats,
    Verify,
    Compact,
    Help,
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match parse_command() {
        Command::Stats => run_stats(),
        Command::Verify => run_verify(),
        Command::Compact => run_compact(),
        Command::Help => {
            print_usage();
            Ok(())
        }
    }
}

fn parse_command() -> Command {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        return Command::Help;
    }
    match args[1].as_str() {
        "stats" => Command::Stats,
        "verify" => Command::Verify,
        "compact" => Command::Compact,
        _ => Command::Help,
    }
}

fn print_usage() {
    println!("usage: visage <stats|verify|compact> [--data-dir DIR]");
    println!("  stats    print identity/vector counts from the snapshot");
    println!("  verify   check the snapshot pair for corruption and divergence");
    println!("  compact  drop tombstoned forest entries and rewrite the snapshot");
}

fn load_index() -> anyhow::Result<(SnapshotLayout, IdentityIndex)> {
    let config = Config::from_env()?;
    let dir = config
        .data_dir
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DATA_DIR (or --data-dir) is required"))?;
    let layout = SnapshotLayout::new(Path::new(&dir));
    let index = persist::load(&layout, IndexSettings::from_config(&config))?;
    Ok((layout, index))
}

fn run_stats() -> anyhow::Result<()> {
    let (_layout, index) = load_index()?;
    println!("identities: {}", index.count_identities());
    println!("vectors:    {}", index.count_vectors());
    println!("pending:    {}", index.pending_len());
    println!("tombstones: {}", index.tombstone_count());
    Ok(())
}

fn run_verify() -> anyhow::Result<()> {
    let (_layout, index) = load_index()?;
    anyhow::ensure!(index.is_consistent(), "in-memory invariant check failed");
    println!(
        "snapshot ok: {} identities, {} vectors",
        index.count_identities(),
        index.count_vectors()
    );
    Ok(())
}

fn run_compact() -> anyhow::Result<()> {
    let (layout, mut index) = load_index()?;
    let tombstones = index.tombstone_count();
    index.compact();
    persist::save(&layout, &index)?;
    println!(
        "compacted: {tombstones} tombstones reclaimed, {} vectors live",
        index.count_vectors()
    );
    Ok(())
}
