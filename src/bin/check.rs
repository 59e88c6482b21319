//! Tessera Table Checker
//!
//! Offline inspection of a single table, addressed by its file prefix
//! (for example `db/postlist_`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tessera::btree::{Btree, TablePath};
use tracing_subscriber::{fmt, EnvFilter};

/// Tessera table checker
#[derive(Parser, Debug)]
#[command(name = "tessera-check")]
#[command(about = "Verify and inspect Tessera B-tree tables")]
#[command(version)]
struct Args {
    /// Table prefix, e.g. ./tessera_data/postlist_
    prefix: PathBuf,

    /// Revision to open (defaults to the latest)
    #[arg(short, long, global = true)]
    revision: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Walk every block and verify the tree structure
    Check,

    /// Print the base record of the opened revision
    Info,

    /// Print entries in key order
    Dump {
        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,tessera=info"));

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}: {}", args.prefix.display(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> tessera::Result<()> {
    let path = TablePath::from_prefix(&args.prefix);
    let tree = Btree::open_to_read(&path, args.revision)?;

    match &args.command {
        Commands::Check => {
            let report = tree.check()?;
            println!("table:         {}", path);
            println!("revision:      {}", report.revision);
            println!("block size:    {}", report.block_size);
            println!("levels:        {}", report.levels);
            println!(
                "blocks:        {} ({} leaf, {} branch)",
                report.blocks, report.leaf_blocks, report.branch_blocks
            );
            println!("entries:       {}", report.entries);
            println!("items:         {}", report.items);
            println!("leaked blocks: {}", report.leaked_blocks);
            println!("leaf fill:     {:.1}%", report.leaf_fill() * 100.0);
            println!("OK");
        }
        Commands::Info => {
            let base = tree.base();
            println!("table:       {}", path);
            println!("revision:    {}", base.revision);
            println!("block size:  {}", base.block_size);
            println!("root:        {}{}", base.root, if base.fake_root { " (empty)" } else { "" });
            println!("level:       {}", base.level);
            println!("entries:     {}", base.item_count);
            println!("block count: {}", base.block_count);
            println!("sequential:  {}", base.sequential);
            if let Ok(latest) = Btree::latest_revision(&path) {
                println!("latest:      {}", latest);
            }
        }
        Commands::Dump { limit } => {
            let limit = limit.unwrap_or(usize::MAX);
            for entry in tree.iter().take(limit) {
                let (key, tag) = entry?;
                println!("{} => {}", key.escape_ascii(), tag.escape_ascii());
            }
        }
    }
    Ok(())
}
