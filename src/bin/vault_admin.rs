//! blockvault admin tool
//!
//! Inspect journals, validate and count indexes, dump block manager stats.
//!
//! Index commands first apply the index's committed journal entries, so they
//! report what the store holds after recovery. The journal itself is left
//! for the store's own coordinator to replay and clear.

use anyhow::{bail, Context};
use blockvault::location::ext;
use blockvault::txn::{TransBPlusTree, TransactionalComponent};
use blockvault::{Journal, Location, Record, RecordFactory, StoreConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "vault-admin")]
#[command(about = "Inspect and validate blockvault stores")]
struct Cli {
    /// Store directory
    #[arg(short = 'd', long)]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the entries of the store's journal
    Journal {
        /// Print payloads as hex
        #[arg(long)]
        payloads: bool,
    },
    /// Validate the structure of an index
    Check(IndexArgs),
    /// Count the records of an index
    Count(IndexArgs),
    /// Print block manager statistics of an index as JSON
    Stats(IndexArgs),
    /// Print the records of an index
    Dump {
        #[command(flatten)]
        index: IndexArgs,

        /// Stop after this many records
        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

#[derive(Args, Debug)]
struct IndexArgs {
    /// Index name
    name: String,

    /// Key length in bytes
    #[arg(short = 'k', long)]
    key_len: usize,

    /// Value length in bytes
    #[arg(short = 'v', long, default_value = "0")]
    value_len: usize,

    /// TOML store configuration the index was created with
    #[arg(short = 'c', long)]
    config: PathBuf,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn open_index(location: &Location, args: &IndexArgs) -> anyhow::Result<TransBPlusTree> {
    if !location.exists(&args.name, ext::TREE_STATE) {
        bail!("No index named '{}' in {:?}", args.name, location);
    }
    let config = StoreConfig::load(&args.config)
        .with_context(|| format!("Loading configuration {}", args.config.display()))?;
    let factory = RecordFactory::new(args.key_len, args.value_len);
    let tree = TransBPlusTree::create(location, &args.name, &config, factory)
        .with_context(|| format!("Opening index '{}'", args.name))?;

    let scan = Journal::open_in(location)?.scan()?;
    let id = tree.component_id();
    let redo: Vec<_> = scan
        .committed_redo()
        .into_iter()
        .filter(|entry| entry.component == id)
        .collect();
    if !redo.is_empty() {
        tree.start_recovery()?;
        for entry in &redo {
            tree.recover(&entry.payload)
                .with_context(|| format!("Replaying journal into '{}'", args.name))?;
        }
        tree.finish_recovery()?;
        info!(index = %args.name, entries = redo.len(), "Applied committed journal entries");
    }
    Ok(tree)
}

fn print_record(record: &Record) {
    if record.has_value() {
        println!("{} {}", hex(record.key()), hex(record.value()));
    } else {
        println!("{}", hex(record.key()));
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if !cli.dir.is_dir() {
        bail!("{} is not a directory", cli.dir.display());
    }
    let location = Location::dir(&cli.dir)?;

    match cli.command {
        Command::Journal { payloads } => {
            let journal = Journal::open_in(&location)?;
            let scan = journal.scan()?;
            for entry in &scan.entries {
                if payloads {
                    println!(
                        "{:?} {} {}",
                        entry.kind,
                        entry.component,
                        hex(&entry.payload)
                    );
                } else {
                    println!(
                        "{:?} {} {} bytes",
                        entry.kind,
                        entry.component,
                        entry.payload.len()
                    );
                }
            }
            info!(
                entries = scan.entries.len(),
                valid = scan.valid_len,
                total = scan.total_len,
                "Journal scanned"
            );
            if scan.has_torn_tail() {
                println!(
                    "torn tail: {} bytes after offset {}",
                    scan.total_len - scan.valid_len,
                    scan.valid_len
                );
            }
        }
        Command::Check(args) => {
            let trans = open_index(&location, &args)?;
            let tree = trans.tree();
            tree.check()?;
            println!("{}: ok, {} records", args.name, tree.size()?);
        }
        Command::Count(args) => {
            let trans = open_index(&location, &args)?;
            println!("{}", trans.tree().size()?);
        }
        Command::Stats(args) => {
            let trans = open_index(&location, &args)?;
            let tree = trans.tree();
            let (nodes, records) = tree.stats();
            let report = serde_json::json!({
                "index": args.name,
                "order": tree.params().order(),
                "page_capacity": tree.params().page_capacity(),
                "root": tree.root().root,
                "nodes": nodes,
                "records": records,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Dump { index, limit } => {
            let trans = open_index(&location, &index)?;
            for record in trans.tree().iter().take(limit) {
                print_record(&record?);
            }
        }
    }
    Ok(())
}
