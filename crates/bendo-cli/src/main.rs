mod config;
mod logging;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use bendo_core::ItemStore;
use bendo_store::{BundleStore, FilesystemStore, MemoryStore};

use crate::logging::LogArgs;

/// Operator CLI for the bendo item storage engine: validates fixity,
/// lists items, and streams a blob to stdout. The HTTP surface, auth, and
/// upload chunking are out of scope (spec §1) and live in a separate
/// collaborator, if one exists.
#[derive(Debug, Parser)]
#[command(name = "bendo", version)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    /// Directory holding `base.*` and `<APP_ENV>.*` settings files.
    #[arg(long, env = "BENDO_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Streams every non-deleted blob of an item through its recorded
    /// hashes and reports any mismatch.
    Validate { id: String },
    /// Lists every item id known to the bundle store.
    List,
    /// Writes one blob's bytes to stdout.
    Cat { id: String, blob_id: u64 },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log);
    tracing::debug!(?cli, "parsed arguments");

    let settings = config::load_settings(&cli.config_dir).context("failed to load settings")?;
    let backend: Arc<dyn BundleStore> = match settings.store.backend {
        config::StoreBackend::Memory => Arc::new(MemoryStore::new()),
        config::StoreBackend::Filesystem => {
            let path = settings
                .store
                .path
                .context("store.path is required for the filesystem backend")?;
            Arc::new(FilesystemStore::new(path)?)
        }
    };
    let item_store = Arc::new(ItemStore::new(backend).with_ideal_bundle_size(settings.store.ideal_bundle_size_bytes));

    match cli.command {
        Command::Validate { id } => {
            let report = item_store.validate(&id)?;
            println!("checked {} bytes across item {id}", report.bytes_checked);
            if report.errors.is_empty() {
                println!("ok: no fixity mismatches");
            } else {
                for err in &report.errors {
                    println!(
                        "mismatch: blob {} field {} expected {} got {}",
                        err.blob_id, err.field, err.expected, err.actual
                    );
                }
                anyhow::bail!("{} fixity mismatch(es) found", report.errors.len());
            }
        }
        Command::List => {
            for id in item_store.list()? {
                println!("{}", id?);
            }
        }
        Command::Cat { id, blob_id } => {
            let mut reader = item_store.blob(&id, blob_id)?;
            io::copy(&mut reader, &mut io::stdout())?;
        }
    }

    Ok(())
}
