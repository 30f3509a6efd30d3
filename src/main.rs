//! Admin tool for a named shared segment.
//!
//! Attaches to (or creates) the segment described by the configuration and
//! runs one command against it. The segment is left in place on exit.

use clap::{Parser, Subcommand};
use shmcache::{BackendKind, Config, Storage, logging, unix_time};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shmcache")]
#[command(about = "Inspect and modify a shared memory cache segment")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print sizing and statistics
    Info,

    /// List occupied slots
    Dump {
        /// Stop after this many slots (0 for all)
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Print the value stored under a key
    Get {
        /// Key to look up
        key: String,
    },

    /// Store a value
    Set {
        /// Key to store under
        key: String,

        /// Value to store
        value: String,

        /// Seconds until the entry expires (0 for never)
        #[arg(short, long, default_value = "0")]
        ttl: u64,

        /// Flag stored alongside the value
        #[arg(short, long, default_value = "0")]
        flag: u32,

        /// Fail if the key already holds a live entry
        #[arg(long)]
        add: bool,
    },

    /// Remove a key
    Delete {
        /// Key to remove
        key: String,

        /// Expire the key this many seconds from now instead of removing it
        #[arg(short, long, default_value = "0")]
        ttl: u64,
    },

    /// Clear every slot
    Flush,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // Only a named segment outlives this process
    config.backend = BackendKind::Named;

    logging::init(&config.log);

    if let Err(e) = run(&config, cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: &Config, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let storage = Storage::from_config(config)?;
    let now = unix_time();

    tracing::debug!(
        path = %config.segment_path().display(),
        created = storage.is_creator(),
        "attached to segment"
    );

    match command {
        Commands::Info => {
            println!("segment:           {}", config.segment_path().display());
            println!("{}", storage.info());
        }
        Commands::Dump { limit } => {
            for slot in storage.dump(limit) {
                println!(
                    "{:>8} {:<48} value_len={} flag={} ttl={}{}",
                    slot.index,
                    String::from_utf8_lossy(&slot.key),
                    slot.value_len,
                    slot.flag,
                    slot.ttl,
                    if slot.is_expired(now) { " (expired)" } else { "" }
                );
            }
        }
        Commands::Get { key } => match storage.find(key.as_bytes(), now) {
            Some(item) => {
                println!("{}", String::from_utf8_lossy(&item.value));
                tracing::debug!(flag = item.flag, cas = item.cas, size = item.size(), "hit");
            }
            None => return Err(format!("key not found: {}", key).into()),
        },
        Commands::Set {
            key,
            value,
            ttl,
            flag,
            add,
        } => {
            storage.update(key.as_bytes(), value.as_bytes(), flag, ttl, add, now)?;
        }
        Commands::Delete { key, ttl } => {
            storage.delete(key.as_bytes(), ttl, now)?;
        }
        Commands::Flush => storage.flush(),
    }

    storage.shutdown();
    Ok(())
}
