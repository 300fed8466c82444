//! StashKV CLI
//!
//! Command-line access to a StashKV data directory.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde_json::Value;
use stashkv::{
    BackendKind, Bundle, Config, ExportOptions, ImportOptions, Result, SetOptions, Storage,
};
use tracing_subscriber::{fmt, EnvFilter};

/// StashKV CLI
#[derive(Parser, Debug)]
#[command(name = "stashkv-cli")]
#[command(about = "CLI for the StashKV persistence engine")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./stashkv_data")]
    data_dir: PathBuf,

    /// Store entries in plaintext
    #[arg(long)]
    no_encryption: bool,

    /// Never compress entries
    #[arg(long)]
    no_compression: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key to a value
    Set {
        /// The key to set
        key: String,

        /// The value (JSON; anything that does not parse is stored as a string)
        value: String,

        /// Store in this backend instead of the selected one
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// List every key
    Keys,

    /// Write a bundle of every key to a file (stdout when omitted)
    Export {
        output: Option<PathBuf>,

        /// Deflate the bundle payload
        #[arg(short, long)]
        compress: bool,
    },

    /// Load a bundle file
    Import {
        input: PathBuf,

        /// Remove existing keys first
        #[arg(long)]
        clear: bool,

        /// Skip the version compatibility check
        #[arg(long)]
        force: bool,
    },

    /// Show backend, cache and quota statistics
    Stats,

    /// Persist dirty keys
    Sync,

    /// Show where a key is stored and its raw entry
    Inspect {
        key: String,
    },
}

fn main() {
    // Logs go to stderr so command output stays pipeable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stashkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .encryption(!args.no_encryption)
        .compression(!args.no_compression)
        .background_maintenance(false)
        .build();

    let storage = match Storage::open(config) {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!("Failed to open storage: {}", e);
            process::exit(1);
        }
    };

    let outcome = run(&storage, args.command).and_then(|_| storage.close());
    if let Err(e) = outcome {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(storage: &Storage, command: Commands) -> Result<()> {
    match command {
        Commands::Get { key } => match storage.get(&key)? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => {
                eprintln!("(nil)");
                process::exit(2);
            }
        },

        Commands::Set { key, value, backend } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let mut options = SetOptions::default();
            if let Some(kind) = backend {
                options = options.backend(kind);
            }
            storage.set_with(&key, &value, options)?;
            println!("OK");
        }

        Commands::Del { key } => {
            storage.remove(&key)?;
            println!("OK");
        }

        Commands::Keys => {
            for key in storage.keys()? {
                println!("{}", key);
            }
        }

        Commands::Export { output, compress } => {
            let bundle = storage.export(ExportOptions { compress })?;
            let json = bundle.to_json()?;
            match output {
                Some(path) => {
                    fs::write(&path, json)?;
                    eprintln!("Exported {} keys to {}", bundle.metadata.total_keys, path.display());
                }
                None => println!("{}", json),
            }
        }

        Commands::Import { input, clear, force } => {
            let bundle = Bundle::from_json(&fs::read_to_string(&input)?)?;
            let report = storage.import(
                &bundle,
                ImportOptions {
                    clear_existing: clear,
                    force,
                    ..ImportOptions::default()
                },
            )?;
            println!("imported: {}, failed: {}", report.imported, report.failed);
            for failure in &report.errors {
                println!("  {}: {}", failure.key, failure.error);
            }
        }

        Commands::Stats => {
            let stats = storage.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Sync => {
            let report = storage.sync()?;
            println!("synced: {}, failed: {}", report.synced, report.failed);
        }

        Commands::Inspect { key } => match storage.locate(&key)? {
            Some((backend, entry)) => {
                println!("backend: {}", backend);
                println!("{}", serde_json::to_string_pretty(&entry)?);
            }
            None => {
                eprintln!("(nil)");
                process::exit(2);
            }
        },
    }

    Ok(())
}
