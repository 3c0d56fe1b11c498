//! Audit Log Verification CLI
//!
//! Verifies a SQLite audit database offline and generates signing keys.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::path::PathBuf;
use tracing::{error, info, warn};

use audit_chain::audit::hasher::{KeyRing, SigningKey};
use audit_chain::audit::verify::{scan_range, verify_snapshot};
use audit_chain::config::AppConfig;
use audit_chain::storage::{AuditStorage, SequenceRange, SqliteStorage};

#[derive(Parser)]
#[command(name = "verify-audit-log")]
#[command(about = "Verify audit chain integrity")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the hash chain and signatures of a SQLite audit database
    Verify {
        /// Path to the SQLite database
        #[arg(short, long)]
        database: PathBuf,

        /// Signing key as VERSION=KEY; repeat for every historical version.
        /// Falls back to the service configuration when omitted.
        #[arg(short, long = "key")]
        keys: Vec<String>,

        /// First sequence to verify
        #[arg(long)]
        from: Option<u64>,

        /// Last sequence to verify
        #[arg(long)]
        to: Option<u64>,
    },

    /// Print a fresh random signing key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    match cli.command {
        Commands::Verify {
            database,
            keys,
            from,
            to,
        } => {
            let range = SequenceRange { from, to };
            let valid = verify_database(database, &keys, range, cli.verbose).await?;
            if !valid {
                std::process::exit(1);
            }
        }
        Commands::Keygen => println!("{}", generate_key()),
    }

    Ok(())
}

async fn verify_database(
    database: PathBuf,
    keys: &[String],
    range: SequenceRange,
    verbose: bool,
) -> Result<bool> {
    if !database.exists() {
        return Err(anyhow!("Audit database not found: {}", database.display()));
    }
    info!("Verifying audit database: {}", database.display());

    let keys = if keys.is_empty() {
        AppConfig::load()?.key_ring()?
    } else {
        parse_keys(keys)?
    };

    let storage = SqliteStorage::open(&database).await?;
    for recorded in storage.key_versions().await? {
        match keys.get(recorded.version) {
            None => warn!("No key supplied for version {}", recorded.version),
            Some(key) if key.fingerprint() != recorded.fingerprint => warn!(
                "Key supplied for version {} does not match the key this database recorded",
                recorded.version
            ),
            Some(_) => {}
        }
    }
    let snapshot = storage.snapshot(scan_range(range)).await?;
    let result = verify_snapshot(&snapshot, range, &keys, None);

    if verbose {
        println!("Audit Chain Summary:");
        println!("  Stored entries: {}", storage.count().await?);
        println!("  Key versions: {:?}", keys.versions());
        if let Some(checkpoint) = &snapshot.checkpoint {
            println!(
                "  Pruned through sequence {} ({} entries)",
                checkpoint.sequence, checkpoint.entries_pruned
            );
        }
        if let Some(last) = snapshot.entries.last() {
            println!("  Last entry: {}", last.summary());
        }
    }

    if result.valid {
        println!("{}", result.summary());
    } else {
        error!("Audit chain verification failed");
        println!("{}", result.summary());
    }
    Ok(result.valid)
}

fn parse_keys(raw: &[String]) -> Result<KeyRing> {
    let mut versions = Vec::with_capacity(raw.len());
    for (index, item) in raw.iter().enumerate() {
        let (version, key) = match item.split_once('=') {
            Some((version, key)) => (
                version
                    .parse::<u32>()
                    .map_err(|_| anyhow!("Invalid key version in {:?}", version))?,
                key,
            ),
            None => (index as u32 + 1, item.as_str()),
        };
        versions.push((version, SigningKey::new(key)?));
    }
    Ok(KeyRing::from_versions(versions)?)
}

fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
