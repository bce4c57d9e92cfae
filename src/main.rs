use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crypto_replicator::shutdown::{cancel_on_signal, wait_for_signal};
use crypto_replicator::{
    install_trigger, trigger_sql, Config, DeliverySender, EncryptedEnvelope, FsKeyStore, InMemoryKeyStore,
    KeyRotationManager, KeyStore, PgNotificationSource, Replicator, SenderConfig,
};

const DEMO_KEY_ID: &str = "demo-ephemeral";

#[derive(Parser, Debug)]
#[command(author, version, about = "Replicate PostgreSQL changes as encrypted envelopes", long_about = None)]
struct Cli {
    /// Key directory (overrides KEY_DIRECTORY)
    #[arg(long, global = true)]
    key_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen for changes and replicate them until interrupted
    Run,
    /// Manage RSA key pairs
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Print the trigger DDL for a table
    TriggerSql { table: String },
    /// Install the change trigger on a table
    InstallTrigger { table: String },
    /// Decrypt an envelope file ("-" for stdin); needs the private key
    Decrypt { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum KeyCommands {
    /// List key pairs in the key directory
    List,
    /// Generate a new key pair and make it current
    Rotate {
        #[arg(long)]
        key_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(key_dir) = cli.key_dir {
        config.key_directory = key_dir;
    }

    match cli.command {
        Commands::Run => run_command(config).await,
        Commands::Keys { command: KeyCommands::List } => list_keys_command(&config),
        Commands::Keys {
            command: KeyCommands::Rotate { key_id },
        } => rotate_command(&config, key_id.as_deref()),
        Commands::TriggerSql { table } => {
            for statement in trigger_sql(&table, &config.listen_channel)? {
                println!("{};\n", statement);
            }
            Ok(())
        }
        Commands::InstallTrigger { table } => {
            let pool = PgPool::connect(config.require_database_url()?)
                .await
                .context("failed to connect to database")?;
            install_trigger(&pool, &table, &config.listen_channel).await?;
            pool.close().await;
            Ok(())
        }
        Commands::Decrypt { path } => decrypt_command(&config, &path),
    }
}

fn key_manager(config: &Config) -> Result<KeyRotationManager<FsKeyStore>> {
    let store = Arc::new(FsKeyStore::new(&config.key_directory));
    let mut keys = KeyRotationManager::new(store);
    keys.load()?;
    Ok(keys)
}

async fn run_command(config: Config) -> Result<()> {
    let source = PgNotificationSource::new(config.require_database_url()?, config.listen_channel.as_str());

    let store = Arc::new(FsKeyStore::new(&config.key_directory));
    let mut keys = KeyRotationManager::new(store).with_active_key_id(config.active_key_id.clone());
    keys.load()?;

    if keys.is_empty() && config.demo_mode {
        warn!(
            key_id = DEMO_KEY_ID,
            "DEMO_MODE: no keys found, using an ephemeral in-memory key. Envelopes sent in this run cannot be decrypted later."
        );
        let mut demo = KeyRotationManager::new(Arc::new(InMemoryKeyStore::new()));
        demo.rotate(Some(DEMO_KEY_ID))?;
        return replicate(source, demo, &config).await;
    }

    replicate(source, keys, &config).await
}

async fn replicate<K: KeyStore + 'static>(
    source: PgNotificationSource,
    keys: KeyRotationManager<K>,
    config: &Config,
) -> Result<()> {
    let sender = DeliverySender::new(SenderConfig::from(config));
    let mut replicator = Replicator::new(source, keys, sender, config.poll_interval);

    let token = replicator.shutdown_token();
    tokio::spawn(async move {
        match cancel_on_signal(&token, wait_for_signal).await {
            Ok(()) => {
                error!("Forced exit before drain completed");
                std::process::exit(130);
            }
            Err(e) => error!(error = %e, "Signal handling unavailable"),
        }
    });

    let summary = replicator.run().await?;
    if summary.delivery.failed > 0 {
        warn!(undelivered = summary.delivery.failed, "Some envelopes were not delivered");
    }
    Ok(())
}

fn list_keys_command(config: &Config) -> Result<()> {
    let keys = key_manager(config)?;
    if keys.is_empty() {
        println!("No keys in {}", config.key_directory.display());
        return Ok(());
    }

    println!("{:<32} {:<26} {:<7} PRIVATE", "KEY ID", "CREATED", "ACTIVE");
    for info in keys.list_keys() {
        println!(
            "{:<32} {:<26} {:<7} {}",
            info.key_id,
            info.created_at.to_rfc3339(),
            if info.is_active { "*" } else { "" },
            if info.has_private { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn rotate_command(config: &Config, key_id: Option<&str>) -> Result<()> {
    let mut keys = key_manager(config)?;
    let key_id = keys.rotate(key_id)?;
    info!(key_id = %key_id, directory = %config.key_directory.display(), "Key rotated");
    println!("{}", key_id);
    Ok(())
}

fn decrypt_command(config: &Config, path: &Path) -> Result<()> {
    let mut raw = Vec::new();
    if path.as_os_str() == "-" {
        std::io::stdin().read_to_end(&mut raw)?;
    } else {
        raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    }

    let envelope = EncryptedEnvelope::deserialize(&raw)?;
    let keys = key_manager(config)?;
    let record = keys.decrypt(&envelope)?;

    info!(
        key_id = %envelope.key_id,
        table = %envelope.table,
        operation = %envelope.operation,
        "Envelope decrypted"
    );
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
