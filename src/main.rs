// ABOUTME: Entry point for the hearth binary.
// ABOUTME: Inspects and repairs persisted state on the configured medium: show, backups, restore, keys.

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use hearth_core::{KeySpace, decode};
use hearth_session::HearthConfig;
use hearth_store::{BackupManager, DurableStore};

#[derive(Parser)]
#[command(
    name = "hearth",
    version,
    about = "Inspect and restore locally persisted application state"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the snapshot stored for a name.
    Show {
        /// Name under the configured prefix (the key is <prefix>_<name>).
        name: String,
    },

    /// List backups of a name, newest first.
    Backups { name: String },

    /// Copy a backup back over the key it was taken from.
    Restore {
        #[arg(value_name = "BACKUP_KEY")]
        backup_key: String,
    },

    /// List stored keys, optionally only those starting with a prefix.
    Keys { prefix: Option<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hearth=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = HearthConfig::from_env().context("invalid HEARTH_* configuration")?;
    tracing::debug!(
        "using {:?} storage under {}",
        config.backend,
        config.home.display()
    );

    let store = config
        .open_store()
        .with_context(|| format!("failed to open storage under {}", config.home.display()))?;
    let keys = KeySpace::new(config.prefix.clone());

    match cli.command {
        Command::Show { name } => show(store.as_ref(), &keys, &name).await,
        Command::Backups { name } => {
            let backups = BackupManager::new(store, keys, config.max_backups);
            list_backups(&backups, &name).await
        }
        Command::Restore { backup_key } => {
            let backups = BackupManager::new(store, keys, config.max_backups);
            restore(&backups, &backup_key).await
        }
        Command::Keys { prefix } => list_keys(store, prefix.as_deref()).await,
    }
}

async fn show(store: &dyn DurableStore, keys: &KeySpace, name: &str) -> anyhow::Result<()> {
    let key = keys.primary(name);
    let Some(text) = store.get(&key).await? else {
        bail!("nothing stored under {}", key);
    };
    let snapshot = decode(&text).with_context(|| format!("{} holds an unreadable snapshot", key))?;

    println!("key:      {}", key);
    println!("version:  {}", snapshot.version);
    println!("saved at: {}", snapshot.saved_at.to_rfc3339());
    println!("{}", serde_json::to_string_pretty(&snapshot.payload)?);
    Ok(())
}

async fn list_backups(backups: &BackupManager, name: &str) -> anyhow::Result<()> {
    let entries = backups.list(name).await?;
    if entries.is_empty() {
        println!("no backups of {}", backups.keys().primary(name));
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  v{}  {:?}  {}",
            entry.key,
            entry.record.snapshot.version,
            entry.record.reason,
            entry.record.created_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn restore(backups: &BackupManager, backup_key: &str) -> anyhow::Result<()> {
    let Some((name, _)) = backups.keys().parse_backup(backup_key) else {
        bail!(
            "{} is not a backup key under prefix {}",
            backup_key,
            backups.keys().prefix()
        );
    };
    let target = backups.keys().primary(name);
    let snapshot = backups.restore(backup_key, &target).await?;
    println!(
        "restored {} into {} (version {})",
        backup_key, target, snapshot.version
    );
    Ok(())
}

async fn list_keys(store: Arc<dyn DurableStore>, prefix: Option<&str>) -> anyhow::Result<()> {
    for key in store.keys(prefix.unwrap_or("")).await? {
        println!("{}", key);
    }
    Ok(())
}
