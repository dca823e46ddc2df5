//! sharectl
//!
//! Operator tool for the device share store. Drives the same storage
//! contract the recovery flow uses, against whichever backend the config
//! selects, so a device's share state can be inspected and reset by hand.
//!
//! Shares are never logged; `list` only prints masked previews.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use device_share::{load_config, open_store, BackendKind, FailurePolicy, ShareStore, StoreConfig};
use tracing::{debug, info};

/// Manage device-held SSS recovery shares
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON store config (missing file means defaults)
    #[arg(long, env = "SHARECTL_CONFIG", default_value = "sharectl.json")]
    config: PathBuf,

    /// Backend to use, overriding the config (local or sqlite)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Store directory (local) or database file (sqlite), overriding the config
    #[arg(long)]
    path: Option<PathBuf>,

    /// Report storage failures instead of treating them as "no share"
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a share, read from the argument or stdin
    Store {
        share: Option<String>,
        #[arg(long)]
        id: Option<String>,
    },
    /// Print the stored share; exits with status 1 when absent
    Get {
        #[arg(long)]
        id: Option<String>,
    },
    /// Print whether a share is stored
    Has {
        #[arg(long)]
        id: Option<String>,
    },
    /// Delete one share, or all of them with --all
    Clear {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        id: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Print or set the share version
    Version {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        set: Option<u32>,
    },
    /// List stored shares with masked previews
    List,
}

impl Args {
    fn store_config(&self) -> Result<StoreConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("Failed to load config from {:?}", self.config))?;

        if let Some(backend) = self.backend {
            config.backend = Some(backend);
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if self.strict {
            config.policy = FailurePolicy::Strict;
        }
        Ok(config)
    }
}

/// Create the directory the store lives in. The library leaves this to the
/// host and treats a missing directory as "unavailable".
fn prepare_store_dir(config: &StoreConfig) -> Result<()> {
    let dir = match config.backend_kind() {
        BackendKind::Local => Some(config.path.as_path()),
        BackendKind::Sqlite => config.path.parent().filter(|p| !p.as_os_str().is_empty()),
    };

    if let Some(dir) = dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    Ok(())
}

fn read_share_from_stdin() -> Result<String> {
    let mut share = String::new();
    std::io::stdin()
        .read_to_string(&mut share)
        .context("Failed to read share from stdin")?;
    Ok(share.trim_end_matches(['\r', '\n']).to_string())
}

/// Execute one command. `Ok(false)` means the command found nothing.
async fn run(store: &dyn ShareStore, command: Command) -> Result<bool> {
    match command {
        Command::Store { share, id } => {
            let share = match share {
                Some(share) => share,
                None => read_share_from_stdin()?,
            };
            store.store_device_share(&share, id.as_deref()).await?;

            // Writes are fail-soft; confirm the share actually landed.
            if store.has_device_share(id.as_deref()).await? {
                info!("Share stored");
                Ok(true)
            } else {
                eprintln!("share was not persisted");
                Ok(false)
            }
        }
        Command::Get { id } => match store.get_device_share(id.as_deref()).await? {
            Some(share) => {
                println!("{}", share);
                Ok(true)
            }
            None => {
                debug!("No share stored");
                Ok(false)
            }
        },
        Command::Has { id } => {
            println!("{}", store.has_device_share(id.as_deref()).await?);
            Ok(true)
        }
        Command::Clear { id, all } => {
            let id = if all { None } else { id };
            store.clear_all_shares(id.as_deref()).await?;
            info!("Cleared {}", id.as_deref().unwrap_or("all shares"));
            Ok(true)
        }
        Command::Version { id, set: Some(version) } => {
            store.store_share_version(version, id.as_deref()).await?;
            Ok(true)
        }
        Command::Version { id, set: None } => match store.get_share_version(id.as_deref()).await? {
            Some(version) => {
                println!("{}", version);
                Ok(true)
            }
            None => Ok(false),
        },
        Command::List => {
            let entries = store.list_device_shares().await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr so stdout stays scriptable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("device_share=info".parse()?)
                .add_directive("sharectl=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.store_config()?;
    prepare_store_dir(&config)?;

    let store = open_store(&config).context("Failed to open share store")?;
    if run(store.as_ref(), args.command).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
