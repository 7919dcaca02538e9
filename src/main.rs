use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;
use uplink_store::{ConfigManager, StoreOptions, UplinkError, UplinkStore};

#[derive(Parser)]
#[command(name = "uplink")]
#[command(about = "Path-addressed realtime collection store with remote/local dual mode")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding local collections and the connection configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Inbound share link whose #uplink= fragment configures the connection
    #[arg(long)]
    link: Option<String>,

    /// Simulated local-mode write latency in milliseconds
    #[arg(long, default_value = "300")]
    simulate_latency_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which mode is active
    Status,
    /// Subscribe to a collection path and print every snapshot
    Tail {
        /// Collection path, e.g. chat/Licence_Year_1
        path: String,
    },
    /// Append a record to a collection path
    Append {
        path: String,
        /// Record fields as key=value pairs; values parse as JSON when possible
        #[arg(short, long)]
        field: Vec<String>,
        /// Whole record as a JSON object (merged over --field pairs)
        #[arg(short, long)]
        json: Option<String>,
    },
    /// Remove a record by id
    Remove { path: String, id: String },
    /// Manage the connection configuration
    #[command(subcommand)]
    Link(LinkCommands),
}

#[derive(Subcommand)]
enum LinkCommands {
    /// Import configuration from a share link
    Import { link: String },
    /// Save raw configuration JSON
    Save { json: String },
    /// Clear the stored configuration, reverting to local mode
    Reset,
    /// Print a shareable invite link embedding the current configuration
    Invite {
        #[arg(long)]
        base_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), UplinkError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(ConfigManager::default_dir);
    let manager = ConfigManager::new(&data_dir);

    match &cli.command {
        Commands::Link(link) => run_link_command(&manager, link),
        Commands::Status => {
            let store = open_store(&cli, &manager, &data_dir)?;
            if store.is_online() {
                println!("📡 ONLINE - uplink established");
            } else {
                println!("💾 SIMULATION MODE - local storage only");
            }
            Ok(())
        }
        Commands::Tail { path } => {
            let store = open_store(&cli, &manager, &data_dir)?;
            tail(&store, path).await
        }
        Commands::Append { path, field, json } => {
            let store = open_store(&cli, &manager, &data_dir)?;
            let fields = build_fields(field, json.as_deref())?;
            let id = store.append(path, fields).await?;
            println!("✅ appended {} to {}", id, path);
            Ok(())
        }
        Commands::Remove { path, id } => {
            let store = open_store(&cli, &manager, &data_dir)?;
            store.remove(path, id).await?;
            println!("🗑️  removed {} from {}", id, path);
            Ok(())
        }
    }
}

fn open_store(
    cli: &Cli,
    manager: &ConfigManager,
    data_dir: &PathBuf,
) -> Result<UplinkStore, UplinkError> {
    let config = manager.resolve(cli.link.as_deref());
    let options = StoreOptions {
        write_delay: Duration::from_millis(cli.simulate_latency_ms),
    };
    UplinkStore::open(config, data_dir, options)
}

fn run_link_command(manager: &ConfigManager, command: &LinkCommands) -> Result<(), UplinkError> {
    match command {
        LinkCommands::Import { link } => {
            if manager.resolve(Some(link)).is_some() {
                println!("✅ configuration imported, applies on next start");
                Ok(())
            } else {
                Err(UplinkError::Configuration(
                    "link carries no usable uplink fragment".to_string(),
                ))
            }
        }
        LinkCommands::Save { json } => {
            manager.save(json)?;
            println!("✅ configuration saved, applies on next start");
            Ok(())
        }
        LinkCommands::Reset => {
            manager.reset()?;
            println!("✅ configuration cleared, next start runs in local mode");
            Ok(())
        }
        LinkCommands::Invite { base_url } => match manager.invite_link(base_url)? {
            Some(link) => {
                // The recipient gets the same read/write access as these
                // credentials carry.
                println!("{}", link);
                Ok(())
            }
            None => {
                println!("no connection configured, nothing to share");
                Ok(())
            }
        },
    }
}

async fn tail(store: &UplinkStore, path: &str) -> Result<(), UplinkError> {
    info!("📋 tailing {}", path);
    let path_label = path.to_string();
    let _subscription = store.subscribe(path, move |records| {
        println!("── {} ({} records)", path_label, records.len());
        for record in records {
            match serde_json::to_string(record) {
                Ok(line) => println!("{}", line),
                Err(_) => println!("{}", record.id),
            }
        }
    })?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| UplinkError::Unknown(e.to_string()))?;
    Ok(())
}

fn build_fields(pairs: &[String], json: Option<&str>) -> Result<Map<String, Value>, UplinkError> {
    let mut fields = Map::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            UplinkError::Configuration(format!("field '{}' is not key=value", pair))
        })?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    if let Some(json) = json {
        let parsed: Value = serde_json::from_str(json)
            .map_err(|e| UplinkError::Configuration(format!("invalid record JSON: {}", e)))?;
        let object = parsed.as_object().cloned().ok_or_else(|| {
            UplinkError::Configuration("record JSON must be an object".to_string())
        })?;
        fields.extend(object);
    }
    // Callers conventionally order records by a millisecond timestamp.
    fields
        .entry("timestamp".to_string())
        .or_insert_with(|| Value::from(chrono::Utc::now().timestamp_millis()));
    Ok(fields)
}
