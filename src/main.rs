//! WolfElect - Master Election over a Coordination Store
//!
//! Command line front end: serves a development store, joins or observes an
//! election, and queries or resets the current master.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfelect::config::{LoggingConfig, WolfElectConfig};
use wolfelect::election::{LoggingReceiver, MasterElectionClient};
use wolfelect::error::Result;
use wolfelect::network::{RemoteStore, StoreServer};
use wolfelect::store::{CoordinationStore, MemoryStore};

/// WolfElect - Master Election over a Coordination Store
#[derive(Parser)]
#[command(name = "wolfelect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfelect.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to logging.level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-memory coordination store
    Serve {
        /// Address to listen on (defaults to server.bind_address)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Join the election and follow role changes until Ctrl-C
    Run {
        /// Election name (defaults to election.name)
        #[arg(short, long)]
        name: Option<String>,

        /// Identity to publish as master (defaults to node.identity)
        #[arg(short, long)]
        identity: Option<String>,

        /// Only observe, never become master
        #[arg(long)]
        observe: bool,
    },

    /// Show the current master
    Status {
        /// Election name (defaults to election.name)
        #[arg(short, long)]
        name: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Delete the election key so a new master is elected
    Force {
        /// Election name (defaults to election.name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfelect.toml")]
        output: PathBuf,

        /// Identity published when this node is master
        #[arg(long, default_value = "127.0.0.1:9000")]
        identity: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = LoggingConfig::resolve(&cli.config, cli.log_level.clone());
    init_logging(&logging.level, &logging.format);

    match cli.command {
        Commands::Serve { listen } => run_serve(&cli.config, listen).await,
        Commands::Run { name, identity, observe } => {
            run_election(&cli.config, name, identity, observe).await
        }
        Commands::Status { name, json } => run_status(&cli.config, name, json).await,
        Commands::Force { name } => run_force(&cli.config, name).await,
        Commands::Init { output, identity } => run_init(output, identity),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the config file and apply command line overrides
fn load_config(
    config_path: &Path,
    name: Option<String>,
    identity: Option<String>,
) -> Result<WolfElectConfig> {
    let mut config = match WolfElectConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Run 'wolfelect init' to create one");
            return Err(e);
        }
    };

    if let Some(name) = name {
        config.election.name = name;
    }
    if let Some(identity) = identity {
        config.node.identity = identity;
    }
    config.validate()?;
    Ok(config)
}

/// Store client built from the config
fn remote_store(config: &WolfElectConfig) -> Arc<dyn CoordinationStore> {
    Arc::new(RemoteStore::new(config.remote_store_config()))
}

/// Serve a MemoryStore over TCP
async fn run_serve(config_path: &Path, listen: Option<String>) -> Result<()> {
    let server_config = WolfElectConfig::from_file(config_path)
        .map(|config| config.server)
        .unwrap_or_default();
    let bind_address = listen.unwrap_or(server_config.bind_address);

    let store = Arc::new(MemoryStore::with_history_limit(server_config.history_limit));
    let server = Arc::new(StoreServer::new(bind_address.clone(), store));
    tracing::info!(
        "Starting in-memory coordination store on {} (keeping {} changes)",
        bind_address,
        server_config.history_limit
    );

    let running = Arc::clone(&server);
    let handle = tokio::spawn(async move { running.start().await });

    tokio::select! {
        result = handle => {
            match result {
                Ok(inner) => inner?,
                Err(e) => tracing::error!("Store server task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
        }
    }

    Ok(())
}

/// Take part in (or observe) the election until Ctrl-C
async fn run_election(
    config_path: &Path,
    name: Option<String>,
    identity: Option<String>,
    observe: bool,
) -> Result<()> {
    let config = load_config(config_path, name, identity)?;
    let mut election = config.election_config();
    if observe {
        election = election.observer();
    }

    tracing::info!(
        "Joining election {} as {} ({})",
        election.path(),
        election.identity,
        if election.participating { "participant" } else { "observer" }
    );

    let receiver = Arc::new(LoggingReceiver::new(&config.election.name));
    let client = MasterElectionClient::start(remote_store(&config), election, receiver).await?;

    let signal_client = Arc::clone(&client);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_client.shutdown();
        }
    });

    // Returns at once if the initial read failed
    client.sync_wait().await;

    tracing::info!("Left election {} as {}", client.path(), client.role().await);
    Ok(())
}

/// Print the current master
async fn run_status(config_path: &Path, name: Option<String>, json: bool) -> Result<()> {
    let config = load_config(config_path, name, None)?;
    let store = remote_store(&config);
    let path = config.election_path();

    let master = match store.read(&path).await {
        Ok((body, revision)) => Some((String::from_utf8_lossy(&body).into_owned(), revision)),
        Err(e) if e.is_not_found() => None,
        Err(e) => {
            eprintln!("✗ Failed to read {}: {}", path, e);
            return Err(e);
        }
    };

    if json {
        let status = match &master {
            Some((identity, revision)) => serde_json::json!({
                "election": path,
                "master": identity,
                "revision": revision,
            }),
            None => serde_json::json!({
                "election": path,
                "master": null,
            }),
        };
        println!("{}", status);
        return Ok(());
    }

    println!("Election: {}", path);
    match master {
        Some((identity, revision)) => {
            println!("Master:   {}", identity);
            println!("Revision: {}", revision);
        }
        None => println!("Master:   (none)"),
    }
    Ok(())
}

/// Force a new election
async fn run_force(config_path: &Path, name: Option<String>) -> Result<()> {
    let config = load_config(config_path, name, None)?;
    let election = config.election_config().observer();
    let receiver = Arc::new(LoggingReceiver::new(&config.election.name));

    let client = MasterElectionClient::start(remote_store(&config), election, receiver).await?;
    let result = client.force_election().await;
    client.shutdown();
    client.sync_wait().await;

    match result {
        Ok(()) => {
            println!("✓ Forced new election for {}", client.path());
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            println!("No master holds {}, nothing to force", client.path());
            Ok(())
        }
        Err(e) if e.is_benign_race() => {
            println!("Election key changed meanwhile, nothing forced");
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Failed to force election: {}", e);
            Err(e)
        }
    }
}

/// Write a default configuration file
fn run_init(output: PathBuf, identity: String) -> Result<()> {
    let config = WolfElectConfig::example(&identity);
    let content = format!(
        "# WolfElect Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );

    std::fs::write(&output, content)?;
    println!("Configuration written to {:?}", output);
    println!("Edit node.identity and store.address before joining the election.");

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfElectConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Identity: {}", config.node.identity);
            println!("  Participating: {}", config.node.participating);
            println!("  Election: {}", config.election_path());
            println!("  Store: {}", config.store.address);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
