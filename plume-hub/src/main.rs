use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use plume_core::SensorId;
use plume_hub::{
    api::api_router,
    config::{Config, StoreConfig, UpstreamMode},
    coordinator::{Coordinator, CoordinatorOptions},
    store::{SensorStore, memory::MemoryStore, sqlite::SqliteStore},
};
use plume_upstream::{HttpUpstream, SimulatedUpstream, Upstream};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "plume")]
#[command(about = "Air quality hub for low-cost particulate sensors")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "plume.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Poll sensors and serve the HTTP API (default)
    Run,
    /// Register a sensor on the current API
    Add {
        #[arg(long)]
        sensor: SensorId,
        #[arg(long)]
        api_key: String,
        /// Read key of a hidden sensor
        #[arg(long)]
        read_key: Option<String>,
    },
    /// Unregister a sensor
    Remove {
        #[arg(long)]
        sensor: SensorId,
    },
    /// Move a legacy sensor to the current API
    Migrate {
        #[arg(long)]
        sensor: SensorId,
        /// Omit to reuse the single validated key already known
        #[arg(long)]
        api_key: Option<String>,
    },
    /// List registered sensors
    List,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    let command = cli.command.unwrap_or(Command::Run);

    match config.upstream.mode {
        UpstreamMode::Http => {
            info!(api_url = %config.upstream.http.api_url, "Using PurpleAir HTTP upstream");
            let upstream = HttpUpstream::new(&config.upstream.http)?;
            with_store(upstream, &config, command).await
        }
        UpstreamMode::Simulated => {
            info!("Using simulated upstream");
            with_store(SimulatedUpstream::default(), &config, command).await
        }
    }
}

async fn with_store<U: Upstream>(
    upstream: U,
    config: &Config,
    command: Command,
) -> color_eyre::Result<()> {
    match &config.store {
        StoreConfig::Memory => {
            info!("Using in-memory sensor store");
            execute(upstream, MemoryStore::new(), config, command).await
        }
        StoreConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite sensor store");
            let store = SqliteStore::new(path).await?;
            execute(upstream, store, config, command).await
        }
    }
}

async fn execute<U, S>(
    upstream: U,
    store: S,
    config: &Config,
    command: Command,
) -> color_eyre::Result<()>
where
    U: Upstream,
    S: SensorStore,
{
    let options = CoordinatorOptions {
        settings: config.nowcast_settings()?,
        max_in_flight: config.coordinator.max_in_flight,
    };
    let coordinator = Coordinator::load(upstream, store, options).await?;

    match command {
        Command::Run => run_server(coordinator, config.server.http_addr).await?,
        Command::Add {
            sensor,
            api_key,
            read_key,
        } => {
            let registration = coordinator
                .add_sensor(sensor, &api_key, read_key.as_deref())
                .await?;
            println!("added sensor {} ({})", registration.sensor_id, registration.label);
        }
        Command::Remove { sensor } => {
            coordinator.remove_sensor(sensor).await?;
            println!("removed sensor {sensor}");
        }
        Command::Migrate { sensor, api_key } => {
            let state = coordinator.migrate_sensor(sensor, api_key.as_deref()).await?;
            println!("sensor {sensor}: {state:?}");
        }
        Command::List => {
            for (registration, migration) in coordinator.registrations().await {
                println!(
                    "{}\t{}\t{}\t{:?}",
                    registration.sensor_id,
                    registration.api_generation.as_str(),
                    registration.label,
                    migration
                );
            }
        }
    }

    Ok(())
}

async fn run_server<U, S>(
    coordinator: Coordinator<U, S>,
    http_addr: SocketAddr,
) -> color_eyre::Result<()>
where
    U: Upstream,
    S: SensorStore,
{
    let cancel = CancellationToken::new();

    let poller = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    let axum_app = Router::new()
        .route("/health", get(health_handler))
        .merge(api_router(coordinator));

    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_clone = cancel.clone();
    tokio::select! {
        result = axum::serve(axum_listener, axum_app).with_graceful_shutdown(async move {
            cancel_clone.cancelled().await;
        }) => {
            if let Err(e) = result {
                tracing::error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    cancel.cancel();
    if let Err(e) = poller.await {
        tracing::error!(error = ?e, "Coordinator task failed");
    }

    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}
