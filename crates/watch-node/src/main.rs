use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use watch_core::{format_units, SubscriberId, NATIVE_DECIMALS, NATIVE_SYMBOL};
use watch_engine::spawn as spawn_reconciler;
use watch_node::api;
use watch_node::app::Components;
use watch_node::config::AppConfig;
use watch_storage::SubscriptionStore;

const DEFAULT_CONFIG: &str = "configs/watch.toml";

#[derive(Parser, Debug)]
#[command(name = "watch-node", version, about = "Address balance watcher")]
struct Args {
    #[command(subcommand)]
    command: Option<Cli>,
}

#[derive(Subcommand, Debug)]
enum Cli {
    /// Run the reconciliation loop and the HTTP command surface (default).
    Run {
        #[arg(long, env = "WATCH_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Validate a config file and print it with credentials masked.
    Check {
        #[arg(long, env = "WATCH_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// One-shot: print a subscriber's watch list from a stopped node's store.
    List {
        #[arg(long, env = "WATCH_DB_PATH", default_value = "./data/watch")]
        db: PathBuf,
        #[arg(long)]
        subscriber: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    if let Err(err) = run().await {
        error!(error = %format!("{err:#}"), "watch-node terminated with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let cmd = args.command.unwrap_or(Cli::Run {
        config: PathBuf::from(DEFAULT_CONFIG),
    });

    match cmd {
        Cli::Run { config } => run_node(config).await,
        Cli::Check { config } => run_check(config),
        Cli::List { db, subscriber } => run_list(db, &subscriber),
    }
}

fn run_check(config_path: PathBuf) -> Result<()> {
    let cfg = AppConfig::from_toml(&config_path)?;
    let rendered = toml::to_string_pretty(&cfg.redacted()).context("failed rendering config")?;
    println!("{rendered}");
    Ok(())
}

fn run_list(db: PathBuf, subscriber: &str) -> Result<()> {
    let subscriber = SubscriberId::new(subscriber)?;
    let store = SubscriptionStore::open(&db)
        .with_context(|| format!("failed opening store at {}", db.display()))?;
    let records = store.list_for_subscriber(&subscriber)?;
    if records.is_empty() {
        println!("{subscriber} is not watching any addresses.");
        return Ok(());
    }
    println!("Addresses watched by {subscriber}:");
    for r in records {
        println!(
            "- {} (balance: {} {NATIVE_SYMBOL}, since {} ms)",
            r.address,
            format_units(r.last_known_balance, NATIVE_DECIMALS, 4),
            r.created_at_ms
        );
    }
    Ok(())
}

async fn run_node(config_path: PathBuf) -> Result<()> {
    let cfg = AppConfig::from_toml(&config_path)?;
    info!(
        config = %config_path.display(),
        upstream = %cfg.upstream.base_url,
        interval_secs = cfg.reconcile.interval_secs,
        notify = ?cfg.notify.kind,
        "starting watch-node"
    );

    let components = Components::from_config(&cfg)?;
    let loop_handle = spawn_reconciler(components.reconciler.clone());

    let addr: SocketAddr = cfg
        .api
        .listen_addr
        .parse()
        .with_context(|| format!("invalid api.listen_addr: {}", cfg.api.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed binding {addr}"))?;
    info!(%addr, "listening");

    let store = components.store.clone();
    let served = axum::serve(listener, api::router(components))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Let the in-flight cycle finish, then make sure everything is on disk.
    loop_handle.shutdown().await;
    store.flush().context("failed flushing store on shutdown")?;
    info!("watch-node stopped");

    served.context("http server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
