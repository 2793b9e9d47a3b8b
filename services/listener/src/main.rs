use clap::{Arg, Command};
use listener::acceptor::{Acceptor, ListenerContext};
use listener::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use listener::registry::ConfiguredRegistry;
use listener::sink::TracingSink;
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "listener starting");

    let matches = Command::new("tracklink listener")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Accepts GPS tracker connections and publishes decoded locations")
        .arg(
            Arg::new("config")
                .help("Path to the listener TOML config")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let cfg = match load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                path = %config_path.display(),
                endpoints = cfg.endpoints.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let registry = ConfiguredRegistry::from_config(&cfg.registry);
    let ctx = ListenerContext::new(
        registry,
        TracingSink,
        cfg.session.clone(),
        cfg.delivery.clone(),
    );

    let handle = match Acceptor::new(ctx).bind(&cfg.endpoints).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    // Periodic stats report
    let stats = std::sync::Arc::clone(handle.stats());
    let stats_cancel = handle.cancellation_token();
    let stats_interval = cfg.stats_interval;
    let stats_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stats_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stats_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let s = stats.snapshot();
                    info!(
                        active = s.connections_active,
                        accepted = s.connections_accepted,
                        rejected = s.connections_rejected,
                        frames = s.frames_decoded,
                        decode_errors = s.decode_errors,
                        framing_errors = s.framing_errors,
                        emitted = s.locations_emitted,
                        dropped = s.locations_dropped,
                        unresolved = s.unresolved_devices,
                        sink_failures = s.sink_failures,
                        panics = s.session_panics,
                        "listener stats"
                    );
                }
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    handle.shutdown().await;
    if let Err(e) = stats_task.await {
        error!(error = %e, "stats task failed");
    }
    info!("listener stopped");
}
