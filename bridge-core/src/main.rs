use anyhow::Result;
use hedge_edge_bridge_core::channel_reader::ChannelReader;
use hedge_edge_bridge_core::config::Config;
use hedge_edge_bridge_core::control::ControlServer;
use hedge_edge_bridge_core::copier::CopierEngine;
use hedge_edge_bridge_core::daily_limit::DailyLimitTracker;
use hedge_edge_bridge_core::host::{spawn_host_tasks, LogSink};
use hedge_edge_bridge_core::port_manager::{PortManager, AGENT_HTTP_PORTS, ZMQ_DATA_PORTS};
use hedge_edge_bridge_core::session_manager::SessionManager;
use hedge_edge_bridge_core::{logging, host};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Determine config directory from CONFIG_DIR environment variable.
    // Falls back to the executable's directory, then the current directory.
    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_string_lossy().into_owned()))
            .unwrap_or_else(|| ".".to_string())
    });
    let config_base = format!("{}/config", config_dir);

    let config = match Config::from_file(&config_base) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}, using defaults", e);
            Config::default()
        }
    };

    logging::init(&config.logging);

    tracing::info!("Starting HedgeEdge bridge core...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Registration directory: {}",
        config.discovery.registration_dir
    );
    tracing::info!("Data directory: {}", config.copier.data_dir);

    let data_dir = Path::new(&config.copier.data_dir).to_path_buf();
    let registration_dir = Path::new(&config.discovery.registration_dir).to_path_buf();
    let save_debounce = Duration::from_secs(config.copier.save_debounce_secs);

    // Port governance and the startup conflict sweep
    let port_manager = Arc::new(PortManager::from_config(&config.zeromq));
    let mut known_ports: Vec<(u16, &str)> =
        ZMQ_DATA_PORTS.iter().map(|&p| (p, "zmq-data")).collect();
    known_ports.extend(ZMQ_DATA_PORTS.iter().map(|&p| (p + 1, "zmq-command")));
    known_ports.extend(AGENT_HTTP_PORTS.iter().map(|&p| (p, "agent-http")));
    port_manager.detect_startup_conflicts(&known_ports);

    // Liveness gates, one PAIR bind per terminal
    let control = Arc::new(ControlServer::new(
        "licensed",
        env!("CARGO_PKG_VERSION"),
        Duration::from_secs(config.control.enable_resend_secs),
    ));

    let reader = ChannelReader::new(config.clone(), port_manager.clone(), control.clone());
    let sessions = SessionManager::new(&data_dir, save_debounce);
    let daily = DailyLimitTracker::new(&data_dir, save_debounce);

    let copier = CopierEngine::new(
        reader.clone(),
        &data_dir,
        &registration_dir,
        save_debounce,
    );
    copier.start();
    let replayed = copier.sync_offline_trades().await;
    if replayed > 0 {
        tracing::info!("Offline sync replayed {} follower trade(s)", replayed);
    }

    // Initial discovery pass before the periodic timers take over
    let connected = reader.scan_and_connect(true).await;
    tracing::info!("Initial scan connected {} terminal(s)", connected.len());

    let mut glue = spawn_host_tasks(
        reader.clone(),
        sessions.clone(),
        copier.clone(),
        daily.clone(),
        Arc::new(LogSink) as Arc<dyn host::UiSink>,
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    glue.shutdown();
    copier.shutdown().await;
    reader.shutdown().await;
    sessions.flush().await;
    daily.flush().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
