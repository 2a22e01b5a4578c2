// controller: Arbitrates traffic-signal phase requests from MQTT clients.
//
// Runtime event loop: wires together the relay engine, duplicate tracker,
// broker driver, dispatcher, and the supervisor heartbeat.

use std::sync::Arc;

use controller::admin::{AdminExecutor, ProcessRunner};
use controller::config::ControllerConfig;
use controller::dispatcher::Dispatcher;
use controller::liveness::{Health, LivenessReporter, LogLiveness, spawn_heartbeat};
use controller::mqtt;
use controller::outputs::SysfsOutputs;
use tc_core::dedup::{DuplicateTracker, spawn_sweeper};
use tc_core::relay::{RelayEngine, spawn_checker};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tracing::{error, info};

fn load_config_or_exit() -> ControllerConfig {
    // Parse optional --config <path>; defaults to /etc/tc/controller.toml.
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(p) => std::path::PathBuf::from(p),
            None => {
                eprintln!("FATAL: --config requires a path argument");
                std::process::exit(1);
            }
        },
        None => std::path::PathBuf::from("/etc/tc/controller.toml"),
    };

    match controller::config::load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                controller_id = %cfg.controller_id,
                broker = %cfg.broker.host,
                phases = cfg.phase_to_output.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    // Structured logging to stdout; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "controller starting");

    let cfg = load_config_or_exit();

    let outputs = match SysfsOutputs::new(
        cfg.outputs.sysfs_root.clone(),
        cfg.phase_to_output.values().copied(),
    ) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("FATAL: failed to configure output pins: {e}");
            std::process::exit(1);
        }
    };

    let engine = RelayEngine::new(outputs, cfg.phase_to_output.clone());
    let tracker = Arc::new(DuplicateTracker::new());
    let health = Arc::new(Health::new());
    let reporter = Arc::new(LogLiveness);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let checker = spawn_checker(Arc::clone(&engine), shutdown_rx.clone());
    let sweeper = spawn_sweeper(Arc::clone(&tracker), shutdown_rx.clone());
    let heartbeat = spawn_heartbeat(
        Arc::clone(&reporter),
        Arc::clone(&health),
        Duration::from_secs(cfg.watchdog.heartbeat_secs),
        shutdown_rx.clone(),
    );

    // Inbound deliveries flow broker driver -> channel -> dispatcher.
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (publisher, driver) = match mqtt::connect(&cfg, Arc::clone(&health), inbound_tx) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("FATAL: failed to build broker connection: {e}");
            std::process::exit(1);
        }
    };
    let mut driver_task = tokio::spawn(driver.run(shutdown_rx.clone()));

    let admin = Arc::new(AdminExecutor::new(&cfg.controller_id, ProcessRunner));
    let dispatcher = Dispatcher::new(
        &cfg.controller_id,
        publisher,
        Arc::clone(&tracker),
        Arc::clone(&engine),
        admin,
        Arc::clone(&health),
    );
    let dispatcher_task = tokio::spawn(dispatcher.run(inbound_rx, shutdown_rx.clone()));

    reporter.ready();
    info!(controller_id = %cfg.controller_id, "controller serving");

    // Wait for Ctrl-C, SIGTERM, or a fatal broker error.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                shutdown_tx.send(true).ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
            result = &mut driver_task => {
                match result {
                    Ok(Err(e)) => {
                        error!(error = %e, "broker driver failed");
                        reporter.stopping();
                        std::process::exit(1);
                    }
                    Ok(Ok(())) => info!("broker driver finished"),
                    Err(e) => error!(error = %e, "broker driver panicked"),
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: Ctrl-C received"),
            result = &mut driver_task => {
                if let Ok(Err(e)) = result {
                    error!(error = %e, "broker driver failed");
                    reporter.stopping();
                    std::process::exit(1);
                }
            }
        }
    }

    reporter.stopping();
    shutdown_tx.send(true).ok();

    // Outputs stay in their last-written state; the hardware watchdog owns
    // reset-on-death.  Give the tasks a moment to observe shutdown.
    let drain = async {
        let _ = dispatcher_task.await;
        let _ = checker.await;
        let _ = sweeper.await;
        let _ = heartbeat.await;
    };
    if tokio::time::timeout(Duration::from_secs(2), drain).await.is_err() {
        error!("tasks did not stop in time");
    }
    sleep(Duration::from_millis(50)).await;

    info!("controller shutdown complete");
}
