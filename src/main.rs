use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use systemd_service_monitor::{
    audit::StatusBoard,
    build_app, build_audit_sink,
    config::{self, MonitorConfig},
    domain::{
        checker::ServiceChecker,
        scheduler::{Scheduler, SchedulerOptions},
    },
    logging,
    systemd_client::ProcessRunner,
    AppState,
};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Probe systemd services on a schedule and bring them back up")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, required_unless_present = "print_example")]
    config: Option<PathBuf>,

    /// Run a single monitoring pass and exit
    #[arg(long)]
    once: bool,

    /// Serve the status endpoint on this address (overrides `status_bind`)
    #[arg(long, value_parser = config::parse_socket)]
    status_addr: Option<SocketAddr>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.print_example {
        print!("{}", config::EXAMPLE_CONFIG);
        return Ok(());
    }

    let config_path = cli.config.ok_or("--config is required")?;
    let config = match MonitorConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            let _guard = logging::init_logging(config::DEFAULT_LOG_LEVEL, None)?;
            error!("Configuration error: {err}");
            return Err(err.into());
        }
    };

    let _guard = logging::init_logging(&config.log_level, config.log_destination.as_deref())?;
    info!(
        path = %config_path.display(),
        targets = config.targets.len(),
        active = config.active_targets(),
        "configuration loaded"
    );

    let status_bind = cli.status_addr.or(config.status_bind);
    let board = status_bind.map(|_| Arc::new(StatusBoard::new()));
    let sink = build_audit_sink(&config, board.clone()).await?;

    let server = match (status_bind, board) {
        (Some(bind_socket), Some(board)) => {
            let app = build_app(AppState::new(board));
            let listener = tokio::net::TcpListener::bind(bind_socket).await?;
            info!(bind_addr = %bind_socket, "status endpoint starting");
            Some(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app.into_make_service()).await {
                    error!(error = %err, "status endpoint failed");
                }
            }))
        }
        _ => None,
    };

    let checker = Arc::new(ServiceChecker::new(
        Arc::new(ProcessRunner::new()),
        config.default_timeout,
    ));
    let mut scheduler = Scheduler::new(
        config.targets,
        checker,
        sink.clone(),
        SchedulerOptions {
            tick: config.tick,
            max_parallel_probes: config.max_parallel_probes,
        },
    );

    let summary = if cli.once {
        info!("running single monitoring pass");
        scheduler.run_once().await
    } else {
        info!("starting continuous monitoring (Ctrl+C to stop)");
        scheduler.run_continuous(shutdown_signal()).await
    };
    info!(?summary, "monitoring finished");

    if let Err(err) = sink.flush().await {
        warn!(error = %err, "failed to flush audit records");
    }
    if let Some(server) = server {
        server.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("terminate signal received"),
    }
}
