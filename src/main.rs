use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use limits::config::LimitsServiceConfig;
use limits::grpc::GrpcServer;
use limits::limits::{
    AdmissionEngine, Clock, Directive, LocalAdmission, ScopeTable, SystemClock, SystemLoad,
};
use limits::scoreboard::Scoreboard;

/// Admission control by concurrent connections and system load.
#[derive(Debug, Parser)]
#[command(name = "limits", version, about)]
struct Args {
    /// Path to the YAML configuration file. `LIMITS__*` environment variables
    /// override it, and are read on their own when no file is given
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<std::net::SocketAddr>,

    /// Override the log filter (RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Parse the configuration, print the resolved scopes and exit
    #[arg(long)]
    check_config: bool,

    /// List the supported directives and exit
    #[arg(long)]
    list_directives: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.list_directives {
        for directive in Directive::ALL {
            println!("{:<24} {}", directive.name(), directive.description());
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => LimitsServiceConfig::load(path)?,
        None => LimitsServiceConfig::from_env()?,
    };
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.logging.json |= args.log_json;

    init_tracing(&config);
    match &args.config {
        Some(path) => info!(path = %path.display(), "Loaded limits configuration"),
        None => info!("Loaded limits configuration from the environment"),
    }

    let clock = SystemClock;
    let scopes = ScopeTable::from_config(&config, &SystemLoad, clock.now())?;

    if args.check_config {
        println!("{}", serde_json::to_string_pretty(&scopes.summaries())?);
        return Ok(());
    }

    let scoreboard = Arc::new(Scoreboard::new(config.scoreboard)?);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_limit = config.scoreboard.server_limit,
        thread_limit = config.scoreboard.thread_limit,
        slot_ttl_secs = config.scoreboard.slot_ttl_secs,
        "Limits admission service loaded"
    );

    let admission = Arc::new(LocalAdmission::new(
        AdmissionEngine::new(Arc::new(SystemLoad)),
        scoreboard,
        scopes,
    ));

    if let Some(path) = args.config.clone() {
        spawn_reload_on_hangup(path, admission.clone());
    }

    let grpc_server = GrpcServer::new(config.server.grpc_addr, admission);

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Limits admission service stopped");
    Ok(())
}

fn init_tracing(config: &LimitsServiceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Rebuild the scope table from `path` whenever SIGHUP arrives.
///
/// Only the limit scopes are reloaded; the listen address and scoreboard
/// bounds keep their startup values.
#[cfg(unix)]
fn spawn_reload_on_hangup(path: PathBuf, admission: Arc<LocalAdmission>) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler, reload disabled");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            info!(path = %path.display(), "Received SIGHUP, reloading limit scopes");
            let reloaded = LimitsServiceConfig::load(&path).and_then(|config| {
                ScopeTable::from_config(&config, &SystemLoad, SystemClock.now())
            });
            match reloaded {
                Ok(scopes) => admission.replace_scopes(scopes),
                Err(e) => error!(error = %e, "Reload failed, keeping previous limits"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_path: PathBuf, _admission: Arc<LocalAdmission>) {}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
