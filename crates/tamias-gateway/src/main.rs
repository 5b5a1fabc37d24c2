//! The `tamias` daemon binary.
//!
//! `tamias start` runs interactively (terminal bridge on stdin/stdout);
//! `tamias start --daemon` runs headless. Either way: load `.env` and
//! `config.json`, open the session store, wire runner + dispatcher,
//! connect bridges, bind the first free port ≥ 9001, write `daemon.json`,
//! and serve until a signal or `DELETE /daemon`.
//!
//! Exit codes: 0 normal, 1 unrecoverable startup error, 2 port bind
//! failure, 3 invalid config.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use tamias_agent::{AgentsStore, BackendFactory, EnvBackendFactory, Runner};
use tamias_bridges::Dispatcher;
use tamias_core::config::{load_env_file, TamiasConfig};
use tamias_core::error::{EXIT_CONFIG, EXIT_OK, EXIT_PORT_BIND, EXIT_STARTUP};
use tamias_core::paths::{DaemonInfo, DataRoot};
use tamias_sessions::SessionStore;
use tamias_tools::ToolHost;

use tamias_gateway::app::{self, AppState};
use tamias_gateway::{bridges, stop};

/// Ports common local services squat on; the scan skips them.
const PORT_BLOCKLIST: &[u16] = &[3000, 3306, 5432, 6379, 8000, 8080, 8443, 9000];
const PORT_SCAN_START: u16 = 9001;
const PORT_SCAN_END: u16 = 9100;

#[derive(Parser)]
#[command(name = "tamias", version, about = "Tamias chat multiplexer daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon.
    Start {
        /// Run headless (no terminal bridge).
        #[arg(long)]
        daemon: bool,
        /// Use an isolated tenant data root (`~/.tamias/tenants/<id>`).
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Command::Start { daemon, tenant } = cli.command;
    std::process::exit(run(daemon, tenant).await);
}

async fn run(daemon: bool, tenant: Option<String>) -> i32 {
    let root = match (&tenant, std::env::var("TAMIAS_HOME").ok()) {
        (Some(id), _) => DataRoot::tenant(id),
        (None, Some(home)) => DataRoot::at(home),
        (None, None) => DataRoot::default_root(),
    };
    if let Err(e) = root.ensure_layout() {
        eprintln!("failed to create data directories: {e}");
        return EXIT_STARTUP;
    }

    // Secrets first, so config validation can see env-key presence.
    if let Err(e) = load_env_file(&root.env_file()) {
        eprintln!("failed to read .env: {e}");
        return EXIT_STARTUP;
    }

    let config = match TamiasConfig::load(&root.config_file()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return EXIT_CONFIG;
        }
    };

    // Daily-rolling daemon.log with 3-file retention, plus stdout.
    let file_appender = match tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("daemon.log")
        .max_log_files(3)
        .build(root.log_dir())
    {
        Ok(a) => a,
        Err(e) => {
            eprintln!("failed to open daemon.log: {e}");
            return EXIT_STARTUP;
        }
    };
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tamias=info,tower_http=warn".into());
    if daemon {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file_writer)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file_writer.and(std::io::stderr))
            .with_ansi(false)
            .init();
    }

    let shutdown = CancellationToken::new();
    let store = Arc::new(SessionStore::new(root.clone(), config));
    let agents = Arc::new(AgentsStore::load(&root));
    let dispatcher = Arc::new(Dispatcher::new());
    let state = AppState::new(
        root.clone(),
        Arc::clone(&store),
        Arc::clone(&agents),
        Arc::clone(&dispatcher),
        shutdown.clone(),
    );

    // Every session (created or loaded) gets its dispatcher pump.
    {
        let dispatcher = Arc::clone(&dispatcher);
        store.set_session_hook(Box::new(move |handle| dispatcher.attach_session(handle)));
    }

    // Runner wiring: the store wakes it through an unbounded channel.
    let (runner_tx, runner_rx) = tokio::sync::mpsc::unbounded_channel();
    store.set_runner(runner_tx);
    let host: Arc<dyn ToolHost> = state.clone();
    let factory: Arc<dyn BackendFactory> = Arc::new(EnvBackendFactory);
    let debug = state.config().debug;
    let runner = Runner::new(
        Arc::clone(&store),
        Arc::clone(&agents),
        factory,
        host,
        shutdown.clone(),
        debug,
    );
    runner.spawn_loop(runner_rx);

    store.load_persisted();
    bridges::start_bridges(&state, &agents, !daemon).await;

    let (listener, port) = match bind_port().await {
        Ok(bound) => bound,
        Err(e) => {
            error!(error = %e, "no bindable port in {PORT_SCAN_START}..{PORT_SCAN_END}");
            return EXIT_PORT_BIND;
        }
    };
    state.set_port(port);

    let info = DaemonInfo {
        pid: std::process::id(),
        port,
        started_at: state.started_at.clone(),
        dashboard_port: None,
    };
    if let Err(e) = info.write(&root) {
        error!(error = %e, "failed to write daemon.json");
        return EXIT_STARTUP;
    }

    let router = app::build_router(Arc::clone(&state));
    let server_token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server failed");
        }
    });

    // Startup is complete only once /health answers.
    if !wait_for_health(port).await {
        error!("daemon did not become healthy");
        shutdown.cancel();
        let _ = server.await;
        return EXIT_STARTUP;
    }
    info!(port, pid = std::process::id(), "tamias daemon ready");

    // Signals trigger the same graceful path as DELETE /daemon.
    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        stop::run(signal_state).await;
    });

    shutdown.cancelled().await;
    let _ = server.await;
    EXIT_OK
}

/// First free loopback port ≥ 9001 outside the blocklist. The listener is
/// returned still bound so nothing can steal the port before serve.
async fn bind_port() -> std::io::Result<(TcpListener, u16)> {
    for port in PORT_SCAN_START..PORT_SCAN_END {
        if PORT_BLOCKLIST.contains(&port) {
            continue;
        }
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(_) => continue,
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "port scan exhausted",
    ))
}

async fn wait_for_health(port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/health");
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
