//! procmuxd entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use procmux_server::logging::{TracingConfig, TracingOutputFormat, init_tracing};
use procmux_server::{
    RpcHandler, ServerConfig, ServerResult, SocketServer, default_socket_path, demo,
    make_connection_handler,
};

/// Serves the demo procedures over a Unix socket.
#[derive(Debug, Parser)]
#[command(name = "procmuxd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the Unix socket to listen on
    #[arg(long, short, env = "PROCMUX_SOCKET")]
    socket: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Seconds allowed for writing one frame to a client
    #[arg(long, default_value_t = 10)]
    write_timeout: u64,

    /// Enable debug output
    #[arg(long, short = 'v')]
    debug: bool,

    /// Log format: pretty, compact or json
    #[arg(long, env = "PROCMUX_LOG_FORMAT")]
    log_format: Option<TracingOutputFormat>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut tracing_config = if cli.debug {
        TracingConfig::cli_debug()
    } else {
        TracingConfig::daemon()
    };
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ServerResult<()> {
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);
    let config = ServerConfig::new(&socket_path)
        .with_max_connections(cli.max_connections)
        .with_write_timeout(Duration::from_secs(cli.write_timeout));

    let handler = Arc::new(RpcHandler::new(
        demo::router(),
        demo::context_factory(demo::DemoHub::new()),
    ));
    let server = SocketServer::new(config).await?;
    info!(path = %socket_path.display(), "Server listening");

    server
        .run_until_shutdown(make_connection_handler(handler), shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating shutdown"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received SIGINT, initiating shutdown");
    }
}
