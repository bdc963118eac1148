//! Database gateway - main entry point.
//!
//! Reads newline-delimited JSON tool calls from stdin and writes one JSON
//! response per line to stdout. Logs go to stderr.

use clap::Parser;
use db_gateway::tools::{ToolCall, ToolDispatcher, ToolResponse};
use db_gateway::{Gateway, GatewayConfig, GatewayError};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &GatewayConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
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

async fn serve(dispatcher: &ToolDispatcher) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ToolCall>(&line) {
            Ok(call) => dispatcher.dispatch(call).await,
            Err(e) => ToolResponse::from(GatewayError::validation(format!(
                "invalid tool call: {e}"
            ))),
        };
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::parse();
    init_tracing(&config);

    info!("Starting db-gateway v{}", env!("CARGO_PKG_VERSION"));

    let connections = config.load_connections()?;
    if connections.is_empty() {
        warn!("No connections configured; use --connections <file> or --connection id=url");
    }
    info!(count = connections.len(), "Loaded connection descriptors");

    let gateway = Gateway::new(config)?;
    let dispatcher = ToolDispatcher::new(Arc::clone(&gateway), Arc::new(connections));

    let signalled = tokio::select! {
        result = serve(&dispatcher) => {
            match result {
                Ok(()) => info!("Input closed"),
                Err(e) => error!(error = %e, "Transport error"),
            }
            false
        }
        _ = wait_for_signal() => {
            info!("Shutdown signal received");
            true
        }
    };

    let report = gateway.shutdown().await;
    info!(
        transactions_rolled_back = report.transactions_rolled_back,
        pools_closed = report.pools_closed,
        "Shutdown complete"
    );

    if signalled {
        // A pending stdin read would block runtime teardown
        std::process::exit(0);
    }
    Ok(())
}
