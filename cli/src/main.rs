//! arkts-lsw - stdio LSP wrapper for the IPC-mode ETS language server.
//!
//! ```text
//! editor stdin ──frames──▶ FrameParser ──▶ [initialize interception] ──IPC──▶ backend
//! editor stdout ◀──frames── FrameWriter ◀──────────────────────────────IPC── backend
//! ```
//!
//! Exit status is 0 when the bridge stops on a signal or editor EOF, and 1 on
//! any fault, including a missing backend.

mod logging;

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use lsw_config::{BridgeConfig, LogConfig};
use lsw_lsp::StopReason;

use crate::logging::LogGuard;

#[tokio::main]
async fn main() {
    let config = BridgeConfig::from_env();

    let log_config = match &config {
        Ok(config) => config.log().clone(),
        Err(_) => LogConfig {
            enabled: false,
            path: PathBuf::new(),
        },
    };
    let guard = logging::init(&log_config);
    install_panic_hook(guard.clone());

    let code = match config {
        Ok(config) => {
            tracing::info!(
                script = %config.server_script().display(),
                runtime = config.runtime(),
                "ETS language server wrapper starting"
            );
            exit_code(serve(&config).await)
        }
        Err(e) => {
            tracing::error!("{e}");
            1
        }
    };

    guard.close();
    // Tokio's stdin reader would otherwise hold the runtime open.
    process::exit(code);
}

fn exit_code(outcome: Result<StopReason>) -> i32 {
    match outcome {
        Ok(reason) => {
            tracing::info!(?reason, "Bridge stopped");
            0
        }
        Err(e) => {
            tracing::error!("{e:#}");
            1
        }
    }
}

/// Log the panic, flush the log and exit instead of leaving the bridge wedged.
fn install_panic_hook(guard: LogGuard) {
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("Uncaught panic: {info}");
        guard.close();
        process::exit(1);
    }));
}

#[cfg(unix)]
async fn serve(config: &BridgeConfig) -> Result<StopReason> {
    let mut bridge = lsw_lsp::Bridge::start(&config.backend())?;
    bridge
        .run(tokio::io::stdin(), tokio::io::stdout(), shutdown_signal())
        .await
}

#[cfg(not(unix))]
async fn serve(_config: &BridgeConfig) -> Result<StopReason> {
    Err(lsw_lsp::BackendError::Unsupported.into())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    () = ctrl_c() => {}
                    _ = terminate.recv() => tracing::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received interrupt"),
        Err(e) => {
            tracing::warn!("Cannot listen for interrupts: {e}");
            std::future::pending::<()>().await;
        }
    }
}
