//! Config reloader.
//!
//! A dedicated task listens for `SIGHUP`, re-parses configuration, and
//! posts the result to the controller over a channel so the actual
//! reload is applied only at a tick boundary (§4.7, §9).

use std::path::PathBuf;

use certmarshal_config::CertmarshalConfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Spawns the SIGHUP listener. Returns the receiving end the controller
/// drains between ticks.
pub fn spawn_reload_listener(
    config_path: PathBuf,
    confd_dir: PathBuf,
) -> mpsc::Receiver<CertmarshalConfig> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGHUP handler");
                return;
            }
        };
        loop {
            if hangup.recv().await.is_none() {
                return;
            }
            tracing::info!("SIGHUP received, reloading configuration");
            match certmarshal_config::load(&config_path, &confd_dir) {
                Ok(config) => {
                    if tx.send(config).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "configuration reload failed, keeping old configuration");
                }
            }
        }
    });
    rx
}

/// Spawns the listener for `SIGINT`/`SIGTERM`, resolving the returned
/// oneshot when either fires so the controller can exit gracefully at the
/// next tick boundary.
pub fn spawn_shutdown_listener() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received");
            }
            _ = term.recv() => {
                tracing::info!("SIGTERM received");
            }
        }
        let _ = tx.send(());
    });
    rx
}
