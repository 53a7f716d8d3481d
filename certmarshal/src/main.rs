//! certmarshald - ACME certificate issuance and renewal daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use certmarshal_config::CertmarshalConfig;
use certmarshal_core::controller::Controller;
use certmarshal_core::driver::DriverContext;
use certmarshal_tls::session::{AcmeSession, InstantAcmeSession};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// certmarshald - automates ACME certificate issuance and renewal.
#[derive(Parser)]
#[command(name = "certmarshald")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "/etc/certmarshal/config.yaml")]
        config: PathBuf,

        /// Directory of supplementary authorization snippets.
        #[arg(long, default_value = "/etc/certmarshal/conf.d")]
        confd: PathBuf,

        /// Directory the daemon owns for certificate material.
        #[arg(long, default_value = "/var/lib/certmarshal/certs")]
        certs_dir: PathBuf,
    },

    /// Parse and validate configuration without touching the certificates
    /// directory.
    Validate {
        #[arg(long, default_value = "/etc/certmarshal/config.yaml")]
        config: PathBuf,

        #[arg(long, default_value = "/etc/certmarshal/conf.d")]
        confd: PathBuf,
    },

    /// Print build version.
    Version,
}

fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            confd,
            certs_dir,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run(config, confd, certs_dir))?;
        }

        Commands::Validate { config, confd } => match certmarshal_config::load(&config, &confd) {
            Ok(parsed) => {
                println!(
                    "configuration is valid: {} account(s), {} certificate(s)",
                    parsed.accounts.len(),
                    parsed.certificates.len()
                );
            }
            Err(err) => {
                eprintln!("configuration error: {err}");
                std::process::exit(1);
            }
        },

        Commands::Version => {
            println!("certmarshald {}", certmarshal_core::VERSION);
        }
    }

    Ok(())
}

async fn run(config_path: PathBuf, confd_dir: PathBuf, certs_dir: PathBuf) -> anyhow::Result<()> {
    tracing::info!(config = %config_path.display(), "loading configuration");
    let config = certmarshal_config::load(&config_path, &confd_dir)?;

    let config_root = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let sessions = bootstrap_sessions(&config, &config_root).await?;

    let driver = DriverContext {
        paths: certmarshal_core::path::PathResolver::new(certs_dir),
        sessions,
        dns01: config.dns01.clone(),
    };

    let mut controller = Controller::new(driver, config);

    let reload_rx = certmarshal_core::reload::spawn_reload_listener(config_path, confd_dir);
    let shutdown_rx = certmarshal_core::reload::spawn_shutdown_listener();

    controller.run(reload_rx, shutdown_rx).await;
    Ok(())
}

/// Loads or registers an ACME account and session for every configured
/// account, persisting credentials under `accounts/<id>/` in the config
/// directory.
async fn bootstrap_sessions(
    config: &CertmarshalConfig,
    config_root: &std::path::Path,
) -> anyhow::Result<HashMap<String, Arc<dyn AcmeSession>>> {
    let account_paths = certmarshal_core::path::AccountPathResolver::new(config_root);
    let mut sessions: HashMap<String, Arc<dyn AcmeSession>> = HashMap::new();

    for account in &config.accounts {
        let credentials_path = account_paths.account_credentials(&account.id);
        let session: Arc<dyn AcmeSession> = if credentials_path.exists() {
            let raw = std::fs::read_to_string(&credentials_path)?;
            let credentials = serde_json::from_str(&raw)?;
            Arc::new(InstantAcmeSession::load(credentials).await?)
        } else {
            tracing::info!(account = %account.id, "registering new ACME account");
            let (session, credentials) = InstantAcmeSession::register(&account.directory, &[]).await?;
            if let Some(parent) = credentials_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&credentials_path, serde_json::to_string_pretty(&credentials)?)?;
            Arc::new(session)
        };
        sessions.insert(account.id.clone(), session);
    }

    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
