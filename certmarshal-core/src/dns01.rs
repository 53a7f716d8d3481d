//! DNS-01 challenge publisher.
//!
//! Writes challenge responses to the DNS challenge directory and invokes
//! the configured zone-update command so an external DNS system can
//! publish the corresponding TXT records.

use std::time::Duration;

use certmarshal_config::Dns01Config;
use certmarshal_tls::codec::write_atomic;
use tokio::process::Command;
use tokio::time::timeout;

use crate::path::PathResolver;

/// One DNS-01 challenge to publish: the validation domain (e.g.
/// `_acme-challenge.example.org`) and the TXT record value.
#[derive(Debug, Clone)]
pub struct Dns01Challenge {
    pub validation_domain: String,
    pub value: String,
}

/// Writes every challenge under `paths`' DNS-01 tree and invokes the
/// configured zone-update command. Returns `true` iff the command exited
/// successfully within its timeout; callers leave the certificate in place
/// to retry on `false`.
pub async fn publish(config: &Dns01Config, paths: &PathResolver, challenges: &[Dns01Challenge]) -> bool {
    for challenge in challenges {
        let path = paths.dns01_challenge(&challenge.validation_domain);
        if write_atomic(&path, challenge.value.as_bytes()).is_err() {
            tracing::warn!(domain = %challenge.validation_domain, "failed to write DNS-01 challenge file");
            return false;
        }
    }

    let Some(cmd) = config.zone_update_cmd.as_ref() else {
        tracing::debug!("no zone-update command configured, skipping invocation");
        return true;
    };

    let argv = build_argv(cmd, &config.sync_dns_servers, challenges);
    tracing::info!(cmd = %cmd, "invoking DNS-01 zone-update command");

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let run = async {
        let output = command.output().await?;
        Ok::<_, std::io::Error>(output)
    };

    match timeout(config.zone_update_cmd_timeout, run).await {
        Ok(Ok(output)) if output.status.success() => true,
        Ok(Ok(output)) => {
            tracing::debug!(
                stdout = %String::from_utf8_lossy(&output.stdout),
                stderr = %String::from_utf8_lossy(&output.stderr),
                code = ?output.status.code(),
                "zone-update command exited non-zero"
            );
            false
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "failed to spawn zone-update command");
            false
        }
        Err(_) => {
            tracing::warn!(timeout = ?config.zone_update_cmd_timeout, "zone-update command timed out");
            false
        }
    }
}

/// Builds the argv: `[cmd, "--remote-servers", server..., "--", domain, value, ...]`.
///
/// The `--` terminator is mandatory: without it a challenge value that
/// happens to start with `-` would be parsed as a flag by the downstream
/// tool.
fn build_argv(cmd: &str, servers: &[String], challenges: &[Dns01Challenge]) -> Vec<String> {
    let mut argv = vec![cmd.to_string(), "--remote-servers".to_string()];
    argv.extend(servers.iter().cloned());
    argv.push("--".to_string());
    for challenge in challenges {
        argv.push(challenge.validation_domain.clone());
        argv.push(challenge.value.clone());
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_places_double_dash_before_domain_value_pairs() {
        let argv = build_argv(
            "/usr/bin/update-zone",
            &["127.0.0.1".to_string(), "127.0.0.2".to_string()],
            &[Dns01Challenge {
                validation_domain: "_acme-challenge.example.org".into(),
                value: "-looks-like-a-flag".into(),
            }],
        );
        assert_eq!(
            argv,
            vec![
                "/usr/bin/update-zone",
                "--remote-servers",
                "127.0.0.1",
                "127.0.0.2",
                "--",
                "_acme-challenge.example.org",
                "-looks-like-a-flag",
            ]
        );
    }

    #[tokio::test]
    async fn missing_zone_update_cmd_is_treated_as_success() {
        let config = Dns01Config {
            validation_dns_servers: vec![],
            sync_dns_servers: vec![],
            zone_update_cmd: None,
            zone_update_cmd_timeout: Duration::from_secs(1),
        };
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(dir.path());
        let ok = publish(&config, &paths, &[]).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_failure() {
        let config = Dns01Config {
            validation_dns_servers: vec![],
            sync_dns_servers: vec![],
            zone_update_cmd: Some("/bin/false".into()),
            zone_update_cmd_timeout: Duration::from_secs(5),
        };
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(dir.path());
        let ok = publish(
            &config,
            &paths,
            &[Dns01Challenge {
                validation_domain: "_acme-challenge.example.org".into(),
                value: "abc".into(),
            }],
        )
        .await;
        assert!(!ok);
    }
}
