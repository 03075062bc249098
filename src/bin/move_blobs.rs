//! move-blobs
//!
//! Moves every blob under one prefix of an Azure container to another
//! prefix using server side copies. Used to relocate registry content after
//! the storage root directory changes.

use anyhow::{bail, Context};
use clap::Parser;
use registry_storage_operator::controlplane::backends::azure::blob::{
    AzureBlobContainer, BlobAuth,
};
use registry_storage_operator::controlplane::backends::azure::AzureEnvironment;
use registry_storage_operator::controlplane::credentials::{AzureAuth, AzureIdentity};
use registry_storage_operator::migration::{BlobMigration, MigrationConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Move registry blobs between prefixes of one Azure container
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Storage account holding the container
    #[arg(long, env = "AZURE_STORAGE_ACCOUNT_NAME")]
    account_name: String,

    /// Container to migrate
    #[arg(long, env = "AZURE_CONTAINER_NAME")]
    container_name: String,

    #[arg(long, env = "AZURE_TENANT_ID", default_value = "")]
    tenant_id: String,

    #[arg(long, env = "AZURE_CLIENT_ID", default_value = "")]
    client_id: String,

    #[arg(long, env = "AZURE_CLIENT_SECRET", default_value = "", hide_env_values = true)]
    client_secret: String,

    /// Workload identity token file
    #[arg(long, env = "AZURE_FEDERATED_TOKEN_FILE", default_value = "")]
    federated_token_file: String,

    /// Shared account key, used when no identity is configured
    #[arg(long, env = "AZURE_ACCOUNTKEY", default_value = "", hide_env_values = true)]
    account_key: String,

    /// Cloud environment name, empty for the public cloud
    #[arg(long, env = "AZURE_ENVIRONMENT", default_value = "")]
    environment: String,

    /// Prefix to move blobs from
    #[arg(long, default_value = "docker")]
    source: String,

    /// Prefix to move blobs to
    #[arg(long, default_value = "/docker")]
    dest: String,

    /// Delay between copy state polls in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "100")]
    poll_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Client secret first, then a federated token, then the account key
    fn blob_auth(&self) -> anyhow::Result<BlobAuth> {
        let auth = if !self.client_secret.is_empty() {
            AzureAuth::ClientSecret(self.client_secret.clone())
        } else if !self.federated_token_file.is_empty() {
            AzureAuth::FederatedTokenFile(self.federated_token_file.clone())
        } else if !self.account_key.is_empty() {
            return Ok(BlobAuth::AccountKey(self.account_key.clone()));
        } else {
            bail!(
                "no credentials: set AZURE_CLIENT_SECRET, AZURE_FEDERATED_TOKEN_FILE \
                 or AZURE_ACCOUNTKEY"
            );
        };

        if self.tenant_id.is_empty() || self.client_id.is_empty() {
            bail!("AZURE_TENANT_ID and AZURE_CLIENT_ID are required for identity authentication");
        }
        Ok(BlobAuth::Identity(AzureIdentity {
            client_id: self.client_id.clone(),
            tenant_id: self.tenant_id.clone(),
            subscription_id: String::new(),
            resource_group: String::new(),
            region: String::new(),
            auth,
        }))
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting blob migration");
    info!("  Version: {}", registry_storage_operator::VERSION);
    info!("  Account: {}", args.account_name);
    info!("  Container: {}", args.container_name);
    info!("  Source prefix: {:?}", args.source);
    info!("  Destination prefix: {:?}", args.dest);

    let environment = AzureEnvironment::from_name(&args.environment)?;
    let auth = args.blob_auth()?;
    let container = AzureBlobContainer::new(
        &args.account_name,
        &args.container_name,
        auth,
        &environment,
    )
    .context("failed to build the blob client")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling migration");
            on_signal.cancel();
        }
    });

    let config = MigrationConfig {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        ..Default::default()
    };
    let report = BlobMigration::new(&container, config)
        .with_cancellation(cancel)
        .run(&args.source, &args.dest)
        .await
        .context("migration aborted")?;

    let moved = report.moved.len();
    match report.into_result() {
        Ok(_) => {
            info!("Moved {} blob(s)", moved);
            Ok(())
        }
        Err(e) => {
            error!("Moved {} blob(s), some failed: {}", moved, e);
            Err(e.into())
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "azure_core=info"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "move-blobs",
            "--account-name",
            "acct",
            "--container-name",
            "registry",
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_client_secret_wins_over_account_key() {
        let args = args(&[
            "--tenant-id",
            "t",
            "--client-id",
            "c",
            "--client-secret",
            "s",
            "--account-key",
            "k",
        ]);
        assert_matches!(
            args.blob_auth(),
            Ok(BlobAuth::Identity(AzureIdentity { auth: AzureAuth::ClientSecret(s), .. })) if s == "s"
        );
    }

    #[test]
    fn test_federated_token_then_account_key() {
        let federated = args(&[
            "--tenant-id",
            "t",
            "--client-id",
            "c",
            "--federated-token-file",
            "/var/run/token",
        ]);
        assert_matches!(
            federated.blob_auth(),
            Ok(BlobAuth::Identity(AzureIdentity { auth: AzureAuth::FederatedTokenFile(_), .. }))
        );

        let keyed = args(&["--account-key", "k"]);
        assert_matches!(keyed.blob_auth(), Ok(BlobAuth::AccountKey(k)) if k == "k");
    }

    #[test]
    fn test_identity_requires_tenant_and_client() {
        assert!(args(&["--client-secret", "s"]).blob_auth().is_err());
        assert!(args(&[]).blob_auth().is_err());
    }

    #[test]
    fn test_default_prefixes() {
        let args = args(&[]);
        assert_eq!(args.source, "docker");
        assert_eq!(args.dest, "/docker");
    }
}
