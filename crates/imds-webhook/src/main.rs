//! Admission webhook entrypoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use imds_webhook::{webhook_router, Mutator, MutatorConfig, WebhookState};

/// Drain budget for in-flight admission requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Mutating admission webhook injecting the IMDS sidecar into VM launcher pods
#[derive(Parser, Debug)]
#[command(name = "imds-webhook", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen_addr: SocketAddr,

    /// Path to the TLS certificate
    #[arg(long, default_value = "/etc/webhook/certs/tls.crt")]
    cert_file: PathBuf,

    /// Path to the TLS key
    #[arg(long, default_value = "/etc/webhook/certs/tls.key")]
    key_file: PathBuf,

    /// IMDS sidecar image to inject
    #[arg(long, env = "IMDS_IMAGE")]
    imds_image: String,

    /// Pull policy for the sidecar image
    #[arg(long, default_value = "IfNotPresent")]
    image_pull_policy: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mutator = Mutator::new(MutatorConfig {
        image: cli.imds_image,
        image_pull_policy: cli.image_pull_policy,
    });
    let router = webhook_router(Arc::new(WebhookState::new(mutator)));

    let tls_config = RustlsConfig::from_pem_file(&cli.cert_file, &cli.key_file)
        .await
        .with_context(|| {
            format!(
                "failed to load TLS material from {} / {}",
                cli.cert_file.display(),
                cli.key_file.display()
            )
        })?;

    let handle = Handle::new();
    spawn_signal_handler(handle.clone());

    info!(addr = %cli.listen_addr, "webhook server listening");
    axum_server::bind_rustls(cli.listen_addr, tls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .context("webhook server failed")
}

/// Convert SIGINT/SIGTERM into a graceful server shutdown.
fn spawn_signal_handler(handle: Handle) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                handle.shutdown();
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(error = %err, "failed to install SIGINT handler");
                handle.shutdown();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });
}
