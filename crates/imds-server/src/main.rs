//! IMDS sidecar entrypoint.
//!
//! Three commands mirror the sidecar lifecycle:
//!
//! - `init` - one-shot fabric setup (veth + metadata address), then exit
//! - `serve` - HTTP server only, assuming the fabric already exists
//! - `run` - the injected sidecar mode: poll for the VM bridge, ensure the
//!   fabric, start the ARP responder and the HTTP server together
//!
//! `run` exists because the bridge is created by the launcher's compute
//! container, which starts after init containers; fabric setup cannot run as
//! a true init container.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use imds_fabric::arp::ArpResponder;
use imds_fabric::bridge::{self, BRIDGE_POLL_INTERVAL, BRIDGE_WAIT_TIMEOUT};
use imds_fabric::veth;
use imds_server::config::{DEFAULT_LISTEN_ADDR, DEFAULT_TOKEN_PATH};
use imds_server::{ImdsConfig, ImdsServer, VmIdentity};

/// How long `run` waits for its companion tasks to wind down after the
/// first of them finishes.
const TASK_STOP_GRACE: Duration = Duration::from_secs(6);

/// Per-VM instance metadata service sidecar
#[derive(Parser, Debug)]
#[command(name = "imds-server", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set up the veth pair and attach it to the VM bridge, then exit
    Init(FabricArgs),

    /// Start the IMDS HTTP server (the fabric must already exist)
    Serve(ServeArgs),

    /// Wait for the bridge, ensure the fabric, then serve (sidecar mode)
    Run(RunArgs),
}

/// Fabric configuration
#[derive(Args, Debug)]
struct FabricArgs {
    /// VM bridge name; auto-discovered (unique k6t-*) when unset
    #[arg(long, env = "IMDS_BRIDGE_NAME")]
    bridge_name: Option<String>,
}

/// Server configuration
#[derive(Args, Debug)]
struct ServeArgs {
    /// Kubernetes namespace of the VM
    #[arg(long, env = "IMDS_NAMESPACE")]
    namespace: String,

    /// VirtualMachine name
    #[arg(long, env = "IMDS_VM_NAME")]
    vm_name: String,

    /// ServiceAccount the projected token belongs to
    #[arg(long, env = "IMDS_SA_NAME")]
    service_account_name: String,

    /// Path of the projected service account token
    #[arg(long, env = "IMDS_TOKEN_PATH", default_value = DEFAULT_TOKEN_PATH)]
    token_path: PathBuf,

    /// Address the metadata server binds to
    #[arg(long, env = "IMDS_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: SocketAddr,

    /// Cloud-init user-data served on /v1/user-data
    #[arg(long, env = "IMDS_USER_DATA")]
    user_data: Option<String>,
}

/// Combined sidecar mode arguments
#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    fabric: FabricArgs,

    #[command(flatten)]
    serve: ServeArgs,
}

impl ServeArgs {
    fn into_config(self) -> ImdsConfig {
        ImdsConfig {
            identity: VmIdentity {
                namespace: self.namespace,
                vm_name: self.vm_name,
                service_account_name: self.service_account_name,
            },
            token_path: self.token_path,
            user_data: self.user_data.filter(|data| !data.is_empty()),
            listen_addr: self.listen_addr,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => run_init(args).await,
        Commands::Serve(args) => run_serve(args).await,
        Commands::Run(args) => run_combined(args).await,
    }
}

/// One-shot fabric setup against an already-present bridge.
async fn run_init(args: FabricArgs) -> anyhow::Result<()> {
    let handle = netlink_handle()?;

    let bridge = match args.bridge_name.as_deref() {
        Some(name) => {
            info!(bridge = name, "using configured bridge");
            bridge::get_bridge(&handle, name).await?
        }
        None => {
            let bridge = bridge::discover_bridge(&handle).await?;
            info!(bridge = %bridge.name, "auto-detected bridge");
            bridge
        }
    };

    let fabric = veth::ensure_veth(&handle, &bridge).await?;
    info!(
        bridge = %fabric.bridge.name,
        mac = %fabric.imds_mac,
        "fabric ready, IMDS reachable at {}",
        imds_fabric::IMDS_ADDRESS
    );
    Ok(())
}

/// HTTP server only.
async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    ImdsServer::new(args.into_config())
        .run(shutdown)
        .await
        .context("IMDS server failed")
}

/// Sidecar mode: bridge poll, fabric ensure, ARP responder + HTTP server.
async fn run_combined(args: RunArgs) -> anyhow::Result<()> {
    info!("starting IMDS sidecar, waiting for VM bridge");

    let handle = netlink_handle()?;
    let bridge = bridge::resolve_bridge(
        &handle,
        args.fabric.bridge_name.as_deref(),
        BRIDGE_POLL_INTERVAL,
        BRIDGE_WAIT_TIMEOUT,
    )
    .await?;

    let fabric = veth::ensure_veth(&handle, &bridge).await?;
    let vm_mac = veth::discover_vm_mac(&handle, &bridge).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let responder = Arc::new(ArpResponder::new(bridge, fabric.imds_mac, Some(vm_mac)));
    let mut arp_task = tokio::task::spawn_blocking({
        let responder = Arc::clone(&responder);
        let token = shutdown.clone();
        move || responder.run(&token)
    });

    let server = ImdsServer::new(args.serve.into_config());
    let mut server_task = tokio::spawn(server.run(shutdown.clone()));

    // Whichever task finishes first decides the outcome; the other one gets
    // cancelled and a grace period to wind down.
    tokio::select! {
        result = &mut server_task => {
            shutdown.cancel();
            responder.stop();
            let _ = tokio::time::timeout(TASK_STOP_GRACE, &mut arp_task).await;
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(anyhow::Error::from(err).context("IMDS server failed")),
                Err(err) => Err(anyhow::Error::from(err).context("IMDS server task failed")),
            }
        }
        result = &mut arp_task => {
            shutdown.cancel();
            responder.stop();
            let _ = tokio::time::timeout(TASK_STOP_GRACE, &mut server_task).await;
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!(error = %err, "ARP responder failed");
                    Err(anyhow::Error::from(err).context("ARP responder failed"))
                }
                Err(err) => Err(anyhow::Error::from(err).context("ARP responder task failed")),
            }
        }
    }
}

/// Open the shared rtnetlink handle and drive its connection task.
fn netlink_handle() -> anyhow::Result<rtnetlink::Handle> {
    let (connection, handle, _) =
        rtnetlink::new_connection().context("failed to open netlink socket")?;
    tokio::spawn(connection);
    Ok(handle)
}

/// Convert SIGINT/SIGTERM into root-context cancellation.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                shutdown.cancel();
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(error = %err, "failed to install SIGINT handler");
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        shutdown.cancel();
    });
}
