//! Server configuration and the VM identity record.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Default path of the projected service account token.
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/tokens/token";

/// Default listen address: the link-local metadata endpoint.
pub const DEFAULT_LISTEN_ADDR: &str = "169.254.169.254:80";

/// Identity of the VM this sidecar serves. Immutable after startup; sourced
/// from the launcher pod's environment at injection time.
#[derive(Debug, Clone)]
pub struct VmIdentity {
    /// Kubernetes namespace of the VM.
    pub namespace: String,
    /// VirtualMachine name.
    pub vm_name: String,
    /// ServiceAccount the projected token belongs to.
    pub service_account_name: String,
}

/// Full configuration of the metadata server.
#[derive(Debug, Clone)]
pub struct ImdsConfig {
    /// The served identity record.
    pub identity: VmIdentity,
    /// Path of the projected token, re-read on every request so external
    /// rotation is picked up without a restart.
    pub token_path: PathBuf,
    /// Cloud-init user-data; `/v1/user-data` answers 404 when absent.
    pub user_data: Option<String>,
    /// Address the server binds to.
    pub listen_addr: SocketAddr,
}
