//! Endpoint handlers and response types.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::jwt;
use crate::server::ImdsState;

/// Body of `GET /v1/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    /// The projected service account token, verbatim (trimmed).
    pub token: String,
    /// Expiry extracted from the token when it parses as a JWT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_timestamp: Option<DateTime<Utc>>,
}

/// Body of `GET /v1/identity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityResponse {
    /// Kubernetes namespace of the VM.
    pub namespace: String,
    /// ServiceAccount the token belongs to.
    pub service_account_name: String,
    /// VirtualMachine name.
    pub vm_name: String,
}

/// Body of `GET /openstack/latest/meta_data.json`, the minimal subset
/// cloudbase-init needs on Windows guests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenStackMetaData {
    /// Cluster-wide unique instance id.
    pub uuid: String,
    /// Guest hostname.
    pub hostname: String,
    /// Instance name.
    pub name: String,
}

/// Error body shared by every non-2xx JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub error: String,
    /// Human-readable explanation.
    pub message: String,
}

/// Build a JSON error response.
pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: code.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// `GET /healthz`
pub(crate) async fn healthz() -> &'static str {
    "OK"
}

/// `GET /v1/token`
///
/// The token file is read on every request so the externally rotated
/// credential is always current. Projected-volume semantics guarantee the
/// read observes either the old or the new content, never a torn file.
pub(crate) async fn token(State(state): State<Arc<ImdsState>>) -> Response {
    let raw = match tokio::fs::read_to_string(&state.config.token_path).await {
        Ok(raw) => raw,
        Err(err) => {
            error!(
                path = %state.config.token_path.display(),
                error = %err,
                "failed to read service account token"
            );
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "token_unavailable",
                "failed to read the projected service account token",
            );
        }
    };

    let token = raw.trim().to_string();
    let expiration_timestamp = jwt::token_expiration(&token);
    Json(TokenResponse {
        token,
        expiration_timestamp,
    })
    .into_response()
}

/// `GET /v1/identity`
pub(crate) async fn identity(State(state): State<Arc<ImdsState>>) -> Json<IdentityResponse> {
    let id = &state.config.identity;
    Json(IdentityResponse {
        namespace: id.namespace.clone(),
        service_account_name: id.service_account_name.clone(),
        vm_name: id.vm_name.clone(),
    })
}

/// `GET /v1/meta-data` (cloud-init NoCloud datasource)
///
/// `instance-id` is `<namespace>-<vmName>` so a VM rescheduled into another
/// namespace is seen by cloud-init as a fresh instance.
pub(crate) async fn meta_data(State(state): State<Arc<ImdsState>>) -> String {
    let id = &state.config.identity;
    format!(
        "instance-id: {}-{}\nlocal-hostname: {}\n",
        id.namespace, id.vm_name, id.vm_name
    )
}

/// `GET /v1/user-data` (cloud-init NoCloud datasource)
pub(crate) async fn user_data(State(state): State<Arc<ImdsState>>) -> Response {
    match &state.config.user_data {
        Some(data) if !data.is_empty() => data.clone().into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /v1/network-config` (cloud-init NoCloud datasource)
///
/// Always 404 so cloud-init falls back to DHCP.
pub(crate) async fn network_config() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// `GET /openstack/latest/meta_data.json`
pub(crate) async fn openstack_meta_data(
    State(state): State<Arc<ImdsState>>,
) -> Json<OpenStackMetaData> {
    let id = &state.config.identity;
    Json(OpenStackMetaData {
        uuid: format!("{}-{}", id.namespace, id.vm_name),
        hostname: id.vm_name.clone(),
        name: id.vm_name.clone(),
    })
}
