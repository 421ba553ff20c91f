//! Admission HTTP endpoint.
//!
//! Receives `AdmissionReview` requests for pods, applies the injection
//! predicate, and answers with a JSON patch (or a plain allow for pods that
//! are none of our business). Decode failures deny the admission with the
//! error in the status message so the API server surfaces it.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, error, info};

use crate::mutate::Mutator;

/// Shared state for admission handlers.
pub struct WebhookState {
    /// The configured pod mutator.
    pub mutator: Mutator,
}

impl WebhookState {
    /// Create webhook state around a mutator.
    pub fn new(mutator: Mutator) -> Self {
        Self { mutator }
    }
}

/// Build the webhook router: `POST /mutate` plus a health probe.
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

/// Handle a mutating admission review for pods.
async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(err) => {
            error!(error = %err, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let response = mutate_pod(&state, &request);
    Json(response.into_review())
}

/// Process a single pod admission request.
fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = request.uid.clone();

    // Anything that is not a pod passes through untouched.
    if request.kind.kind != "Pod" {
        debug!(uid = %uid, kind = %request.kind.kind, "not a pod, allowing unchanged");
        return AdmissionResponse::from(request);
    }

    let Some(object) = &request.object else {
        debug!(uid = %uid, "no object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let pod: Pod = match serde_json::to_value(object).and_then(serde_json::from_value) {
        Ok(pod) => pod,
        Err(err) => {
            error!(uid = %uid, error = %err, "failed to decode pod");
            return AdmissionResponse::from(request).deny(format!("failed to decode pod: {err}"));
        }
    };

    if !state.mutator.should_mutate(&pod) {
        debug!(
            uid = %uid,
            pod = ?pod.metadata.name,
            "pod does not need IMDS injection"
        );
        return AdmissionResponse::from(request);
    }

    info!(
        uid = %uid,
        namespace = ?pod.metadata.namespace,
        pod = ?pod.metadata.name,
        "injecting IMDS sidecar"
    );

    let ops = match state.mutator.mutate(&pod) {
        Ok(ops) => ops,
        Err(err) => {
            error!(uid = %uid, error = %err, "failed to build patch");
            return AdmissionResponse::from(request).deny(format!("failed to mutate pod: {err}"));
        }
    };

    match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
        Ok(response) => response,
        Err(err) => {
            error!(uid = %uid, error = %err, "failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutate::{MutatorConfig, ANNOTATION_ENABLED, ANNOTATION_INJECTED, LABEL_VM_DOMAIN};

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_router() -> Router {
        webhook_router(Arc::new(WebhookState::new(Mutator::new(
            MutatorConfig::new("registry.example.com/imds-server:v0.2.0"),
        ))))
    }

    fn launcher_pod_json() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "virt-launcher-testvm-abcde",
                "namespace": "kubevirt",
                "annotations": { ANNOTATION_ENABLED: "true" },
                "labels": { LABEL_VM_DOMAIN: "testvm" }
            },
            "spec": {
                "containers": [ { "name": "compute", "image": "virt-launcher" } ]
            }
        })
    }

    fn admission_review(kind: &str, object: Value) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "", "version": "v1", "kind": kind },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "operation": "CREATE",
                "userInfo": { "username": "system:serviceaccount:kubevirt:virt-controller" },
                "object": object
            }
        })
    }

    async fn post_review(review: Value) -> Value {
        let request = Request::builder()
            .method("POST")
            .uri("/mutate")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&review).unwrap()))
            .unwrap();

        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_works() {
        let request = Request::builder()
            .method("GET")
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn opted_in_pod_gets_a_patch() {
        let review = post_review(admission_review("Pod", launcher_pod_json())).await;
        let response = &review["response"];

        assert_eq!(response["allowed"], true);
        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response["patchType"], "JSONPatch");

        let patch_bytes = STANDARD
            .decode(response["patch"].as_str().expect("patch present"))
            .unwrap();
        let ops: Value = serde_json::from_slice(&patch_bytes).unwrap();
        let ops = ops.as_array().unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0]["path"], "/spec/volumes");
        assert_eq!(ops[1]["path"], "/spec/containers/-");
        assert_eq!(
            ops[2]["path"],
            "/metadata/annotations/imds.kubevirt.io~1injected"
        );
    }

    #[tokio::test]
    async fn non_pod_kind_is_allowed_without_patch() {
        let review = post_review(admission_review(
            "Deployment",
            json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "x" } }),
        ))
        .await;
        let response = &review["response"];

        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").is_none() || response["patch"].is_null());
    }

    #[tokio::test]
    async fn pod_without_opt_in_is_allowed_without_patch() {
        let mut pod = launcher_pod_json();
        pod["metadata"]["annotations"] = json!({});

        let review = post_review(admission_review("Pod", pod)).await;
        let response = &review["response"];

        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").is_none() || response["patch"].is_null());
    }

    #[tokio::test]
    async fn malformed_pod_is_denied_with_message() {
        let mut pod = launcher_pod_json();
        // A spec that cannot deserialize into a PodSpec.
        pod["spec"] = json!({ "containers": "not-an-array" });

        let review = post_review(admission_review("Pod", pod)).await;
        let response = &review["response"];

        assert_eq!(response["allowed"], false);
        let message = response["status"]["message"].as_str().unwrap();
        assert!(message.contains("failed to decode pod"), "got: {message}");
    }

    /// Story: the webhook's own output is idempotent through admission. A
    /// pod already carrying the injected marker is allowed with no patch, so
    /// retried admission never doubles the sidecar.
    #[tokio::test]
    async fn story_already_injected_pod_passes_through() {
        let mut pod = launcher_pod_json();
        pod["metadata"]["annotations"][ANNOTATION_INJECTED] = json!("true");

        let review = post_review(admission_review("Pod", pod)).await;
        let response = &review["response"];

        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").is_none() || response["patch"].is_null());
    }
}
