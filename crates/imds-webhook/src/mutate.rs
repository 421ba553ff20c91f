//! Injection predicate and JSON patch construction.
//!
//! A pod is mutated only when it is a VM launcher pod whose owner opted in
//! via annotation and that has not been injected before. The patch is a
//! sequence of ADD operations; paths are built with [`jsonptr::Pointer`],
//! which applies RFC 6901 escaping to annotation keys containing `/`.

use json_patch::{AddOperation, PatchOperation};
use jsonptr::Pointer;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod,
    ProjectedVolumeSource, SecurityContext, ServiceAccountTokenProjection, Volume, VolumeMount,
    VolumeProjection,
};
use serde_json::Value;

/// Annotation that opts a VM's launcher pod into IMDS injection. Only the
/// literal string `"true"` enables it.
pub const ANNOTATION_ENABLED: &str = "imds.kubevirt.io/enabled";

/// Annotation overriding VM bridge auto-discovery.
pub const ANNOTATION_BRIDGE_NAME: &str = "imds.kubevirt.io/bridge-name";

/// Annotation carrying the cloud-init user-data payload.
pub const ANNOTATION_USER_DATA: &str = "imds.kubevirt.io/user-data";

/// Marker annotation written by the mutator; its presence blocks re-injection.
pub const ANNOTATION_INJECTED: &str = "imds.kubevirt.io/injected";

/// Launcher pod label carrying the VM name.
pub const LABEL_VM_DOMAIN: &str = "kubevirt.io/domain";

/// Newer launcher pod label carrying the VM name.
pub const LABEL_VM_NAME: &str = "vm.kubevirt.io/name";

/// Name of the injected sidecar container.
pub const CONTAINER_NAME: &str = "imds-server";

/// Name of the injected projected-token volume.
pub const TOKEN_VOLUME_NAME: &str = "imds-token";

/// Mount point of the token volume inside the sidecar.
pub const TOKEN_MOUNT_PATH: &str = "/var/run/secrets/tokens";

/// Token path handed to the sidecar.
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/tokens/token";

const TOKEN_EXPIRATION_SECONDS: i64 = 3600;

/// Errors raised during patch construction.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The pod carries no VM launcher label to take the VM name from
    #[error("pod has no VM launcher label ({LABEL_VM_DOMAIN} or {LABEL_VM_NAME})")]
    MissingVmLabel,

    /// Patch value serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Webhook configuration.
#[derive(Debug, Clone)]
pub struct MutatorConfig {
    /// Sidecar image reference.
    pub image: String,
    /// Pull policy for the sidecar image.
    pub image_pull_policy: String,
}

impl MutatorConfig {
    /// Config with the default `IfNotPresent` pull policy.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            image_pull_policy: "IfNotPresent".to_string(),
        }
    }
}

/// Decides which pods get the sidecar and produces the JSON patch.
pub struct Mutator {
    config: MutatorConfig,
}

impl Mutator {
    /// Create a mutator with the given configuration.
    pub fn new(config: MutatorConfig) -> Self {
        Self { config }
    }

    /// Whether the pod should be injected.
    ///
    /// All of: opted in (`enabled` annotation is the literal `"true"`), not
    /// injected before (marker annotation absent, whatever its value), and a
    /// VM launcher pod (carries one of the VM-name labels).
    pub fn should_mutate(&self, pod: &Pod) -> bool {
        let Some(annotations) = pod.metadata.annotations.as_ref() else {
            return false;
        };
        if annotations.get(ANNOTATION_ENABLED).map(String::as_str) != Some("true") {
            return false;
        }
        if annotations.contains_key(ANNOTATION_INJECTED) {
            return false;
        }
        vm_name(pod).is_some()
    }

    /// Build the ordered patch: token volume, sidecar container, marker
    /// annotation.
    pub fn mutate(&self, pod: &Pod) -> Result<Vec<PatchOperation>, WebhookError> {
        let vm_name = vm_name(pod).ok_or(WebhookError::MissingVmLabel)?;
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();

        let annotations = pod.metadata.annotations.as_ref();
        let bridge_name = annotations.and_then(|a| a.get(ANNOTATION_BRIDGE_NAME)).cloned();
        let user_data = annotations.and_then(|a| a.get(ANNOTATION_USER_DATA)).cloned();

        let container = self.server_container(&namespace, vm_name, bridge_name, user_data);

        let mut ops = Vec::with_capacity(3);
        ops.push(add_volume_op(pod, token_volume())?);
        ops.push(PatchOperation::Add(AddOperation {
            path: Pointer::new(["spec", "containers", "-"]),
            value: serde_json::to_value(&container)?,
        }));
        ops.push(add_annotation_op(pod, ANNOTATION_INJECTED, "true"));
        Ok(ops)
    }

    /// The IMDS sidecar container.
    ///
    /// Runs the combined `run` mode (bridge wait + fabric + serve): the VM
    /// bridge is created by the launcher's compute container, which starts
    /// after init containers, so a true init container cannot do the fabric
    /// work.
    fn server_container(
        &self,
        namespace: &str,
        vm_name: &str,
        bridge_name: Option<String>,
        user_data: Option<String>,
    ) -> Container {
        let mut env = vec![
            env_value("IMDS_TOKEN_PATH", DEFAULT_TOKEN_PATH),
            env_value("IMDS_NAMESPACE", namespace),
            env_value("IMDS_VM_NAME", vm_name),
            EnvVar {
                name: "IMDS_SA_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.serviceAccountName".to_string(),
                        api_version: None,
                    }),
                    ..Default::default()
                }),
                value: None,
            },
        ];
        if let Some(bridge_name) = bridge_name {
            env.push(env_value("IMDS_BRIDGE_NAME", &bridge_name));
        }
        if let Some(user_data) = user_data {
            env.push(env_value("IMDS_USER_DATA", &user_data));
        }

        // Launcher pods enforce runAsNonRoot with a fixed uid, but creating
        // veth pairs under NET_ADMIN requires root; override at the container
        // level.
        let security_context = SecurityContext {
            run_as_non_root: Some(false),
            run_as_user: Some(0),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                drop: None,
            }),
            ..Default::default()
        };

        Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.config.image.clone()),
            image_pull_policy: Some(self.config.image_pull_policy.clone()),
            command: Some(vec!["/imds-server".to_string(), "run".to_string()]),
            env: Some(env),
            security_context: Some(security_context),
            volume_mounts: Some(vec![VolumeMount {
                name: TOKEN_VOLUME_NAME.to_string(),
                mount_path: TOKEN_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }
}

/// The VM name from the launcher labels, preferring the classic label.
pub fn vm_name(pod: &Pod) -> Option<&str> {
    let labels = pod.metadata.labels.as_ref()?;
    labels
        .get(LABEL_VM_DOMAIN)
        .or_else(|| labels.get(LABEL_VM_NAME))
        .map(String::as_str)
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn token_volume() -> Volume {
    Volume {
        name: TOKEN_VOLUME_NAME.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![VolumeProjection {
                service_account_token: Some(ServiceAccountTokenProjection {
                    path: "token".to_string(),
                    expiration_seconds: Some(TOKEN_EXPIRATION_SECONDS),
                    audience: None,
                }),
                ..Default::default()
            }]),
            default_mode: None,
        }),
        ..Default::default()
    }
}

/// ADD the volume, creating `/spec/volumes` when the pod has none yet.
fn add_volume_op(pod: &Pod, volume: Volume) -> Result<PatchOperation, WebhookError> {
    let has_volumes = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| !volumes.is_empty())
        .unwrap_or(false);

    let op = if has_volumes {
        AddOperation {
            path: Pointer::new(["spec", "volumes", "-"]),
            value: serde_json::to_value(&volume)?,
        }
    } else {
        AddOperation {
            path: Pointer::new(["spec", "volumes"]),
            value: serde_json::to_value(vec![volume])?,
        }
    };
    Ok(PatchOperation::Add(op))
}

/// ADD the annotation, creating the map when the pod has none. The key
/// segment is escaped per RFC 6901 by the pointer builder.
fn add_annotation_op(pod: &Pod, key: &str, value: &str) -> PatchOperation {
    let has_annotations = pod
        .metadata
        .annotations
        .as_ref()
        .map(|annotations| !annotations.is_empty())
        .unwrap_or(false);

    if has_annotations {
        PatchOperation::Add(AddOperation {
            path: Pointer::new(["metadata", "annotations", key]),
            value: Value::String(value.to_string()),
        })
    } else {
        PatchOperation::Add(AddOperation {
            path: Pointer::new(["metadata", "annotations"]),
            value: serde_json::json!({ key: value }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn test_mutator() -> Mutator {
        Mutator::new(MutatorConfig::new("registry.example.com/imds-server:v0.2.0"))
    }

    fn launcher_pod() -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_ENABLED.to_string(), "true".to_string());
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_VM_DOMAIN.to_string(), "testvm".to_string());

        Pod {
            metadata: ObjectMeta {
                name: Some("virt-launcher-testvm-abcde".to_string()),
                namespace: Some("kubevirt".to_string()),
                annotations: Some(annotations),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "compute".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn op_path(op: &PatchOperation) -> String {
        match op {
            PatchOperation::Add(add) => add.path.to_string(),
            other => panic!("expected add operation, got {other:?}"),
        }
    }

    fn op_value(op: &PatchOperation) -> &Value {
        match op {
            PatchOperation::Add(add) => &add.value,
            other => panic!("expected add operation, got {other:?}"),
        }
    }

    // ==========================================================================
    // Predicate
    // ==========================================================================

    #[test]
    fn opted_in_launcher_pod_is_mutated() {
        assert!(test_mutator().should_mutate(&launcher_pod()));
    }

    #[test]
    fn enabled_must_be_the_literal_true() {
        for value in ["yes", "1", "True", ""] {
            let mut pod = launcher_pod();
            pod.metadata
                .annotations
                .as_mut()
                .unwrap()
                .insert(ANNOTATION_ENABLED.to_string(), value.to_string());
            assert!(
                !test_mutator().should_mutate(&pod),
                "value {value:?} should not opt in"
            );
        }
    }

    #[test]
    fn pod_without_annotations_is_skipped() {
        let mut pod = launcher_pod();
        pod.metadata.annotations = None;
        assert!(!test_mutator().should_mutate(&pod));
    }

    #[test]
    fn injected_marker_blocks_reinjection() {
        for value in ["true", "false", ""] {
            let mut pod = launcher_pod();
            pod.metadata
                .annotations
                .as_mut()
                .unwrap()
                .insert(ANNOTATION_INJECTED.to_string(), value.to_string());
            assert!(
                !test_mutator().should_mutate(&pod),
                "marker {value:?} should block injection"
            );
        }
    }

    #[test]
    fn non_launcher_pod_is_skipped() {
        let mut pod = launcher_pod();
        pod.metadata.labels = None;
        assert!(!test_mutator().should_mutate(&pod));

        let mut pod = launcher_pod();
        pod.metadata.labels = Some(BTreeMap::from([(
            "app".to_string(),
            "not-a-vm".to_string(),
        )]));
        assert!(!test_mutator().should_mutate(&pod));
    }

    #[test]
    fn newer_vm_name_label_is_accepted() {
        let mut pod = launcher_pod();
        pod.metadata.labels = Some(BTreeMap::from([(
            LABEL_VM_NAME.to_string(),
            "newvm".to_string(),
        )]));
        assert!(test_mutator().should_mutate(&pod));
        assert_eq!(vm_name(&pod), Some("newvm"));
    }

    // ==========================================================================
    // Patch construction
    // ==========================================================================

    #[test]
    fn patch_has_volume_container_and_marker_in_order() {
        let ops = test_mutator().mutate(&launcher_pod()).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(op_path(&ops[0]), "/spec/volumes");
        assert_eq!(op_path(&ops[1]), "/spec/containers/-");
        assert_eq!(
            op_path(&ops[2]),
            "/metadata/annotations/imds.kubevirt.io~1injected"
        );
    }

    #[test]
    fn existing_volumes_are_appended_to() {
        let mut pod = launcher_pod();
        pod.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "private".to_string(),
            ..Default::default()
        }]);

        let ops = test_mutator().mutate(&pod).unwrap();
        assert_eq!(op_path(&ops[0]), "/spec/volumes/-");
        assert_eq!(op_value(&ops[0])["name"], "imds-token");
    }

    #[test]
    fn missing_volumes_array_is_created() {
        let ops = test_mutator().mutate(&launcher_pod()).unwrap();
        let value = op_value(&ops[0]);
        assert!(value.is_array());
        assert_eq!(value[0]["name"], "imds-token");
        let projection = &value[0]["projected"]["sources"][0]["serviceAccountToken"];
        assert_eq!(projection["path"], "token");
        assert_eq!(projection["expirationSeconds"], 3600);
    }

    #[test]
    fn annotation_key_escaping_round_trips() {
        let ops = test_mutator().mutate(&launcher_pod()).unwrap();
        let PatchOperation::Add(add) = &ops[2] else {
            panic!("expected add");
        };
        // Unescaping the emitted segment must yield the key exactly.
        let token = add.path.last().unwrap();
        assert_eq!(token.decoded(), ANNOTATION_INJECTED);
        assert_eq!(add.value, Value::String("true".to_string()));
    }

    #[test]
    fn sidecar_container_shape() {
        let ops = test_mutator().mutate(&launcher_pod()).unwrap();
        let container = op_value(&ops[1]);

        assert_eq!(container["name"], "imds-server");
        assert_eq!(container["image"], "registry.example.com/imds-server:v0.2.0");
        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
        assert_eq!(
            container["command"],
            serde_json::json!(["/imds-server", "run"])
        );

        let sc = &container["securityContext"];
        assert_eq!(sc["runAsNonRoot"], false);
        assert_eq!(sc["runAsUser"], 0);
        assert_eq!(sc["capabilities"]["add"], serde_json::json!(["NET_ADMIN"]));

        let mounts = container["volumeMounts"].as_array().unwrap();
        assert_eq!(mounts[0]["name"], "imds-token");
        assert_eq!(mounts[0]["mountPath"], "/var/run/secrets/tokens");
        assert_eq!(mounts[0]["readOnly"], true);
    }

    #[test]
    fn sidecar_env_carries_identity_and_downward_api() {
        let ops = test_mutator().mutate(&launcher_pod()).unwrap();
        let env = op_value(&ops[1])["env"].as_array().unwrap().clone();

        let lookup = |name: &str| {
            env.iter()
                .find(|e| e["name"] == name)
                .unwrap_or_else(|| panic!("missing env {name}"))
                .clone()
        };

        assert_eq!(lookup("IMDS_TOKEN_PATH")["value"], DEFAULT_TOKEN_PATH);
        assert_eq!(lookup("IMDS_NAMESPACE")["value"], "kubevirt");
        assert_eq!(lookup("IMDS_VM_NAME")["value"], "testvm");
        assert_eq!(
            lookup("IMDS_SA_NAME")["valueFrom"]["fieldRef"]["fieldPath"],
            "spec.serviceAccountName"
        );
        assert!(env.iter().all(|e| e["name"] != "IMDS_BRIDGE_NAME"));
        assert!(env.iter().all(|e| e["name"] != "IMDS_USER_DATA"));
    }

    #[test]
    fn bridge_and_user_data_annotations_are_plumbed() {
        let mut pod = launcher_pod();
        let annotations = pod.metadata.annotations.as_mut().unwrap();
        annotations.insert(ANNOTATION_BRIDGE_NAME.to_string(), "k6t-net1".to_string());
        annotations.insert(
            ANNOTATION_USER_DATA.to_string(),
            "#cloud-config\n".to_string(),
        );

        let ops = test_mutator().mutate(&pod).unwrap();
        let env = op_value(&ops[1])["env"].as_array().unwrap().clone();

        let bridge = env.iter().find(|e| e["name"] == "IMDS_BRIDGE_NAME").unwrap();
        assert_eq!(bridge["value"], "k6t-net1");
        let user_data = env.iter().find(|e| e["name"] == "IMDS_USER_DATA").unwrap();
        assert_eq!(user_data["value"], "#cloud-config\n");
    }

    // ==========================================================================
    // Story tests
    // ==========================================================================

    /// Story: applying the generated patch to the pod produces a pod the
    /// predicate refuses to mutate again. That closes the idempotency loop:
    /// webhook output fed back through admission is a no-op.
    #[test]
    fn story_applying_patch_makes_predicate_false() {
        let mutator = test_mutator();
        let pod = launcher_pod();

        let ops = mutator.mutate(&pod).unwrap();
        let mut doc = serde_json::to_value(&pod).unwrap();
        json_patch::patch(&mut doc, &json_patch::Patch(ops)).expect("patch applies cleanly");

        let mutated: Pod = serde_json::from_value(doc).unwrap();
        assert!(!mutator.should_mutate(&mutated));

        // And the pod actually gained the sidecar pieces.
        let spec = mutated.spec.unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[1].name, "imds-server");
        assert_eq!(spec.volumes.unwrap()[0].name, "imds-token");
        assert_eq!(
            mutated.metadata.annotations.unwrap().get(ANNOTATION_INJECTED),
            Some(&"true".to_string())
        );
    }

    /// Story: the patch survives serialization as the JSON array the API
    /// server expects.
    #[test]
    fn story_patch_serializes_to_json_array() {
        let ops = test_mutator().mutate(&launcher_pod()).unwrap();
        let serialized = serde_json::to_string(&json_patch::Patch(ops)).unwrap();
        let parsed: Value = serde_json::from_str(&serialized).unwrap();

        let array = parsed.as_array().expect("patch is a JSON array");
        assert_eq!(array.len(), 3);
        for op in array {
            assert_eq!(op["op"], "add");
            assert!(op["path"].as_str().unwrap().starts_with('/'));
        }
    }
}
