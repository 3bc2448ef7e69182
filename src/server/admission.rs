use axum::{body::Bytes, extract::State, http::header, response::IntoResponse};
use json_patch::{Patch, PatchOperation, ReplaceOperation};
use jsonptr::Pointer;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::server::error::ServerError;
use crate::server::registry::RegistryCatalog;
use crate::server::state::AppState;

#[derive(Debug, Error)]
pub enum MutateError {
    /// Malformed admission review envelope or embedded Pod object.
    #[error("failed to decode admission review: {0}")]
    Decode(#[source] serde_json::Error),
    /// The review did not carry an admission request.
    #[error("invalid admission review: {0}")]
    Request(#[source] kube::core::admission::ConvertAdmissionReviewError),
    #[error("failed to serialize patch: {0}")]
    Patch(String),
    #[error("failed to encode admission response: {0}")]
    Encode(#[source] serde_json::Error),
}

/// `POST /mutate` handler. The admission review body is parsed and answered
/// by [`mutate`]; any pipeline error surfaces as a 500 with the error text as
/// the response body.
pub async fn handle_mutate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ServerError> {
    let response = mutate(&body, &state.catalog)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], response))
}

/// Run one admission request through the rewrite pipeline.
///
/// Decodes the review envelope, walks the Pod's container collections in
/// fixed order (containers, initContainers, ephemeralContainers), collects a
/// JSON Patch replace operation for every image the catalog rewrites, and
/// encodes the response review. The response always allows the Pod; an image
/// whose registry is not configured is simply left unpatched.
pub fn mutate(body: &[u8], catalog: &RegistryCatalog) -> Result<Vec<u8>, MutateError> {
    let review: AdmissionReview<Pod> =
        serde_json::from_slice(body).map_err(MutateError::Decode)?;
    let request: AdmissionRequest<Pod> = review.try_into().map_err(MutateError::Request)?;

    let mut response = AdmissionResponse::from(&request);
    if let Some(pod) = &request.object {
        info!(
            namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod = pod_display_name(pod),
            "received mutation request"
        );
        let patch = build_image_patch(pod, catalog);
        response = response
            .with_patch(patch)
            .map_err(|err| MutateError::Patch(err.to_string()))?;
    }

    serde_json::to_vec(&response.into_review()).map_err(MutateError::Encode)
}

/// Build the ordered patch set for a Pod. Patch order follows container
/// array traversal order, which the API server applies positionally.
fn build_image_patch(pod: &Pod, catalog: &RegistryCatalog) -> Patch {
    let mut ops = Vec::new();
    let Some(spec) = &pod.spec else {
        return Patch(ops);
    };

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let pod_name = pod_display_name(pod);

    append_rewrites(
        &mut ops,
        spec.containers.iter().map(|c| c.image.as_deref()),
        "containers",
        catalog,
        namespace,
        pod_name,
    );
    if let Some(init_containers) = &spec.init_containers {
        append_rewrites(
            &mut ops,
            init_containers.iter().map(|c| c.image.as_deref()),
            "initContainers",
            catalog,
            namespace,
            pod_name,
        );
    }
    if let Some(ephemeral_containers) = &spec.ephemeral_containers {
        append_rewrites(
            &mut ops,
            ephemeral_containers.iter().map(|c| c.image.as_deref()),
            "ephemeralContainers",
            catalog,
            namespace,
            pod_name,
        );
    }

    Patch(ops)
}

fn append_rewrites<'a>(
    ops: &mut Vec<PatchOperation>,
    images: impl Iterator<Item = Option<&'a str>>,
    collection: &str,
    catalog: &RegistryCatalog,
    namespace: &str,
    pod_name: &str,
) {
    for (index, image) in images.enumerate() {
        let Some(image) = image else { continue };
        let Some(new_image) = catalog.rewrite(image) else {
            continue;
        };
        info!(
            namespace,
            pod = pod_name,
            original = image,
            new = %new_image,
            "patched image"
        );
        let index = index.to_string();
        ops.push(PatchOperation::Replace(ReplaceOperation {
            path: Pointer::new(["spec", collection, index.as_str(), "image"]),
            value: Value::String(new_image),
        }));
    }
}

/// Pods created through generateName may not have a name yet when the
/// webhook sees them.
fn pod_display_name(pod: &Pod) -> &str {
    pod.metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{prelude::BASE64_STANDARD, Engine};
    use k8s_openapi::api::core::v1::{Container, EphemeralContainer, PodSpec};
    use kube::core::ObjectMeta;
    use serde_json::json;

    fn catalog(registries: &[&str], account_id: &str, region: &str) -> RegistryCatalog {
        let registries: Vec<String> = registries.iter().map(|r| r.to_string()).collect();
        RegistryCatalog::new(account_id, region, &registries)
    }

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    fn pod(spec: PodSpec) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn review_body(pod: &Pod) -> Vec<u8> {
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "test-uid",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "userInfo": {},
                "object": serde_json::to_value(pod).unwrap(),
            },
        });
        serde_json::to_vec(&review).unwrap()
    }

    /// Run a pod through the pipeline and return (response value, ordered
    /// patch operations decoded from the base64 payload).
    fn mutate_pod(pod: &Pod, catalog: &RegistryCatalog) -> (Value, Vec<(String, String)>) {
        let out = mutate(&review_body(pod), catalog).unwrap();
        let review: Value = serde_json::from_slice(&out).unwrap();
        let response = review["response"].clone();
        let patch = BASE64_STANDARD
            .decode(response["patch"].as_str().unwrap())
            .unwrap();
        let ops: Vec<Value> = serde_json::from_slice(&patch).unwrap();
        let ops = ops
            .iter()
            .map(|op| {
                assert_eq!(op["op"], "replace");
                (
                    op["path"].as_str().unwrap().to_string(),
                    op["value"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        (response, ops)
    }

    #[test]
    fn test_containers_are_patched() {
        let catalog = catalog(&["ghcr.io", "docker.io"], "12345", "us-west-2");
        let pod = pod(PodSpec {
            containers: vec![
                container("c-nginx", "nginx"),
                container("c-ghcr", "ghcr.io/owner/image:tag"),
            ],
            ..Default::default()
        });
        let (response, ops) = mutate_pod(&pod, &catalog);
        assert_eq!(response["uid"], "test-uid");
        assert_eq!(response["allowed"], true);
        assert_eq!(response["patchType"], "JSONPatch");
        assert_eq!(
            ops,
            vec![
                (
                    "/spec/containers/0/image".to_string(),
                    "12345.dkr.ecr.us-west-2.amazonaws.com/docker.io/library/nginx".to_string()
                ),
                (
                    "/spec/containers/1/image".to_string(),
                    "12345.dkr.ecr.us-west-2.amazonaws.com/ghcr.io/owner/image:tag".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_patch_order_spans_all_container_collections() {
        let catalog = catalog(&["docker.io"], "12345", "us-west-2");
        let pod = pod(PodSpec {
            containers: vec![
                container("skipped", "quay.io/org/repo:tag"),
                container("main", "nginx"),
            ],
            init_containers: Some(vec![container("init-1", "owner/init:1.0")]),
            ephemeral_containers: Some(vec![EphemeralContainer {
                name: "debug".to_string(),
                image: Some("busybox".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let (_, ops) = mutate_pod(&pod, &catalog);
        let paths: Vec<&str> = ops.iter().map(|(path, _)| path.as_str()).collect();
        // quay.io is not configured: no entry for containers/0
        assert_eq!(
            paths,
            vec![
                "/spec/containers/1/image",
                "/spec/initContainers/0/image",
                "/spec/ephemeralContainers/0/image",
            ]
        );
        assert_eq!(
            ops[1].1,
            "12345.dkr.ecr.us-west-2.amazonaws.com/docker.io/owner/init:1.0"
        );
        assert_eq!(
            ops[2].1,
            "12345.dkr.ecr.us-west-2.amazonaws.com/docker.io/library/busybox"
        );
    }

    #[test]
    fn test_already_rewritten_pod_yields_empty_patch() {
        let catalog = catalog(&["docker.io"], "12345", "us-west-2");
        let pod = pod(PodSpec {
            containers: vec![container(
                "app",
                "12345.dkr.ecr.us-west-2.amazonaws.com/docker.io/library/nginx",
            )],
            ..Default::default()
        });
        let (response, ops) = mutate_pod(&pod, &catalog);
        assert_eq!(response["allowed"], true);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_applying_pipeline_twice_is_a_noop() {
        let catalog = catalog(&["docker.io", "ghcr.io"], "12345", "us-west-2");
        let first = pod(PodSpec {
            containers: vec![container("app", "ghcr.io/owner/image:tag")],
            ..Default::default()
        });
        let (_, ops) = mutate_pod(&first, &catalog);
        assert_eq!(ops.len(), 1);

        // Re-admit the pod with the rewritten image, as happens on restarts.
        let second = pod(PodSpec {
            containers: vec![container("app", &ops[0].1)],
            ..Default::default()
        });
        let (_, ops) = mutate_pod(&second, &catalog);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_container_without_image_is_skipped() {
        let catalog = catalog(&["docker.io"], "12345", "us-west-2");
        let pod = pod(PodSpec {
            containers: vec![
                Container {
                    name: "no-image".to_string(),
                    ..Default::default()
                },
                container("main", "nginx"),
            ],
            ..Default::default()
        });
        let (_, ops) = mutate_pod(&pod, &catalog);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, "/spec/containers/1/image");
    }

    #[test]
    fn test_malformed_envelope_is_a_decode_error() {
        let catalog = catalog(&["docker.io"], "12345", "us-west-2");
        let err = mutate(b"not json", &catalog).unwrap_err();
        assert!(matches!(err, MutateError::Decode(_)));
    }

    #[test]
    fn test_malformed_pod_object_is_a_decode_error() {
        let catalog = catalog(&["docker.io"], "12345", "us-west-2");
        let body = serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "test-uid",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "userInfo": {},
                "object": {"spec": {"containers": "not-an-array"}},
            },
        }))
        .unwrap();
        let err = mutate(&body, &catalog).unwrap_err();
        assert!(matches!(err, MutateError::Decode(_)));
    }

    #[test]
    fn test_review_without_request_is_rejected() {
        let catalog = catalog(&["docker.io"], "12345", "us-west-2");
        let body = serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
        }))
        .unwrap();
        let err = mutate(&body, &catalog).unwrap_err();
        assert!(matches!(err, MutateError::Request(_)));
    }
}
