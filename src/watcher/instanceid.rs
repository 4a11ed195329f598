//! Per-container instance identities.
//!
//! An instance identity names one container of one workload revision: the
//! pod's direct controller (which carries the pod-template hash in its name),
//! the container, and the container role. Its slug is stable for the lifetime
//! of a revision and changes on rolling updates, which is exactly the
//! granularity the scan dedup maps need.

use k8s_openapi::api::core::v1::Pod;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const DOCKER_PULLABLE_PREFIX: &str = "docker-pullable://";

/// Role of a container within its pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerType {
    #[serde(rename = "container")]
    Container,
    #[serde(rename = "initContainer")]
    InitContainer,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Container => "container",
            ContainerType::InitContainer => "initContainer",
        }
    }
}

/// Identity of one container instance under one workload revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceId {
    pub namespace: String,
    pub owner_kind: String,
    pub owner_name: String,
    pub container_name: String,
    pub container_type: ContainerType,
}

impl InstanceId {
    /// Canonical identity string the slug hash is derived from.
    fn canonical(&self) -> String {
        format!(
            "namespace-{}/kind-{}/name-{}/{}-{}",
            self.namespace,
            self.owner_kind,
            self.owner_name,
            self.container_type.as_str(),
            self.container_name
        )
    }

    /// Stable, name-safe slug: `<kind>-<name>-<container>-<hash>-<hash>`.
    pub fn slug(&self) -> String {
        let hash = fnv1a(self.canonical().as_bytes());
        let raw = format!(
            "{}-{}-{}-{:04x}-{:04x}",
            self.owner_kind.to_lowercase(),
            self.owner_name,
            self.container_name,
            (hash >> 16) & 0xffff,
            hash & 0xffff,
        );
        sanitize_name(&raw)
    }
}

/// Per-container payload attached to `scanImages` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerData {
    pub slug: String,
    #[serde(rename = "imageID")]
    pub image_id: String,
    pub image_tag: String,
    pub container_name: String,
    pub container_type: ContainerType,
    pub wlid: String,
}

/// One instance identity per container and init container of the pod. The
/// direct controller (first owner reference) anchors the identity; a bare pod
/// anchors on itself.
pub fn instance_ids_for_pod(pod: &Pod) -> Vec<InstanceId> {
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let (owner_kind, owner_name) = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|r| (r.kind.clone(), r.name.clone()))
        .unwrap_or_else(|| {
            (
                "Pod".to_string(),
                pod.metadata.name.clone().unwrap_or_default(),
            )
        });

    let mut ids = Vec::new();
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            ids.push(InstanceId {
                namespace: namespace.clone(),
                owner_kind: owner_kind.clone(),
                owner_name: owner_name.clone(),
                container_name: container.name.clone(),
                container_type: ContainerType::Container,
            });
        }
        for container in spec.init_containers.as_deref().unwrap_or_default() {
            ids.push(InstanceId {
                namespace: namespace.clone(),
                owner_kind: owner_kind.clone(),
                owner_name: owner_name.clone(),
                container_name: container.name.clone(),
                container_type: ContainerType::InitContainer,
            });
        }
    }
    ids
}

/// Normalizes a container image reference to `<repo>@<digest>` form.
///
/// Strips the legacy `docker-pullable://` scheme; a bare digest (hex only, as
/// some runtimes report) is joined with the image tag under `sha256:`.
pub fn normalize_image_id(image_tag: &str, image_id: &str) -> String {
    static BARE_DIGEST: OnceLock<Regex> = OnceLock::new();
    let bare = BARE_DIGEST.get_or_init(|| Regex::new(r"^[0-9a-f]+$").unwrap());

    let image_id = image_id
        .strip_prefix(DOCKER_PULLABLE_PREFIX)
        .unwrap_or(image_id);
    if bare.is_match(image_id) {
        format!("{}@sha256:{}", image_tag, image_id)
    } else {
        image_id.to_string()
    }
}

fn sanitize_name(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-z0-9-]+").unwrap());
    invalid
        .replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn pod_with_owner(containers: &[&str], init_containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-69c659f8cb-x7rtp".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "ReplicaSet".to_string(),
                    name: "web-69c659f8cb".to_string(),
                    uid: "u-1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                init_containers: if init_containers.is_empty() {
                    None
                } else {
                    Some(
                        init_containers
                            .iter()
                            .map(|name| Container {
                                name: name.to_string(),
                                ..Default::default()
                            })
                            .collect(),
                    )
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_one_instance_id_per_container() {
        let pod = pod_with_owner(&["alpine", "redis"], &["busybox"]);
        let ids = instance_ids_for_pod(&pod);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].container_type, ContainerType::Container);
        assert_eq!(ids[2].container_type, ContainerType::InitContainer);
        assert!(ids.iter().all(|id| id.owner_kind == "ReplicaSet"));
    }

    #[test]
    fn test_slugs_are_distinct_and_stable() {
        let pod = pod_with_owner(&["alpine", "redis"], &["busybox"]);
        let ids = instance_ids_for_pod(&pod);
        let slugs: Vec<String> = ids.iter().map(InstanceId::slug).collect();

        let mut unique = slugs.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), slugs.len());

        // Deterministic across invocations.
        assert_eq!(slugs[0], ids[0].slug());
        assert!(slugs[0].starts_with("replicaset-web-69c659f8cb-alpine-"));
    }

    #[test]
    fn test_same_container_name_differs_by_role() {
        let mut as_container = InstanceId {
            namespace: "default".to_string(),
            owner_kind: "ReplicaSet".to_string(),
            owner_name: "web-1".to_string(),
            container_name: "alpine".to_string(),
            container_type: ContainerType::Container,
        };
        let slug_container = as_container.slug();
        as_container.container_type = ContainerType::InitContainer;
        assert_ne!(slug_container, as_container.slug());
    }

    #[test]
    fn test_rolling_update_changes_slug() {
        let id_v1 = InstanceId {
            namespace: "default".to_string(),
            owner_kind: "ReplicaSet".to_string(),
            owner_name: "web-69c659f8cb".to_string(),
            container_name: "alpine".to_string(),
            container_type: ContainerType::Container,
        };
        let id_v2 = InstanceId {
            owner_name: "web-7d4b9c6f4d".to_string(),
            ..id_v1.clone()
        };
        assert_ne!(id_v1.slug(), id_v2.slug());
    }

    #[test]
    fn test_bare_pod_anchors_on_itself() {
        let mut pod = pod_with_owner(&["nginx"], &[]);
        pod.metadata.owner_references = None;
        let ids = instance_ids_for_pod(&pod);
        assert_eq!(ids[0].owner_kind, "Pod");
        assert_eq!(ids[0].owner_name, "web-69c659f8cb-x7rtp");
    }

    #[test]
    fn test_normalize_strips_pullable_scheme() {
        assert_eq!(
            normalize_image_id("alpine:3.18", "docker-pullable://alpine@sha256:abc"),
            "alpine@sha256:abc"
        );
        assert_eq!(
            normalize_image_id("alpine:3.18", "alpine@sha256:abc"),
            "alpine@sha256:abc"
        );
    }

    #[test]
    fn test_normalize_joins_bare_digest_with_tag() {
        assert_eq!(
            normalize_image_id("alpine:3.18", "0123456789abcdef"),
            "alpine:3.18@sha256:0123456789abcdef"
        );
        // Mixed-case or non-hex references are passed through untouched.
        assert_eq!(
            normalize_image_id("alpine:3.18", "GHCR0123"),
            "GHCR0123"
        );
    }

    #[test]
    fn test_slug_is_name_safe() {
        let id = InstanceId {
            namespace: "default".to_string(),
            owner_kind: "ReplicaSet".to_string(),
            owner_name: "Web_App.v2".to_string(),
            container_name: "main".to_string(),
            container_type: ContainerType::Container,
        };
        let slug = id.slug();
        assert!(slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }
}
