//! Image (CVE) scan handler.
//!
//! Resolves the containers of the target workload, attaches registry
//! credentials from the pod's pull secrets, and posts one scan request per
//! container to the image scanner. "Connection refused" is retried a few
//! times since the scanner may still be rolling out.

use base64::Engine;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::Dispatcher;
use crate::command::{ARG_CONTAINER_DATA, ARG_CONTAINER_TO_IMAGE_IDS, ARG_POD};
use crate::error::{OperatorError, Result};
use crate::session::Session;
use crate::watcher::instanceid::{normalize_image_id, ContainerData};
use crate::wlid;

const CONNECTION_REFUSED_RETRIES: usize = 5;
const CONNECTION_REFUSED_BACKOFF: Duration = Duration::from_secs(5);

/// Registry credentials attached to a scan request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub server_address: String,
}

/// Job-id chain accumulated across a command's expansion layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionChain {
    pub action_title: String,
    #[serde(rename = "jobIDs")]
    pub job_ids: Vec<String>,
    #[serde(rename = "rootJobID")]
    pub root_job_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// One scan request posted to the image scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanRequest {
    pub wlid: String,
    pub image_tag: String,
    pub image_hash: String,
    pub container_name: String,
    #[serde(rename = "jobID")]
    pub job_id: String,
    #[serde(rename = "parentJobID")]
    pub parent_job_id: String,
    pub last_action: u32,
    pub session: SessionChain,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentialslist: Vec<RegistryCredentials>,
}

impl Dispatcher {
    /// Handles `scanImages` for a single workload.
    pub(super) async fn scan_workload_images(&self, session: &Session) -> Result<()> {
        if !self.config().components.image_scanner {
            return Err(OperatorError::Disabled("ImageScanner"));
        }
        let command = &session.command;
        let target = command.wlid.clone();
        wlid::validate_wlid(&target)?;

        // The watch engine and scope expansion attach per-container data; use
        // it directly when present.
        if let Some(data) = command.args.get(ARG_CONTAINER_DATA) {
            let container: ContainerData = serde_json::from_value(data.clone())?;
            let pod: Option<Pod> = command
                .args
                .get(ARG_POD)
                .and_then(|p| serde_json::from_value(p.clone()).ok());
            let mut request = self.build_scan_request(
                session,
                &target,
                &container.image_tag,
                &container.image_id,
                &container.container_name,
            );
            if let Some(pod) = pod.as_ref() {
                request.credentialslist = self.pull_credentials(pod).await;
            }
            return self.post_image_scan(&request).await;
        }

        // Otherwise resolve the workload's pod and scan every container.
        let pod = self.pod_for_wlid(&target).await?;
        let containers = self.container_image_ids(command, &pod).await;
        if containers.is_empty() {
            return Err(OperatorError::NotFound(format!(
                "no containers with image ids for '{}'",
                target
            )));
        }

        let credentials = self.pull_credentials(&pod).await;
        let mut failures: Vec<String> = Vec::new();
        for (container_name, (image_tag, image_id)) in &containers {
            let mut request =
                self.build_scan_request(session, &target, image_tag, image_id, container_name);
            request.credentialslist = credentials.clone();
            info!(
                wlid = %target,
                container = %container_name,
                image = %image_tag,
                job_id = %request.job_id,
                "requesting image scan"
            );
            if let Err(e) = self.post_image_scan(&request).await {
                error!(image = %image_tag, error = %e, "scanning failed");
                failures.push(format!(
                    "wlid '{}', image '{}', container '{}': {}",
                    target, image_tag, container_name, e
                ));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OperatorError::Http(failures.join("; ")))
        }
    }

    /// Handles `scanFilteredSbom`: asks the image scanner to rescan a stored
    /// filtered SBOM without pulling the image again.
    pub(super) async fn scan_filtered_sbom(&self, session: &Session) -> Result<()> {
        if !self.config().components.image_scanner {
            return Err(OperatorError::Disabled("ImageScanner"));
        }
        let command = &session.command;
        let url = format!(
            "{}/v1/scanFilteredSbom",
            self.config().image_scanner_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "wlid": command.wlid,
            "slug": command.string_arg("slug").unwrap_or_default(),
            "imageID": command.string_arg("imageID").unwrap_or_default(),
            "containerName": command.string_arg("containerName").unwrap_or_default(),
            "jobID": session.reporter.job_id(),
        });
        let response = self.http().post(&url).json(&body).send().await?;
        expect_scan_accepted(response.status())
    }

    fn build_scan_request(
        &self,
        session: &Session,
        target: &str,
        image_tag: &str,
        image_id: &str,
        container_name: &str,
    ) -> ImageScanRequest {
        let mut chain = SessionChain {
            action_title: "vulnerability-scan".to_string(),
            job_ids: Vec::new(),
            root_job_id: String::new(),
            timestamp: session.reporter.timestamp(),
        };

        let parent = session.reporter.parent_action();
        if !parent.is_empty() {
            chain.job_ids.push(parent.clone());
            chain.root_job_id = parent;
        }
        let job_id = session.reporter.job_id();
        if chain.root_job_id.is_empty() {
            chain.root_job_id = job_id.clone();
        }
        chain.job_ids.push(job_id.clone());

        let request_job_id = Uuid::new_v4().to_string();
        chain.job_ids.push(request_job_id.clone());

        ImageScanRequest {
            wlid: target.to_string(),
            image_tag: image_tag.to_string(),
            image_hash: image_id.to_string(),
            container_name: container_name.to_string(),
            job_id: request_job_id,
            parent_job_id: job_id,
            last_action: session.reporter.action_number(),
            session: chain,
            args: BTreeMap::new(),
            credentialslist: Vec::new(),
        }
    }

    /// Credentials from the pod's pull secrets, best effort. Secrets that
    /// cannot be read or parsed are skipped with a log line.
    async fn pull_credentials(&self, pod: &Pod) -> Vec<RegistryCredentials> {
        let names: Vec<String> = pod
            .spec
            .as_ref()
            .and_then(|s| s.image_pull_secrets.as_ref())
            .map(|refs| refs.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default();
        if names.is_empty() {
            return Vec::new();
        }

        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Secret> = Api::namespaced(self.client(), &namespace);
        let mut out = Vec::new();
        for name in names {
            match api.get(&name).await {
                Ok(secret) => out.extend(credentials_from_secret(&secret)),
                Err(e) => {
                    warn!(secret = %name, namespace = %namespace, error = %e, "cannot read pull secret");
                }
            }
        }
        out
    }

    pub(super) async fn post_image_scan(&self, request: &ImageScanRequest) -> Result<()> {
        let url = format!(
            "{}/v1/scanImage",
            self.config().image_scanner_url.trim_end_matches('/')
        );

        let mut attempts = 0;
        loop {
            let result = self.http().post(&url).json(request).send().await;
            match result {
                Ok(response) => return expect_scan_accepted(response.status()),
                Err(e) if e.is_connect() && attempts < CONNECTION_REFUSED_RETRIES => {
                    attempts += 1;
                    warn!(
                        image = %request.image_tag,
                        attempt = attempts,
                        "image scanner refused connection, retrying"
                    );
                    tokio::time::sleep(CONNECTION_REFUSED_BACKOFF).await;
                }
                Err(e) => {
                    return Err(OperatorError::Http(format!(
                        "posting scan for '{}': {}",
                        request.image_tag, e
                    )))
                }
            }
        }
    }

    /// First pod backing the workload the wlid names.
    async fn pod_for_wlid(&self, target: &str) -> Result<Pod> {
        let namespace = wlid::namespace_of(target);
        let api: Api<Pod> = Api::namespaced(self.client(), &namespace);
        let pods = api.list(&ListParams::default()).await?;
        for pod in pods.items {
            let pod_wlid = crate::watcher::parent_workload_id(
                &self.client(),
                &self.config().cluster_name,
                &pod,
            )
            .await?;
            if pod_wlid.as_deref() == Some(target) {
                return Ok(pod);
            }
        }
        Err(OperatorError::NotFound(format!(
            "no pods found for '{}'",
            target
        )))
    }

    /// Container name → `(imageTag, imageID)`, in priority order: explicit
    /// command args, the pod's own statuses, then the statuses of a sibling
    /// pod of the same workload.
    async fn container_image_ids(
        &self,
        command: &crate::command::Command,
        pod: &Pod,
    ) -> BTreeMap<String, (String, String)> {
        let mut out = BTreeMap::new();

        let overrides: BTreeMap<String, String> = command
            .args
            .get(ARG_CONTAINER_TO_IMAGE_IDS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        // Fetched once, only when a container is missing from this pod's
        // status (mid-restart pods report partial statuses).
        let mut peers: Option<Vec<Pod>> = None;

        if let Some(spec) = &pod.spec {
            for container in &spec.containers {
                let image_tag = container.image.clone().unwrap_or_default();
                let image_id = if let Some(id) = overrides.get(&container.name) {
                    id.clone()
                } else if let Some(id) = status_image_id(pod, &container.name) {
                    id
                } else {
                    if peers.is_none() {
                        peers = Some(self.workload_peer_pods(pod).await);
                    }
                    match peer_status_image_id(peers.as_deref().unwrap_or_default(), &container.name)
                    {
                        Some(id) => id,
                        None => {
                            warn!(
                                container = %container.name,
                                pod = %pod.name_any(),
                                "no image id in any pod of the workload, skipping container"
                            );
                            continue;
                        }
                    }
                };
                out.insert(
                    container.name.clone(),
                    (image_tag.clone(), normalize_image_id(&image_tag, &image_id)),
                );
            }
        }
        out
    }

    /// Pods sharing the workload's pod labels in the same namespace.
    async fn workload_peer_pods(&self, pod: &Pod) -> Vec<Pod> {
        let selector = pod_label_selector(pod);
        if selector.is_empty() {
            return Vec::new();
        }
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        match self.list_pods(&namespace, &selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "failed to list workload pods");
                Vec::new()
            }
        }
    }
}

/// Label selector matching every pod stamped from the same template.
fn pod_label_selector(pod: &Pod) -> String {
    pod.metadata
        .labels
        .as_ref()
        .map(|labels| {
            labels
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

/// First image id any sibling pod reports for the container.
fn peer_status_image_id(peers: &[Pod], container_name: &str) -> Option<String> {
    peers
        .iter()
        .find_map(|peer| status_image_id(peer, container_name))
}

fn status_image_id(pod: &Pod, container_name: &str) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == container_name)
        .map(|cs| cs.image_id.clone())
        .filter(|id| !id.is_empty())
}

fn expect_scan_accepted(status: reqwest::StatusCode) -> Result<()> {
    // The scanner acknowledges with 200-203 depending on queueing.
    if (200..=203).contains(&status.as_u16()) {
        Ok(())
    } else {
        Err(OperatorError::Http(format!(
            "image scanner returned status {}",
            status
        )))
    }
}

/// Parses registry credentials out of a Kubernetes secret: either a
/// dockerconfigjson payload or a plain basic-auth pair.
pub(crate) fn credentials_from_secret(secret: &Secret) -> Vec<RegistryCredentials> {
    let Some(data) = &secret.data else {
        return Vec::new();
    };

    if let Some(docker_config) = data.get(".dockerconfigjson") {
        return credentials_from_docker_config(&docker_config.0);
    }

    let field = |key: &str| {
        data.get(key)
            .map(|v| String::from_utf8_lossy(&v.0).to_string())
            .unwrap_or_default()
    };
    let username = field("username");
    let password = field("password");
    if username.is_empty() || password.is_empty() {
        return Vec::new();
    }
    vec![RegistryCredentials {
        username,
        password,
        server_address: String::new(),
    }]
}

fn credentials_from_docker_config(raw: &[u8]) -> Vec<RegistryCredentials> {
    #[derive(Deserialize)]
    struct DockerConfig {
        #[serde(default)]
        auths: BTreeMap<String, DockerAuth>,
    }
    #[derive(Deserialize, Default)]
    struct DockerAuth {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
        #[serde(default)]
        auth: String,
    }

    let Ok(config) = serde_json::from_slice::<DockerConfig>(raw) else {
        warn!("pull secret holds malformed dockerconfigjson");
        return Vec::new();
    };

    let mut out = Vec::new();
    for (server, auth) in config.auths {
        let (mut username, mut password) = (auth.username, auth.password);
        if (username.is_empty() || password.is_empty()) && !auth.auth.is_empty() {
            // The combined form carries base64("user:pass").
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(&auth.auth) {
                if let Some((user, pass)) = String::from_utf8_lossy(&decoded).split_once(':') {
                    username = user.to_string();
                    password = pass.to_string();
                }
            }
        }
        if username.is_empty() || password.is_empty() {
            continue;
        }
        out.push(RegistryCredentials {
            username,
            password,
            server_address: server,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    #[test]
    fn test_scan_request_serialization_keys() {
        let request = ImageScanRequest {
            wlid: "wlid://cluster-c/namespace-n/deployment-d".to_string(),
            image_tag: "alpine:3.18".to_string(),
            image_hash: "alpine@sha256:a".to_string(),
            container_name: "alpine".to_string(),
            job_id: "j-2".to_string(),
            parent_job_id: "j-1".to_string(),
            last_action: 1,
            session: SessionChain {
                action_title: "vulnerability-scan".to_string(),
                job_ids: vec!["j-1".to_string(), "j-2".to_string()],
                root_job_id: "j-1".to_string(),
                timestamp: chrono::Utc::now(),
            },
            args: BTreeMap::new(),
            credentialslist: Vec::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jobID"], "j-2");
        assert_eq!(json["parentJobID"], "j-1");
        assert_eq!(json["imageHash"], "alpine@sha256:a");
        assert_eq!(json["session"]["rootJobID"], "j-1");
        assert!(json.get("credentialslist").is_none());
    }

    #[test]
    fn test_expect_scan_accepted_range() {
        assert!(expect_scan_accepted(reqwest::StatusCode::OK).is_ok());
        assert!(expect_scan_accepted(reqwest::StatusCode::from_u16(203).unwrap()).is_ok());
        assert!(expect_scan_accepted(reqwest::StatusCode::NO_CONTENT).is_err());
        assert!(expect_scan_accepted(reqwest::StatusCode::INTERNAL_SERVER_ERROR).is_err());
    }

    fn secret_with(data: Vec<(&str, &[u8])>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("regcred".to_string()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_credentials_from_docker_config_json() {
        let config = serde_json::json!({
            "auths": {
                "registry.example.com": {"username": "bob", "password": "hunter2"}
            }
        });
        let secret = secret_with(vec![(
            ".dockerconfigjson",
            config.to_string().as_bytes(),
        )]);
        let creds = credentials_from_secret(&secret);
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].username, "bob");
        assert_eq!(creds[0].server_address, "registry.example.com");
    }

    #[test]
    fn test_credentials_from_combined_auth_field() {
        let auth = base64::engine::general_purpose::STANDARD.encode("bob:hunter2");
        let config = serde_json::json!({
            "auths": {"registry.example.com": {"auth": auth}}
        });
        let secret = secret_with(vec![(
            ".dockerconfigjson",
            config.to_string().as_bytes(),
        )]);
        let creds = credentials_from_secret(&secret);
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].username, "bob");
        assert_eq!(creds[0].password, "hunter2");
    }

    #[test]
    fn test_credentials_from_basic_auth_secret() {
        let secret = secret_with(vec![("username", b"bob".as_slice()), ("password", b"pw")]);
        let creds = credentials_from_secret(&secret);
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].username, "bob");
    }

    #[test]
    fn test_pod_label_selector_joins_labels() {
        let mut pod = Pod::default();
        assert_eq!(pod_label_selector(&pod), "");

        let mut labels = std::collections::BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("pod-template-hash".to_string(), "69c659f8cb".to_string());
        pod.metadata.labels = Some(labels);

        let selector = pod_label_selector(&pod);
        assert!(selector.contains("app=web"));
        assert!(selector.contains("pod-template-hash=69c659f8cb"));
        assert_eq!(selector.matches('=').count(), 2);
    }

    #[test]
    fn test_peer_status_image_id_takes_first_match() {
        use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

        let statusless = Pod::default();
        let mut sibling = Pod::default();
        sibling.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "alpine".to_string(),
                image_id: "alpine@sha256:a".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let peers = vec![statusless, sibling];
        assert_eq!(
            peer_status_image_id(&peers, "alpine").as_deref(),
            Some("alpine@sha256:a")
        );
        assert!(peer_status_image_id(&peers, "redis").is_none());
        assert!(peer_status_image_id(&[], "alpine").is_none());
    }

    #[test]
    fn test_incomplete_secret_yields_nothing() {
        let secret = secret_with(vec![("username", b"bob".as_slice())]);
        assert!(credentials_from_secret(&secret).is_empty());

        let empty = Secret::default();
        assert!(credentials_from_secret(&empty).is_empty());
    }
}
