//! Cluster watch engine.
//!
//! Watches pods (and filtered SBOM objects) through a cooldown queue,
//! resolves each running pod to its top controller's workload identity,
//! tracks which `(wlid, imageID)` pairs were already sent to the scanner, and
//! emits one `scanImages` command per container the first time a pair shows
//! up. Deletions clean the per-slug state and derived storage artifacts.

pub mod cooldown;
pub mod instanceid;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandKind, ARG_CONTAINER_DATA, ARG_POD};
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::session::{self, CHANNEL_WATCHER};
use crate::watcher::cooldown::CooldownQueue;
use crate::watcher::instanceid::{
    instance_ids_for_pod, normalize_image_id, ContainerData, ContainerType,
};
use crate::wlid::build_wlid;

/// API group of the cluster-local storage objects holding derived artifacts.
const STORAGE_GROUP: &str = "storage.argus.io";
const STORAGE_VERSION: &str = "v1beta1";
const FILTERED_SBOM_KIND: &str = "FilteredSbom";
const FILTERED_SBOM_PLURAL: &str = "filteredsboms";

/// Annotations carried by filtered SBOM objects.
const ANNOTATION_WLID: &str = "argus.io/wlid";
const ANNOTATION_IMAGE_ID: &str = "argus.io/image-id";
const ANNOTATION_CONTAINER: &str = "argus.io/container-name";

/// Dedup state of the watch engine: which image is live behind each slug and
/// which `(wlid, imageID)` pairs were already dispatched.
#[derive(Default)]
pub struct ScanState {
    slug_to_image_id: Mutex<HashMap<String, String>>,
    wlid_and_image_id: Mutex<HashSet<String>>,
}

impl ScanState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the scan commands a pod event produces, updating the dedup
    /// maps. A `(wlid, imageID)` pair is emitted at most once per process
    /// lifetime; a pair with a changed image emits again.
    pub fn scan_commands_for_pod(&self, pod: &Pod, wlid: &str) -> Vec<Command> {
        let statuses = running_image_ids(pod);
        let mut commands = Vec::new();

        for id in instance_ids_for_pod(pod) {
            let Some((image_id, image_tag)) =
                statuses.get(&(id.container_name.clone(), id.container_type))
            else {
                // No runtime status yet; the next MODIFIED event catches it.
                continue;
            };
            let slug = id.slug();
            let pair = format!("{}{}", wlid, image_id);

            {
                let mut pairs = self.wlid_and_image_id.lock().unwrap();
                if pairs.contains(&pair) {
                    continue;
                }
                pairs.insert(pair);
            }
            self.slug_to_image_id
                .lock()
                .unwrap()
                .insert(slug.clone(), image_id.clone());

            let container_data = ContainerData {
                slug,
                image_id: image_id.clone(),
                image_tag: image_tag.clone(),
                container_name: id.container_name.clone(),
                container_type: id.container_type,
                wlid: wlid.to_string(),
            };

            let mut command = Command::new(CommandKind::ScanImages);
            command.wlid = wlid.to_string();
            if let Ok(data) = serde_json::to_value(&container_data) {
                command.args.insert(ARG_CONTAINER_DATA.to_string(), data);
            }
            if let Ok(pod_snapshot) = serde_json::to_value(pod) {
                command.args.insert(ARG_POD.to_string(), pod_snapshot);
            }
            commands.push(command);
        }

        commands
    }

    /// Drops the slug entries of a deleted pod and returns them.
    pub fn remove_pod(&self, pod: &Pod) -> Vec<String> {
        let slugs: Vec<String> = instance_ids_for_pod(pod)
            .iter()
            .map(|id| id.slug())
            .collect();
        let mut map = self.slug_to_image_id.lock().unwrap();
        for slug in &slugs {
            map.remove(slug);
        }
        slugs
    }

    /// Snapshot of the slug map, for observability and tests.
    pub fn slug_to_image_id(&self) -> HashMap<String, String> {
        self.slug_to_image_id.lock().unwrap().clone()
    }

    /// Number of `(wlid, imageID)` pairs dispatched so far.
    pub fn dispatched_pairs(&self) -> usize {
        self.wlid_and_image_id.lock().unwrap().len()
    }
}

/// Watches the cluster and turns state changes into scan commands.
pub struct WatchHandler {
    config: Arc<OperatorConfig>,
    client: Client,
    http: reqwest::Client,
    state: ScanState,
}

impl WatchHandler {
    pub fn new(config: Arc<OperatorConfig>, client: Client, http: reqwest::Client) -> Arc<Self> {
        Arc::new(WatchHandler {
            config,
            client,
            http,
            state: ScanState::new(),
        })
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    /// Runs the pod watch loop until the stream producer ends.
    ///
    /// The runtime watcher re-opens the stream at the last observed resource
    /// version and re-lists on 410-gone, so this loop only sees a deduplicated
    /// event feed.
    pub async fn pod_watch(self: Arc<Self>, pool: Arc<WorkerPool>) {
        info!("starting pod watch");
        let api: Api<Pod> = Api::all(self.client.clone());
        let (queue, mut events) = CooldownQueue::new(
            self.config.event_queue_size,
            Duration::from_secs(self.config.event_cooldown_seconds),
        );

        let producer = tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api, watcher::Config::default()));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        let key = match &event {
                            watcher::Event::Apply(pod)
                            | watcher::Event::InitApply(pod)
                            | watcher::Event::Delete(pod) => {
                                pod.metadata.uid.clone().unwrap_or_default()
                            }
                            _ => continue,
                        };
                        queue.enqueue(&key, event);
                    }
                    Err(e) => {
                        // The watcher backs off and resumes on its own.
                        warn!(error = %e, "pod watch stream error");
                    }
                }
            }
        });

        while let Some(event) = events.recv().await {
            match event {
                watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                    self.handle_pod_applied(&pod, &pool).await;
                }
                watcher::Event::Delete(pod) => {
                    self.handle_pod_deleted(&pod).await;
                }
                _ => {}
            }
        }
        producer.abort();
    }

    /// Runs the filtered-SBOM watch loop. New filtered SBOMs become
    /// `scanFilteredSbom` commands for the image scanner.
    pub async fn sbom_watch(self: Arc<Self>, pool: Arc<WorkerPool>) {
        info!("starting filtered SBOM watch");
        let resource = filtered_sbom_resource();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let (queue, mut events) = CooldownQueue::new(
            self.config.event_queue_size,
            Duration::from_secs(self.config.event_cooldown_seconds),
        );

        let producer = tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api, watcher::Config::default()));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        let key = obj.metadata.uid.clone().unwrap_or_default();
                        queue.enqueue(&key, obj);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "filtered SBOM watch stream error");
                    }
                }
            }
        });

        while let Some(obj) = events.recv().await {
            match sbom_scan_command(&obj) {
                Some(command) => self.submit(command, &pool),
                None => debug!(
                    name = %obj.name_any(),
                    "filtered SBOM without scan annotations, skipping"
                ),
            }
        }
        producer.abort();
    }

    async fn handle_pod_applied(&self, pod: &Pod, pool: &WorkerPool) {
        if !pod_is_running(pod) {
            return;
        }
        let wlid = match parent_workload_id(&self.client, &self.config.cluster_name, pod).await {
            Ok(Some(wlid)) => wlid,
            Ok(None) => {
                debug!(pod = %pod.name_any(), "pod belongs to a scheduled job, skipping");
                return;
            }
            Err(e) => {
                error!(
                    pod = %pod.name_any(),
                    namespace = %pod.namespace().unwrap_or_default(),
                    error = %e,
                    "failed to resolve parent workload"
                );
                return;
            }
        };

        for command in self.state.scan_commands_for_pod(pod, &wlid) {
            self.submit(command, pool);
        }
    }

    async fn handle_pod_deleted(&self, pod: &Pod) {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let slugs = self.state.remove_pod(pod);

        // Derived artifacts are named after the slug; missing ones are fine.
        let resource = filtered_sbom_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &resource);
        for slug in &slugs {
            match api.delete(slug, &Default::default()).await {
                Ok(_) => debug!(slug = %slug, "deleted derived artifacts"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => warn!(slug = %slug, error = %e, "failed to delete derived artifacts"),
            }
        }
    }

    fn submit(&self, command: Command, pool: &WorkerPool) {
        let session = session::new_session(
            &self.config,
            self.http.clone(),
            command,
            CHANNEL_WATCHER,
            "",
            "",
            1,
        );
        pool.invoke_or_log(session);
    }
}

/// Resolves a pod to the wlid of its top controller by walking owner
/// references. An ownerless pod resolves to itself. CronJob-children resolve
/// to no workload at all: scheduled jobs (the operator's own scan schedules
/// included) are not scannable workloads, so their pods return `None`.
pub async fn parent_workload_id(
    client: &Client,
    cluster_name: &str,
    pod: &Pod,
) -> Result<Option<String>> {
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let mut kind = "Pod".to_string();
    let mut name = pod.name_any();
    let mut owner = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first().cloned());

    while let Some(current) = owner.take() {
        match current.kind.as_str() {
            "ReplicaSet" => {
                let api: Api<ReplicaSet> = Api::namespaced(client.clone(), &namespace);
                let rs = api.get(&current.name).await?;
                kind = current.kind;
                name = current.name;
                owner = rs
                    .metadata
                    .owner_references
                    .as_ref()
                    .and_then(|refs| refs.first().cloned());
            }
            "Job" => {
                let api: Api<Job> = Api::namespaced(client.clone(), &namespace);
                let job = api.get(&current.name).await?;
                let job_owner = job
                    .metadata
                    .owner_references
                    .as_ref()
                    .and_then(|refs| refs.first().cloned());
                if job_owner.as_ref().is_some_and(|o| o.kind == "CronJob") {
                    return Ok(None);
                }
                kind = current.kind;
                name = current.name;
                owner = job_owner;
            }
            "CronJob" => {
                return Ok(None);
            }
            "Deployment" | "StatefulSet" | "DaemonSet" => {
                kind = current.kind;
                name = current.name;
                break;
            }
            other => {
                debug!(kind = %other, "unrecognized owner kind, stopping resolution");
                break;
            }
        }
    }

    Ok(Some(build_wlid(cluster_name, &namespace, &kind, &name)))
}

fn filtered_sbom_resource() -> ApiResource {
    ApiResource {
        group: STORAGE_GROUP.to_string(),
        version: STORAGE_VERSION.to_string(),
        api_version: format!("{}/{}", STORAGE_GROUP, STORAGE_VERSION),
        kind: FILTERED_SBOM_KIND.to_string(),
        plural: FILTERED_SBOM_PLURAL.to_string(),
    }
}

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

/// `(containerName, role)` → `(normalized imageID, imageTag)` for every
/// container currently running.
pub(crate) fn running_image_ids(pod: &Pod) -> HashMap<(String, ContainerType), (String, String)> {
    let mut out = HashMap::new();
    let Some(status) = &pod.status else {
        return out;
    };

    let mut collect = |statuses: Option<&Vec<k8s_openapi::api::core::v1::ContainerStatus>>,
                       role: ContainerType| {
        for cs in statuses.into_iter().flatten() {
            let running = cs.state.as_ref().is_some_and(|s| s.running.is_some());
            if !running || cs.image_id.is_empty() {
                continue;
            }
            out.insert(
                (cs.name.clone(), role),
                (
                    normalize_image_id(&cs.image, &cs.image_id),
                    cs.image.clone(),
                ),
            );
        }
    };
    collect(status.container_statuses.as_ref(), ContainerType::Container);
    collect(
        status.init_container_statuses.as_ref(),
        ContainerType::InitContainer,
    );
    out
}

/// Builds the scan command for a filtered SBOM object, when it carries the
/// required annotations.
fn sbom_scan_command(obj: &DynamicObject) -> Option<Command> {
    let annotations = obj.metadata.annotations.as_ref()?;
    let wlid = annotations.get(ANNOTATION_WLID)?;
    let image_id = annotations.get(ANNOTATION_IMAGE_ID)?;
    let container = annotations.get(ANNOTATION_CONTAINER)?;

    let mut command = Command::new(CommandKind::ScanFilteredSbom);
    command.wlid = wlid.clone();
    command
        .args
        .insert("slug".to_string(), Value::String(obj.name_any()));
    command
        .args
        .insert("imageID".to_string(), Value::String(image_id.clone()));
    command
        .args
        .insert("containerName".to_string(), Value::String(container.clone()));
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateRunning, ContainerStatus, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn running_status(name: &str, image: &str, image_id: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            image: image.to_string(),
            image_id: image_id.to_string(),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(
        replica_set: &str,
        containers: &[(&str, &str, &str)],
        init_containers: &[(&str, &str, &str)],
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-x7rtp", replica_set)),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "ReplicaSet".to_string(),
                    name: replica_set.to_string(),
                    uid: "rs-uid".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|(name, _, _)| Container {
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
                            .map(|(name, _, _)| Container {
                                name: name.to_string(),
                                ..Default::default()
                            })
                            .collect(),
                    )
                },
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(
                    containers
                        .iter()
                        .map(|(name, image, id)| running_status(name, image, id))
                        .collect(),
                ),
                init_container_statuses: if init_containers.is_empty() {
                    None
                } else {
                    Some(
                        init_containers
                            .iter()
                            .map(|(name, image, id)| running_status(name, image, id))
                            .collect(),
                    )
                },
                ..Default::default()
            }),
        }
    }

    const WLID: &str = "wlid://cluster-test/namespace-default/deployment-web";

    #[test]
    fn test_new_workload_emits_one_command_per_container() {
        let state = ScanState::new();
        let pod = pod(
            "web-69c659f8cb",
            &[
                ("alpine", "alpine:3.18", "alpine@sha256:a"),
                ("redis", "redis:7", "redis@sha256:b"),
            ],
            &[("busybox", "busybox:1.34", "busybox@sha256:c")],
        );

        let commands = state.scan_commands_for_pod(&pod, WLID);
        assert_eq!(commands.len(), 3);
        assert!(commands
            .iter()
            .all(|c| c.command_name == CommandKind::ScanImages && c.wlid == WLID));

        let slugs: HashSet<String> = commands
            .iter()
            .map(|c| {
                let data: ContainerData =
                    serde_json::from_value(c.args[ARG_CONTAINER_DATA].clone()).unwrap();
                data.slug
            })
            .collect();
        assert_eq!(slugs.len(), 3);
        assert_eq!(state.dispatched_pairs(), 3);
        assert_eq!(state.slug_to_image_id().len(), 3);
    }

    #[test]
    fn test_rolling_update_with_same_images_emits_nothing() {
        let state = ScanState::new();
        let first = pod(
            "web-69c659f8cb",
            &[("alpine", "alpine:3.18", "alpine@sha256:a")],
            &[],
        );
        assert_eq!(state.scan_commands_for_pod(&first, WLID).len(), 1);

        // New ReplicaSet, identical digest: new slug but a known pair.
        let second = pod(
            "web-7d4b9c6f4d",
            &[("alpine", "alpine:3.18", "alpine@sha256:a")],
            &[],
        );
        assert!(state.scan_commands_for_pod(&second, WLID).is_empty());
        assert_eq!(state.dispatched_pairs(), 1);
        assert_eq!(state.slug_to_image_id().len(), 1);
    }

    #[test]
    fn test_image_rotation_emits_exactly_one_new_command() {
        let state = ScanState::new();
        let first = pod(
            "web-69c659f8cb",
            &[
                ("alpine", "alpine:3.18", "alpine@sha256:a"),
                ("redis", "redis:7", "redis@sha256:b"),
            ],
            &[],
        );
        assert_eq!(state.scan_commands_for_pod(&first, WLID).len(), 2);

        let rotated = pod(
            "web-69c659f8cb",
            &[
                ("alpine", "alpine:3.19", "alpine@sha256:a2"),
                ("redis", "redis:7", "redis@sha256:b"),
            ],
            &[],
        );
        let commands = state.scan_commands_for_pod(&rotated, WLID);
        assert_eq!(commands.len(), 1);

        let data: ContainerData =
            serde_json::from_value(commands[0].args[ARG_CONTAINER_DATA].clone()).unwrap();
        assert_eq!(data.image_id, "alpine@sha256:a2");
        assert_eq!(
            state.slug_to_image_id().get(&data.slug),
            Some(&"alpine@sha256:a2".to_string())
        );
        assert_eq!(state.dispatched_pairs(), 3);
    }

    #[test]
    fn test_repeat_event_is_a_noop() {
        let state = ScanState::new();
        let p = pod(
            "web-69c659f8cb",
            &[("alpine", "alpine:3.18", "alpine@sha256:a")],
            &[],
        );
        assert_eq!(state.scan_commands_for_pod(&p, WLID).len(), 1);
        assert!(state.scan_commands_for_pod(&p, WLID).is_empty());
        assert_eq!(state.dispatched_pairs(), 1);
    }

    #[test]
    fn test_container_without_status_is_skipped() {
        let state = ScanState::new();
        let mut p = pod(
            "web-69c659f8cb",
            &[("alpine", "alpine:3.18", "alpine@sha256:a")],
            &[],
        );
        // Second container declared in spec but not yet started.
        p.spec.as_mut().unwrap().containers.push(Container {
            name: "sidecar".to_string(),
            ..Default::default()
        });
        assert_eq!(state.scan_commands_for_pod(&p, WLID).len(), 1);
    }

    #[test]
    fn test_pullable_prefix_normalized_in_emitted_pair() {
        let state = ScanState::new();
        let p = pod(
            "web-69c659f8cb",
            &[(
                "alpine",
                "alpine:3.18",
                "docker-pullable://alpine@sha256:a",
            )],
            &[],
        );
        let commands = state.scan_commands_for_pod(&p, WLID);
        let data: ContainerData =
            serde_json::from_value(commands[0].args[ARG_CONTAINER_DATA].clone()).unwrap();
        assert_eq!(data.image_id, "alpine@sha256:a");

        // The un-prefixed form is now a known pair.
        let same = pod(
            "web-69c659f8cb",
            &[("alpine", "alpine:3.18", "alpine@sha256:a")],
            &[],
        );
        assert!(state.scan_commands_for_pod(&same, WLID).is_empty());
    }

    #[test]
    fn test_deleted_pod_clears_slug_entries() {
        let state = ScanState::new();
        let p = pod(
            "web-69c659f8cb",
            &[("alpine", "alpine:3.18", "alpine@sha256:a")],
            &[],
        );
        state.scan_commands_for_pod(&p, WLID);
        assert_eq!(state.slug_to_image_id().len(), 1);

        let removed = state.remove_pod(&p);
        assert_eq!(removed.len(), 1);
        assert!(state.slug_to_image_id().is_empty());
        // Dispatched pairs survive deletion; the image was already scanned.
        assert_eq!(state.dispatched_pairs(), 1);
    }

    #[test]
    fn test_non_running_pod_is_ignored() {
        let mut p = pod(
            "web-69c659f8cb",
            &[("alpine", "alpine:3.18", "alpine@sha256:a")],
            &[],
        );
        p.status.as_mut().unwrap().phase = Some("Pending".to_string());
        assert!(!pod_is_running(&p));
    }

    #[test]
    fn test_sbom_scan_command_requires_annotations() {
        let mut obj = DynamicObject::new("web-slug", &filtered_sbom_resource());
        assert!(sbom_scan_command(&obj).is_none());

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(ANNOTATION_WLID.to_string(), WLID.to_string());
        annotations.insert(
            ANNOTATION_IMAGE_ID.to_string(),
            "alpine@sha256:a".to_string(),
        );
        annotations.insert(ANNOTATION_CONTAINER.to_string(), "alpine".to_string());
        obj.metadata.annotations = Some(annotations);

        let command = sbom_scan_command(&obj).unwrap();
        assert_eq!(command.command_name, CommandKind::ScanFilteredSbom);
        assert_eq!(command.wlid, WLID);
        assert_eq!(command.args["slug"], Value::String("web-slug".to_string()));
    }
}
