//! Command dispatcher.
//!
//! Every session from the worker pool lands in [`Dispatcher::handle`]. Scoped
//! commands (wildcards or designators) are expanded into per-workload
//! commands first; everything else routes straight to its handler. Namespace
//! ignore rules are enforced before any handler runs.

mod cron;
mod image_scan;
mod policy_scan;
mod registry;

pub use cron::CronTemplate;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::command::{Command, CommandKind};
use crate::config::{is_namespace_ignored, OperatorConfig};
use crate::error::{OperatorError, Result};
use crate::rehandler::ResponseRehandler;
use crate::session::{self, JobStatus, Session, CHANNEL_NOTIFICATIONS};
use crate::watcher::instanceid::{instance_ids_for_pod, ContainerData};
use crate::wlid;

/// Routes command sessions to their handlers.
pub struct Dispatcher {
    config: Arc<OperatorConfig>,
    client: Client,
    http: reqwest::Client,
    rehandler: ResponseRehandler,
}

impl Dispatcher {
    pub fn new(
        config: Arc<OperatorConfig>,
        client: Client,
        http: reqwest::Client,
        rehandler: ResponseRehandler,
    ) -> Arc<Self> {
        Arc::new(Dispatcher {
            config,
            client,
            http,
            rehandler,
        })
    }

    pub(crate) fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> Client {
        self.client.clone()
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn rehandler(&self) -> &ResponseRehandler {
        &self.rehandler
    }

    fn send_report(&self) -> bool {
        self.config.send_report()
    }

    /// Entry point for pool workers.
    pub async fn handle(&self, session: Session) {
        let kind = session.command.command_name;
        let span = info_span!("command", name = %kind);
        async {
            session.reporter.set_action_name(kind.as_str());

            if session.command.is_scoped() && !kind.is_direct() {
                if kind == CommandKind::ScanImages {
                    self.handle_image_scan_scope(&session).await;
                } else {
                    self.handle_generic_scope(&session).await;
                }
                return;
            }

            match self.handle_single(&session).await {
                Ok(()) => {
                    session.reporter.send_status(JobStatus::Done, self.send_report());
                    info!(command = %kind, id = %session.command.id(), "action completed successfully");
                }
                Err(e) => {
                    error!(command = %kind, id = %session.command.id(), error = %e, "failed to complete action");
                    session.reporter.send_error(&e, self.send_report(), true);
                }
            }
        }
        .instrument(span)
        .await;
    }

    /// Runs a single (non-scoped) command through the handler table.
    pub async fn handle_single(&self, session: &Session) -> Result<()> {
        let command = &session.command;
        let namespace = command.namespace();
        if is_namespace_ignored(command.command_name, &namespace) {
            return Err(OperatorError::InvalidCommand(format!(
                "{} may not operate in namespace '{}'",
                command.command_name, namespace
            )));
        }

        match command.command_name {
            CommandKind::ScanImages => self.scan_workload_images(session).await,
            CommandKind::ScanFilteredSbom => self.scan_filtered_sbom(session).await,
            CommandKind::RunPolicyScan => self.run_policy_scan(session).await,
            CommandKind::SetPolicyScanCron => {
                self.set_scan_cron(session, CronTemplate::PolicyScan).await
            }
            CommandKind::UpdatePolicyScanCron => {
                self.update_scan_cron(session, CronTemplate::PolicyScan).await
            }
            CommandKind::DeletePolicyScanCron => {
                self.delete_scan_cron(session, CronTemplate::PolicyScan).await
            }
            CommandKind::SetImageScanCron => {
                self.set_scan_cron(session, CronTemplate::ImageScan).await
            }
            CommandKind::UpdateImageScanCron => {
                self.update_scan_cron(session, CronTemplate::ImageScan).await
            }
            CommandKind::DeleteImageScanCron => {
                self.delete_scan_cron(session, CronTemplate::ImageScan).await
            }
            CommandKind::SetRegistryScanCron => {
                self.set_scan_cron(session, CronTemplate::RegistryScan).await
            }
            CommandKind::UpdateRegistryScanCron => {
                self.update_scan_cron(session, CronTemplate::RegistryScan).await
            }
            CommandKind::DeleteRegistryScanCron => {
                self.delete_scan_cron(session, CronTemplate::RegistryScan).await
            }
            CommandKind::ScanRegistry => self.scan_registries(session).await,
            CommandKind::TestRegistryConnectivity => self.test_registry_connectivity(session).await,
        }
    }

    /// Expands a scoped `scanImages` command: one command per container of
    /// every running pod in scope, deduplicated by slug.
    async fn handle_image_scan_scope(&self, session: &Session) {
        let command = &session.command;
        if command.id().is_empty() {
            error!("received scoped image scan with empty id");
            return;
        }

        let namespaces = command.scope_namespaces();
        let selector = scope_label_selector(command);
        let info_line = format!(
            "{}: id '{}', namespaces {:?}, labels '{}'",
            command.command_name,
            command.id(),
            namespaces,
            selector
        );
        info!("{}", info_line);
        session.reporter.send_details(&info_line, self.send_report());
        session
            .reporter
            .send_status(JobStatus::Success, self.send_report());

        let mut seen_slugs: HashSet<String> = HashSet::new();
        for namespace in &namespaces {
            let pods = match self.list_pods(namespace, &selector).await {
                Ok(pods) => pods,
                Err(e) => {
                    error!(namespace = %namespace, error = %e, "failed to list pods");
                    session.reporter.send_error(&e, self.send_report(), true);
                    continue;
                }
            };

            for pod in &pods {
                // The list endpoint returns non-running pods too.
                if pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_none_or(|phase| phase != "Running")
                {
                    continue;
                }

                let wlid = match crate::watcher::parent_workload_id(
                    &self.client,
                    &self.config.cluster_name,
                    pod,
                )
                .await
                {
                    Ok(Some(wlid)) => wlid,
                    Ok(None) => {
                        debug!(pod = %pod.name_any(), "pod belongs to a scheduled job, skipping");
                        continue;
                    }
                    Err(e) => {
                        error!(pod = %pod.name_any(), error = %e, "failed to resolve parent workload");
                        continue;
                    }
                };

                for container_data in containers_in_scope(pod, &wlid, &mut seen_slugs) {
                    let mut child = Command::new(CommandKind::ScanImages);
                    child.wlid = wlid.clone();
                    if let Ok(data) = serde_json::to_value(&container_data) {
                        child
                            .args
                            .insert(crate::command::ARG_CONTAINER_DATA.to_string(), data);
                    }
                    if let Ok(pod_snapshot) = serde_json::to_value(pod) {
                        child
                            .args
                            .insert(crate::command::ARG_POD.to_string(), pod_snapshot);
                    }

                    info!(
                        id = %child.wlid,
                        slug = %container_data.slug,
                        container = %container_data.container_name,
                        image = %container_data.image_tag,
                        "triggering"
                    );
                    self.resubmit(session, child).await;
                }
            }
        }
    }

    /// Expands a scoped command of any other kind into one command per
    /// workload id. Gated behind the `scoped_expansion` config flag.
    async fn handle_generic_scope(&self, session: &Session) {
        let command = &session.command;
        if !self.config.scoped_expansion {
            warn!(
                command = %command.command_name,
                "scoped expansion for this kind is disabled, dropping"
            );
            return;
        }
        if command.id().is_empty() {
            error!("received scoped command with empty id");
            return;
        }

        let namespaces = command.scope_namespaces();
        let selector = scope_label_selector(command);
        session
            .reporter
            .send_status(JobStatus::Success, self.send_report());

        let mut ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for namespace in &namespaces {
            let pods = match self.list_pods(namespace, &selector).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "failed to list pods");
                    session.reporter.send_error(&e, self.send_report(), true);
                    continue;
                }
            };
            for pod in &pods {
                let wlid = match crate::watcher::parent_workload_id(
                    &self.client,
                    &self.config.cluster_name,
                    pod,
                )
                .await
                {
                    Ok(Some(wlid)) => wlid,
                    Ok(None) => {
                        debug!(pod = %pod.name_any(), "pod belongs to a scheduled job, skipping");
                        continue;
                    }
                    Err(e) => {
                        warn!(pod = %pod.name_any(), error = %e, "failed to resolve workload id");
                        continue;
                    }
                };
                // Cron-owned and namespace-level ids are not per-workload targets.
                if let Ok((kind, _)) = wlid::kind_and_name_of(&wlid) {
                    if kind == "cronjob" || kind == "namespace" {
                        continue;
                    }
                }
                if seen.insert(wlid.clone()) {
                    ids.push(wlid);
                }
            }
        }

        info!(count = ids.len(), "ids found in scope");
        for id in ids {
            let mut child = session.command.clone();
            child.wlid = id;
            child.wild_wlid.clear();
            child.wild_sid.clear();
            child.designators.clear();

            if let Err(e) = wlid::validate_wlid(&child.wlid) {
                error!(id = %child.wlid, error = %e, "invalid workload id in scope");
                session.reporter.send_error(&e, self.send_report(), true);
                continue;
            }
            self.resubmit(session, child).await;
        }
    }

    /// Runs an expanded child command on a fresh session that chains to the
    /// parent job id, reporting its outcome on both.
    async fn resubmit(&self, parent: &Session, child: Command) {
        let child_session = session::new_session(
            &self.config,
            self.http.clone(),
            child,
            CHANNEL_NOTIFICATIONS,
            &parent.reporter.job_id(),
            "",
            1,
        );
        match self.handle_single(&child_session).await {
            Ok(()) => {
                child_session
                    .reporter
                    .send_status(JobStatus::Done, self.send_report());
                info!(id = %child_session.command.id(), "action completed successfully");
            }
            Err(e) => {
                error!(id = %child_session.command.id(), error = %e, "failed to complete action");
                child_session
                    .reporter
                    .send_error(&e, self.send_report(), true);
            }
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        };
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(api.list(&params).await?.items)
    }
}

/// Label selector from designator attributes, excluding the scope keys.
fn scope_label_selector(command: &Command) -> String {
    let mut parts: Vec<String> = Vec::new();
    for designator in &command.designators {
        for (key, value) in &designator.attributes {
            if key == crate::command::ATTR_NAMESPACE || key == crate::command::ATTR_CRON_SCHEDULE {
                continue;
            }
            parts.push(format!("{}={}", key, value));
        }
    }
    parts.join(",")
}

/// Container data entries for every container of `pod` whose slug was not
/// already covered in this scope expansion.
fn containers_in_scope(
    pod: &Pod,
    wlid: &str,
    seen_slugs: &mut HashSet<String>,
) -> Vec<ContainerData> {
    let statuses = crate::watcher::running_image_ids(pod);
    let mut out = Vec::new();
    for id in instance_ids_for_pod(pod) {
        let slug = id.slug();
        if !seen_slugs.insert(slug.clone()) {
            // Slug already scanned in this request.
            continue;
        }
        let Some((image_id, image_tag)) =
            statuses.get(&(id.container_name.clone(), id.container_type))
        else {
            continue;
        };
        out.push(ContainerData {
            slug,
            image_id: image_id.clone(),
            image_tag: image_tag.clone(),
            container_name: id.container_name.clone(),
            container_type: id.container_type,
            wlid: wlid.to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Designator;
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateRunning, ContainerStatus, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn running_pod(name: &str, containers: &[(&str, &str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|(n, _, _)| Container {
                        name: n.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(
                    containers
                        .iter()
                        .map(|(n, image, id)| ContainerStatus {
                            name: n.to_string(),
                            image: image.to_string(),
                            image_id: id.to_string(),
                            state: Some(ContainerState {
                                running: Some(ContainerStateRunning::default()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_scope_label_selector_skips_scope_keys() {
        let mut command = Command::new(CommandKind::ScanImages);
        let mut designator = Designator::default();
        designator
            .attributes
            .insert("namespace".to_string(), "web".to_string());
        designator
            .attributes
            .insert("app".to_string(), "frontend".to_string());
        designator
            .attributes
            .insert("tier".to_string(), "prod".to_string());
        command.designators.push(designator);

        let selector = scope_label_selector(&command);
        assert!(selector.contains("app=frontend"));
        assert!(selector.contains("tier=prod"));
        assert!(!selector.contains("namespace"));
    }

    #[test]
    fn test_containers_in_scope_dedupes_by_slug() {
        let wlid = "wlid://cluster-c/namespace-default/deployment-web";
        let pod = running_pod(
            "web-1",
            &[
                ("alpine", "alpine:3.18", "alpine@sha256:a"),
                ("redis", "redis:7", "redis@sha256:b"),
            ],
        );

        let mut seen = HashSet::new();
        let first = containers_in_scope(&pod, wlid, &mut seen);
        assert_eq!(first.len(), 2);

        // The same pod seen again in this scope contributes nothing.
        let second = containers_in_scope(&pod, wlid, &mut seen);
        assert!(second.is_empty());
    }

    #[test]
    fn test_containers_in_scope_skips_statusless_containers() {
        let wlid = "wlid://cluster-c/namespace-default/deployment-web";
        let mut pod = running_pod("web-1", &[("alpine", "alpine:3.18", "alpine@sha256:a")]);
        pod.spec.as_mut().unwrap().containers.push(Container {
            name: "pending".to_string(),
            ..Default::default()
        });

        let mut seen = HashSet::new();
        let data = containers_in_scope(&pod, wlid, &mut seen);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].container_name, "alpine");
    }
}
