//! Registry scan orchestration.
//!
//! A registry descriptor arrives in the command args; credentials come from a
//! secret when named. Connectivity tests report progress in stages so the
//! backend can tell bad registry information apart from bad credentials.
//! Scans enumerate every repository and tag and fan out one image scan per
//! pair, aggregating the failures into a single error.

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::image_scan::{ImageScanRequest, RegistryCredentials, SessionChain};
use super::Dispatcher;
use crate::command::ARG_REGISTRY_INFO;
use crate::error::{OperatorError, Result};
use crate::session::{JobStatus, Session};

/// Connectivity test stages, reported in order.
const STAGE_INFORMATION: &str = "registryInformation";
const STAGE_AUTHENTICATION: &str = "registryAuthentication";
const STAGE_RETRIEVE_REPOSITORIES: &str = "retrieveRepositories";
const STAGE_RETRIEVE_TAGS: &str = "retrieveTags";

/// Error substrings that mean the registry rejected our credentials.
const AUTH_ERROR_MARKERS: [&str; 4] = ["unauthorized", "denied", "authentication", "empty token"];

/// Registry descriptor carried in the command args.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryInfo {
    pub registry_name: String,
    pub secret_name: String,
    pub is_https: Option<bool>,
    pub skip_tls_verify: Option<bool>,
    pub auth_method: Option<String>,
}

/// A parsed registry plus everything learned while talking to it.
pub struct RegistryScan {
    pub info: RegistryInfo,
    pub hostname: String,
    pub project_id: String,
    pub credentials: Option<RegistryCredentials>,
    pub image_to_tags: BTreeMap<String, Vec<String>>,
}

impl RegistryScan {
    fn use_http(&self) -> bool {
        !self.info.is_https.unwrap_or(true)
    }

    fn skip_tls_verify(&self) -> bool {
        self.info.skip_tls_verify.unwrap_or(false)
    }

    fn base_url(&self) -> String {
        let scheme = if self.use_http() { "http" } else { "https" };
        format!("{}://{}", scheme, self.hostname)
    }

    /// Strips the registry host and project prefix off a repository path.
    fn short_repository_name(&self, repository: &str) -> String {
        let mut name = repository
            .strip_prefix(&format!("{}/", self.hostname))
            .unwrap_or(repository);
        if !self.project_id.is_empty() {
            name = name
                .strip_prefix(&format!("{}/", self.project_id))
                .unwrap_or(name);
        }
        name.to_string()
    }

    fn validate(&self) -> Result<()> {
        if self.info.registry_name.is_empty() {
            return Err(OperatorError::InvalidCommand(
                "registry descriptor without registryName".to_string(),
            ));
        }
        if self.hostname.is_empty() {
            return Err(OperatorError::InvalidCommand(format!(
                "cannot derive hostname from registry '{}'",
                self.info.registry_name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Vec<String>,
}

/// Repository inventory uploaded after a successful connectivity test.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepositoriesReport {
    registry_name: String,
    #[serde(rename = "customerGUID")]
    customer_guid: String,
    #[serde(rename = "jobID")]
    job_id: String,
    repositories: Vec<RepositoryEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryEntry {
    repository_name: String,
}

impl Dispatcher {
    /// Handles `scanRegistry`.
    pub(super) async fn scan_registries(&self, session: &Session) -> Result<()> {
        let mut scan = self.load_registry_scan(session).await.map_err(|e| {
            session.reporter.set_details("loadRegistryScan");
            e
        })?;
        scan.validate().map_err(|e| {
            session.reporter.set_details(STAGE_INFORMATION);
            e
        })?;

        let repos = self.enumerate_repositories(&scan).await?;
        for repo in &repos {
            let tags = self.list_tags(&scan, repo).await?;
            scan.image_to_tags.insert(repo.clone(), tags);
        }

        let requests = self.registry_scan_requests(&scan, session);
        session.reporter.send_details(
            &format!(
                "sending {} images from registry {} to the image scanner",
                requests.len(),
                scan.info.registry_name
            ),
            self.config().send_report(),
        );

        let mut failures = Vec::new();
        for request in &requests {
            if let Err(e) = self.post_image_scan(request).await {
                error!(image = %request.image_tag, error = %e, "registry image scan failed");
                failures.push(format!("'{}': {}", request.image_tag, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(OperatorError::Http(format!(
                "registry scan failures: {}",
                failures.join("; ")
            )))
        }
    }

    /// Handles `testRegistryConnectivity`, reporting each stage separately.
    pub(super) async fn test_registry_connectivity(&self, session: &Session) -> Result<()> {
        let send_report = self.config().send_report();

        let scan = self.load_registry_scan(session).await.map_err(|e| {
            session.reporter.set_details("loadRegistryScan");
            e
        })?;
        scan.validate().map_err(|e| {
            session.reporter.set_details(STAGE_INFORMATION);
            e
        })?;

        let repos = match self.enumerate_repositories(&scan).await {
            Ok(repos) => repos,
            Err(e) => {
                return if is_auth_error(&e) {
                    // Registry information was good; only the credentials failed.
                    session.reporter.set_details(STAGE_INFORMATION);
                    session.reporter.send_status(JobStatus::Success, send_report);
                    session.reporter.set_details(STAGE_AUTHENTICATION);
                    Err(OperatorError::RegistryAuth(e.to_string()))
                } else {
                    session.reporter.set_details(STAGE_INFORMATION);
                    Err(e)
                };
            }
        };

        session.reporter.set_details(STAGE_INFORMATION);
        session.reporter.send_status(JobStatus::Success, send_report);
        session.reporter.set_details(STAGE_AUTHENTICATION);
        session.reporter.send_status(JobStatus::Success, send_report);

        if repos.is_empty() {
            session.reporter.set_details(STAGE_RETRIEVE_REPOSITORIES);
            return Err(OperatorError::NotFound(
                "registry has no repositories".to_string(),
            ));
        }
        session.reporter.set_details(STAGE_RETRIEVE_REPOSITORIES);
        session.reporter.send_status(JobStatus::Success, send_report);

        // Pulling tags for one repository proves the token scope.
        if let Err(e) = self.list_tags(&scan, &repos[0]).await {
            session.reporter.set_details(STAGE_RETRIEVE_TAGS);
            return Err(e);
        }
        session.reporter.set_details(STAGE_RETRIEVE_TAGS);
        session.reporter.send_status(JobStatus::Success, send_report);

        self.report_repositories(&scan, session, &repos).await
    }

    async fn load_registry_scan(&self, session: &Session) -> Result<RegistryScan> {
        let info: RegistryInfo = session
            .command
            .args
            .get(ARG_REGISTRY_INFO)
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        session.reporter.set_target(&format!(
            "registryName: {}",
            info.registry_name
        ));

        // "host/project" descriptors split on the first separator.
        let (hostname, project_id) = match info.registry_name.split_once('/') {
            Some((host, project)) => (host.to_string(), project.to_string()),
            None => (info.registry_name.clone(), String::new()),
        };

        let credentials = if info.secret_name.is_empty() {
            None
        } else {
            let api: Api<Secret> =
                Api::namespaced(self.client(), &self.config().namespace);
            let secret = api.get(&info.secret_name).await?;
            super::image_scan::credentials_from_secret(&secret)
                .into_iter()
                .next()
        };

        Ok(RegistryScan {
            info,
            hostname,
            project_id,
            credentials,
            image_to_tags: BTreeMap::new(),
        })
    }

    /// Lists the repositories of the registry, filtered to the project.
    async fn enumerate_repositories(&self, scan: &RegistryScan) -> Result<Vec<String>> {
        let client = self.registry_client(scan)?;
        let url = format!("{}/v2/_catalog?n=1000", scan.base_url());
        let mut request = client.get(&url);
        if let Some(creds) = &scan.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await.map_err(|e| {
            OperatorError::Http(format!("catalog request to '{}' failed: {}", scan.hostname, e))
        })?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(OperatorError::RegistryAuth(format!(
                "catalog returned {}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(OperatorError::Http(format!(
                "catalog returned {}: {}",
                status, body
            )));
        }

        let catalog: CatalogResponse = serde_json::from_str(&body)?;
        let repos = catalog
            .repositories
            .into_iter()
            .filter(|repo| {
                scan.project_id.is_empty() || repo.starts_with(&format!("{}/", scan.project_id))
            })
            .collect();
        Ok(repos)
    }

    async fn list_tags(&self, scan: &RegistryScan, repository: &str) -> Result<Vec<String>> {
        let client = self.registry_client(scan)?;
        let url = format!("{}/v2/{}/tags/list", scan.base_url(), repository);
        let mut request = client.get(&url);
        if let Some(creds) = &scan.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await.map_err(|e| {
            OperatorError::Http(format!("tags request for '{}' failed: {}", repository, e))
        })?;
        if !response.status().is_success() {
            return Err(OperatorError::Http(format!(
                "tags request for '{}' returned {}",
                repository,
                response.status()
            )));
        }
        let tags: TagsResponse = response.json().await?;
        Ok(tags.tags)
    }

    /// One scan request per `(repository, tag)` pair.
    fn registry_scan_requests(
        &self,
        scan: &RegistryScan,
        session: &Session,
    ) -> Vec<ImageScanRequest> {
        let mut requests = Vec::new();
        for (repository, tags) in &scan.image_to_tags {
            let repository_name = scan.short_repository_name(repository);
            for tag in tags {
                let mut args = BTreeMap::new();
                args.insert(
                    "registryName".to_string(),
                    serde_json::json!(format!("{}/{}", scan.hostname, scan.project_id)
                        .trim_end_matches('/')),
                );
                args.insert("repository".to_string(), serde_json::json!(repository_name));
                args.insert("tag".to_string(), serde_json::json!(tag));
                args.insert("useHTTP".to_string(), serde_json::json!(scan.use_http()));
                args.insert(
                    "skipTLSVerify".to_string(),
                    serde_json::json!(scan.skip_tls_verify()),
                );
                args.insert(
                    "sensor".to_string(),
                    serde_json::json!(self.config().cluster_name),
                );

                let request = ImageScanRequest {
                    wlid: String::new(),
                    image_tag: format!("{}:{}", repository, tag),
                    image_hash: String::new(),
                    container_name: String::new(),
                    job_id: Uuid::new_v4().to_string(),
                    parent_job_id: session.reporter.job_id(),
                    last_action: session.reporter.action_number(),
                    session: SessionChain {
                        action_title: "vulnerability-scan".to_string(),
                        job_ids: Vec::new(),
                        root_job_id: session.reporter.job_id(),
                        timestamp: session.reporter.timestamp(),
                    },
                    args,
                    credentialslist: scan.credentials.iter().cloned().collect(),
                };
                requests.push(request);
            }
        }
        requests
    }

    /// Uploads the repository inventory to the event receiver.
    async fn report_repositories(
        &self,
        scan: &RegistryScan,
        session: &Session,
        repos: &[String],
    ) -> Result<()> {
        if !self.config().send_report() {
            return Ok(());
        }
        let report = RepositoriesReport {
            registry_name: scan.info.registry_name.clone(),
            customer_guid: self.config().account_id.clone(),
            job_id: session.reporter.job_id(),
            repositories: repos
                .iter()
                .map(|r| RepositoryEntry {
                    repository_name: r.clone(),
                })
                .collect(),
        };
        let url = format!(
            "{}/v1/registryRepositories",
            self.config().event_receiver_url.trim_end_matches('/')
        );
        let response = self.http().post(&url).json(&report).send().await?;
        if !response.status().is_success() {
            warn!(
                status = %response.status(),
                "failed to upload registry repositories"
            );
        } else {
            info!(count = repos.len(), "uploaded registry repositories");
        }
        Ok(())
    }

    fn registry_client(&self, scan: &RegistryScan) -> Result<reqwest::Client> {
        if scan.skip_tls_verify() {
            reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| OperatorError::Configuration(e.to_string()))
        } else {
            Ok(self.http().clone())
        }
    }
}

/// Registries signal credential problems inconsistently; match the usual
/// phrasings in addition to the typed auth error.
fn is_auth_error(err: &OperatorError) -> bool {
    if matches!(err, OperatorError::RegistryAuth(_)) {
        return true;
    }
    let text = err.to_string().to_lowercase();
    AUTH_ERROR_MARKERS.iter().any(|marker| text.contains(marker))
}
