//! Scheduled-scan CronJob lifecycle.
//!
//! Each scheduler kind owns a template CronJob in the operator namespace.
//! `set` derives a unique, name-safe job name, stores the trigger request in
//! a ConfigMap of the same name, and instantiates the template; `update`
//! swaps the schedule in place; `delete` removes both objects.

use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::info;

use super::Dispatcher;
use crate::command::{Command, ARG_POLICY_SCAN};
use crate::error::{OperatorError, Result};
use crate::session::Session;

/// Annotation carrying the job id that created the schedule.
pub const ANNOTATION_JOB_ID: &str = "argus.io/job-id";
/// Annotation stamped when a schedule is updated.
pub const ANNOTATION_UPDATE_JOB_ID: &str = "argus.io/update-job-id";
/// Annotation carrying the namespace a scheduled scan addresses.
pub const ANNOTATION_TARGET_NAMESPACE: &str = "argus.io/namespace";

/// ConfigMap key holding the embedded trigger request.
const TRIGGER_REQUEST_KEY: &str = "trigger-request.json";

// CronJob names leave room for the controller's job-name suffix.
const MAX_JOB_NAME: usize = 52;

/// Which scheduler a cron command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronTemplate {
    PolicyScan,
    ImageScan,
    RegistryScan,
}

impl CronTemplate {
    fn template_name(&self) -> &'static str {
        match self {
            CronTemplate::PolicyScan => "argus-policyscan-cronjob-template",
            CronTemplate::ImageScan => "argus-imagescan-cronjob-template",
            CronTemplate::RegistryScan => "argus-registryscan-cronjob-template",
        }
    }

    fn job_prefix(&self) -> &'static str {
        match self {
            CronTemplate::PolicyScan => "policyscan-scheduled",
            CronTemplate::ImageScan => "imagescan-scheduled",
            CronTemplate::RegistryScan => "registryscan-scheduled",
        }
    }

    fn component(&self) -> &'static str {
        match self {
            CronTemplate::PolicyScan => "PolicyScanScheduler",
            CronTemplate::ImageScan => "ImageScanScheduler",
            CronTemplate::RegistryScan => "RegistryScanScheduler",
        }
    }

    fn enabled(&self, config: &crate::config::OperatorConfig) -> bool {
        match self {
            CronTemplate::PolicyScan => config.components.policy_scan_scheduler,
            CronTemplate::ImageScan => config.components.image_scan_scheduler,
            CronTemplate::RegistryScan => config.components.registry_scan_scheduler,
        }
    }
}

impl Dispatcher {
    /// Creates scheduled-scan jobs for a `set*Cron` command. Policy scans
    /// create one job per target framework; the others create a single job.
    pub(super) async fn set_scan_cron(
        &self,
        session: &Session,
        template: CronTemplate,
    ) -> Result<()> {
        if !template.enabled(self.config()) {
            return Err(OperatorError::Disabled(template.component()));
        }
        let command = &session.command;
        let schedule = command.cron_schedule().ok_or_else(|| {
            OperatorError::InvalidCommand("cron command without a schedule".to_string())
        })?;

        for target in job_targets(template, command) {
            let name = scheduled_job_name(template.job_prefix(), &target);
            info!(job = %name, schedule = %schedule, "creating scheduled scan");

            self.create_trigger_config_map(&name, command).await?;

            let mut job = self.cron_job_template(template).await?;
            configure_cron_job(
                &mut job,
                &name,
                &schedule,
                &command.job_tracking.job_id,
                &command.namespace(),
            );

            let api: Api<CronJob> =
                Api::namespaced(self.client(), &self.config().namespace);
            api.create(&PostParams::default(), &job).await?;
        }
        Ok(())
    }

    /// Replaces the schedule of an existing scheduled-scan job.
    pub(super) async fn update_scan_cron(
        &self,
        session: &Session,
        template: CronTemplate,
    ) -> Result<()> {
        if !template.enabled(self.config()) {
            return Err(OperatorError::Disabled(template.component()));
        }
        let command = &session.command;
        let params = command.cron_params().ok_or_else(|| {
            OperatorError::InvalidCommand("cron command without job parameters".to_string())
        })?;
        if params.job_name.is_empty() || params.cron_tab_schedule.is_empty() {
            return Err(OperatorError::InvalidCommand(
                "cron update needs jobName and cronTabSchedule".to_string(),
            ));
        }

        let api: Api<CronJob> = Api::namespaced(self.client(), &self.config().namespace);
        let mut job = api.get(&params.job_name).await?;
        if let Some(spec) = job.spec.as_mut() {
            spec.schedule = params.cron_tab_schedule.clone();
        }
        annotate_job_template(&mut job, ANNOTATION_UPDATE_JOB_ID, &command.job_tracking.job_id);
        api.replace(&params.job_name, &PostParams::default(), &job)
            .await?;
        info!(job = %params.job_name, schedule = %params.cron_tab_schedule, "updated scheduled scan");
        Ok(())
    }

    /// Deletes a scheduled-scan job and its trigger ConfigMap.
    pub(super) async fn delete_scan_cron(
        &self,
        session: &Session,
        template: CronTemplate,
    ) -> Result<()> {
        if !template.enabled(self.config()) {
            return Err(OperatorError::Disabled(template.component()));
        }
        let params = session.command.cron_params().ok_or_else(|| {
            OperatorError::InvalidCommand("cron command without job parameters".to_string())
        })?;
        if params.job_name.is_empty() {
            return Err(OperatorError::InvalidCommand(
                "cron delete needs jobName".to_string(),
            ));
        }

        let namespace = &self.config().namespace;
        let jobs: Api<CronJob> = Api::namespaced(self.client(), namespace);
        jobs.delete(&params.job_name, &Default::default()).await?;

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client(), namespace);
        config_maps
            .delete(&params.job_name, &Default::default())
            .await?;
        info!(job = %params.job_name, "deleted scheduled scan");
        Ok(())
    }

    async fn cron_job_template(&self, template: CronTemplate) -> Result<CronJob> {
        let api: Api<CronJob> = Api::namespaced(self.client(), &self.config().namespace);
        api.get(template.template_name()).await.map_err(|e| {
            OperatorError::Configuration(format!(
                "cron job template '{}' not found: {}",
                template.template_name(),
                e
            ))
        })
    }

    async fn create_trigger_config_map(&self, name: &str, command: &Command) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert(
            TRIGGER_REQUEST_KEY.to_string(),
            serde_json::to_string(command)?,
        );

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.config().namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        let api: Api<ConfigMap> = Api::namespaced(self.client(), &self.config().namespace);
        api.create(&PostParams::default(), &config_map).await?;
        Ok(())
    }
}

/// Target components of the derived job name. Policy scans fan out per
/// framework name in the request.
fn job_targets(template: CronTemplate, command: &Command) -> Vec<String> {
    if template == CronTemplate::PolicyScan {
        let targets: Vec<String> = command
            .args
            .get(ARG_POLICY_SCAN)
            .and_then(|v| v.get("targetNames"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if !targets.is_empty() {
            return targets;
        }
    }
    vec![String::new()]
}

/// Derives a unique, length-limited job name: prefix, optional target, and a
/// random suffix, with every run of unsupported characters collapsed to `-`.
fn scheduled_job_name(prefix: &str, target: &str) -> String {
    let suffix: u64 = rand::random();
    let raw = if target.is_empty() {
        format!("{}-{}", prefix, suffix)
    } else {
        format!("{}-{}-{}", prefix, target, suffix)
    };
    fix_job_name_limit(&sanitize_job_name(&raw))
}

fn sanitize_job_name(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new("[^A-Za-z0-9-]+").unwrap());
    invalid
        .replace_all(name, "-")
        .trim_matches('-')
        .to_string()
}

fn fix_job_name_limit(name: &str) -> String {
    if name.len() <= MAX_JOB_NAME {
        name.to_string()
    } else {
        name[..MAX_JOB_NAME].trim_end_matches('-').to_string()
    }
}

fn configure_cron_job(
    job: &mut CronJob,
    name: &str,
    schedule: &str,
    job_id: &str,
    target_namespace: &str,
) {
    job.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: job.metadata.namespace.clone(),
        labels: job.metadata.labels.clone(),
        ..Default::default()
    };
    if let Some(spec) = job.spec.as_mut() {
        spec.schedule = schedule.to_string();
    }
    annotate_job_template(job, ANNOTATION_JOB_ID, job_id);
    if !target_namespace.is_empty() {
        annotate_job_template(job, ANNOTATION_TARGET_NAMESPACE, target_namespace);
    }
}

fn annotate_job_template(job: &mut CronJob, key: &str, value: &str) {
    let Some(spec) = job.spec.as_mut() else {
        return;
    };
    let template = &mut spec.job_template;
    let pod_meta = template
        .spec
        .get_or_insert_with(Default::default)
        .template
        .metadata
        .get_or_insert_with(Default::default);
    pod_meta
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}
