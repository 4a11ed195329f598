//! Command envelopes received from the notification stream, the trigger
//! endpoint, the watch engine, and the cron re-trigger path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::wlid;

/// Designator attribute carrying the namespace a scoped command addresses.
pub const ATTR_NAMESPACE: &str = "namespace";
/// Designator attribute carrying a crontab schedule for cron commands.
pub const ATTR_CRON_SCHEDULE: &str = "cronTabSchedule";

/// Command args key holding the per-container data attached by the watch engine.
pub const ARG_CONTAINER_DATA: &str = "containerData";
/// Command args key holding a snapshot of the pod the command originated from.
pub const ARG_POD: &str = "pod";
/// Command args key holding a container-name → imageID override map.
pub const ARG_CONTAINER_TO_IMAGE_IDS: &str = "containerToImageIDs";
/// Command args key holding the policy scan request payload.
pub const ARG_POLICY_SCAN: &str = "scanV1";
/// Command args key holding registry descriptor fields.
pub const ARG_REGISTRY_INFO: &str = "registryInfo";
/// Command args key holding cron job parameters (name + schedule).
pub const ARG_CRON_PARAMS: &str = "cronJobParams";

/// The action a command requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "scanImages")]
    ScanImages,
    #[serde(rename = "scanFilteredSbom")]
    ScanFilteredSbom,
    #[serde(rename = "runPolicyScan")]
    RunPolicyScan,
    #[serde(rename = "setPolicyScanCron")]
    SetPolicyScanCron,
    #[serde(rename = "updatePolicyScanCron")]
    UpdatePolicyScanCron,
    #[serde(rename = "deletePolicyScanCron")]
    DeletePolicyScanCron,
    #[serde(rename = "setImageScanCron")]
    SetImageScanCron,
    #[serde(rename = "updateImageScanCron")]
    UpdateImageScanCron,
    #[serde(rename = "deleteImageScanCron")]
    DeleteImageScanCron,
    #[serde(rename = "scanRegistry")]
    ScanRegistry,
    #[serde(rename = "testRegistryConnectivity")]
    TestRegistryConnectivity,
    #[serde(rename = "setRegistryScanCron")]
    SetRegistryScanCron,
    #[serde(rename = "updateRegistryScanCron")]
    UpdateRegistryScanCron,
    #[serde(rename = "deleteRegistryScanCron")]
    DeleteRegistryScanCron,
}

impl CommandKind {
    /// Kinds that are always dispatched as a single request, even when the
    /// envelope carries wildcards or designators.
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            CommandKind::RunPolicyScan
                | CommandKind::SetPolicyScanCron
                | CommandKind::UpdatePolicyScanCron
                | CommandKind::DeletePolicyScanCron
                | CommandKind::SetImageScanCron
                | CommandKind::UpdateImageScanCron
                | CommandKind::DeleteImageScanCron
                | CommandKind::SetRegistryScanCron
                | CommandKind::UpdateRegistryScanCron
                | CommandKind::DeleteRegistryScanCron
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::ScanImages => "scanImages",
            CommandKind::ScanFilteredSbom => "scanFilteredSbom",
            CommandKind::RunPolicyScan => "runPolicyScan",
            CommandKind::SetPolicyScanCron => "setPolicyScanCron",
            CommandKind::UpdatePolicyScanCron => "updatePolicyScanCron",
            CommandKind::DeletePolicyScanCron => "deletePolicyScanCron",
            CommandKind::SetImageScanCron => "setImageScanCron",
            CommandKind::UpdateImageScanCron => "updateImageScanCron",
            CommandKind::DeleteImageScanCron => "deleteImageScanCron",
            CommandKind::ScanRegistry => "scanRegistry",
            CommandKind::TestRegistryConnectivity => "testRegistryConnectivity",
            CommandKind::SetRegistryScanCron => "setRegistryScanCron",
            CommandKind::UpdateRegistryScanCron => "updateRegistryScanCron",
            CommandKind::DeleteRegistryScanCron => "deleteRegistryScanCron",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-tracking metadata threaded through from the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTracking {
    #[serde(default, rename = "jobID")]
    pub job_id: String,
    #[serde(default, rename = "parentID")]
    pub parent_id: String,
    #[serde(default, rename = "lastActionNumber")]
    pub last_action_number: u32,
}

/// A selector attached to a command describing the scope it addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Designator {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A single command envelope, immutable within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_name: CommandKind,
    #[serde(default)]
    pub wlid: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub wild_wlid: String,
    #[serde(default)]
    pub wild_sid: String,
    #[serde(default)]
    pub designators: Vec<Designator>,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    #[serde(default)]
    pub job_tracking: JobTracking,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Command {
            command_name: kind,
            wlid: String::new(),
            sid: String::new(),
            wild_wlid: String::new(),
            wild_sid: String::new(),
            designators: Vec::new(),
            args: BTreeMap::new(),
            job_tracking: JobTracking::default(),
        }
    }

    /// The primary target id: wlid, wildcard wlid, or sid — whichever is set.
    pub fn id(&self) -> &str {
        if !self.wlid.is_empty() {
            &self.wlid
        } else if !self.wild_wlid.is_empty() {
            &self.wild_wlid
        } else if !self.sid.is_empty() {
            &self.sid
        } else {
            &self.wild_sid
        }
    }

    /// A command is scoped when it addresses multiple targets that must be
    /// expanded before execution.
    pub fn is_scoped(&self) -> bool {
        !self.wild_wlid.is_empty() || !self.wild_sid.is_empty() || !self.designators.is_empty()
    }

    /// Namespace the command operates in, derived from its target id.
    pub fn namespace(&self) -> String {
        wlid::namespace_of(self.id())
    }

    /// Namespaces addressed by a scoped command: designator namespaces when
    /// present, otherwise the namespace of the wildcard target. An empty
    /// result element means "all namespaces".
    pub fn scope_namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .designators
            .iter()
            .filter_map(|d| d.attributes.get(ATTR_NAMESPACE).cloned())
            .collect();
        if namespaces.is_empty() {
            namespaces.push(self.namespace());
        }
        namespaces
    }

    /// String arg accessor for flat argument values.
    pub fn string_arg(&self, key: &str) -> Option<String> {
        self.args.get(key).and_then(|v| v.as_str()).map(str::to_string)
    }

    /// Crontab schedule: cron params arg first, flat arg next, then the first
    /// designator (the backend puts it there on older payloads).
    pub fn cron_schedule(&self) -> Option<String> {
        if let Some(params) = self.cron_params() {
            if !params.cron_tab_schedule.is_empty() {
                return Some(params.cron_tab_schedule);
            }
        }
        if let Some(s) = self.string_arg(ATTR_CRON_SCHEDULE) {
            return Some(s);
        }
        self.designators
            .first()
            .and_then(|d| d.attributes.get(ATTR_CRON_SCHEDULE).cloned())
    }

    /// Cron job parameters from the args, when present and well-formed.
    pub fn cron_params(&self) -> Option<CronJobParams> {
        let value = self.args.get(ARG_CRON_PARAMS)?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// Parameters identifying an in-cluster scheduled-scan job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobParams {
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub cron_tab_schedule: String,
}

/// Batch envelope: list of commands received on either transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default)]
    pub commands: Vec<Command>,
}
