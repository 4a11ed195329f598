//! Operator configuration.
//!
//! Loaded from a JSON file (the in-cluster ConfigMap mounts one) and
//! selectively overridable from the command line. Capability toggles decide
//! which command kinds the operator serves.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::command::CommandKind;
use crate::error::{OperatorError, Result};

/// Default number of concurrent command workers.
pub const DEFAULT_CONCURRENCY_WORKERS: usize = 3;
/// Default port of the trigger REST endpoint.
pub const DEFAULT_TRIGGER_PORT: u16 = 4002;

/// Per-component enable switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Components {
    pub image_scanner: bool,
    pub policy_scanner: bool,
    pub image_scan_scheduler: bool,
    pub policy_scan_scheduler: bool,
    pub registry_scan_scheduler: bool,
}

impl Default for Components {
    fn default() -> Self {
        Components {
            image_scanner: true,
            policy_scanner: true,
            image_scan_scheduler: true,
            policy_scan_scheduler: true,
            registry_scan_scheduler: true,
        }
    }
}

/// Operator configuration as loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Backend account this cluster reports under.
    pub account_id: String,
    /// Cluster name used when building workload identities.
    pub cluster_name: String,
    /// Namespace the operator and its scheduled jobs live in.
    pub namespace: String,
    /// Base URL of the image (CVE) scanner service. Empty disables calls.
    pub image_scanner_url: String,
    /// Base URL of the policy scanner service. Empty disables calls.
    pub policy_scanner_url: String,
    /// Event receiver REST URL. Empty turns the reporter into a no-op sink.
    pub event_receiver_url: String,
    /// Notification gateway websocket URL. Empty disables the stream producer.
    pub gateway_websocket_url: String,
    /// Port for the `POST /v1/triggerAction` endpoint.
    pub trigger_port: u16,
    /// Number of workers consuming the command channel.
    pub concurrency_workers: usize,
    /// Cooldown queue capacity for watch-event dedup.
    pub event_queue_size: usize,
    /// Cooldown TTL in seconds for watch-event dedup.
    pub event_cooldown_seconds: u64,
    /// Expand scoped commands of non-image-scan kinds (off by default).
    pub scoped_expansion: bool,
    pub components: Components,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            account_id: String::new(),
            cluster_name: String::new(),
            namespace: "argus-system".to_string(),
            image_scanner_url: String::new(),
            policy_scanner_url: String::new(),
            event_receiver_url: String::new(),
            gateway_websocket_url: String::new(),
            trigger_port: DEFAULT_TRIGGER_PORT,
            concurrency_workers: DEFAULT_CONCURRENCY_WORKERS,
            event_queue_size: crate::watcher::cooldown::DEFAULT_QUEUE_SIZE,
            event_cooldown_seconds: 5,
            scoped_expansion: false,
            components: Components::default(),
        }
    }
}

impl OperatorConfig {
    /// Loads the configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OperatorError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: OperatorConfig = serde_json::from_str(&raw).map_err(|e| {
            OperatorError::Configuration(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(OperatorError::Configuration(
                "clusterName must be set".to_string(),
            ));
        }
        if self.concurrency_workers == 0 {
            return Err(OperatorError::Configuration(
                "concurrencyWorkers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether job reports are sent upstream at all.
    pub fn send_report(&self) -> bool {
        !self.event_receiver_url.is_empty()
    }
}

/// Namespaces a command kind must never operate in. Mutating actions keep out
/// of cluster system namespaces; scans are unrestricted.
pub fn ignored_namespaces(kind: CommandKind) -> &'static [String] {
    static TABLE: OnceLock<HashMap<CommandKind, Vec<String>>> = OnceLock::new();
    static EMPTY: Vec<String> = Vec::new();
    let table = TABLE.get_or_init(|| {
        let system: Vec<String> = vec![
            "kube-system".to_string(),
            "kube-public".to_string(),
            "kube-node-lease".to_string(),
        ];
        let mut m = HashMap::new();
        for kind in [
            CommandKind::SetPolicyScanCron,
            CommandKind::UpdatePolicyScanCron,
            CommandKind::DeletePolicyScanCron,
            CommandKind::SetImageScanCron,
            CommandKind::UpdateImageScanCron,
            CommandKind::DeleteImageScanCron,
            CommandKind::SetRegistryScanCron,
            CommandKind::UpdateRegistryScanCron,
            CommandKind::DeleteRegistryScanCron,
        ] {
            m.insert(kind, system.clone());
        }
        m
    });
    table.get(&kind).map(Vec::as_slice).unwrap_or(&EMPTY)
}

/// True when `kind` is forbidden in `namespace`.
pub fn is_namespace_ignored(kind: CommandKind, namespace: &str) -> bool {
    !namespace.is_empty() && ignored_namespaces(kind).iter().any(|ns| ns == namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.trigger_port, DEFAULT_TRIGGER_PORT);
        assert_eq!(config.concurrency_workers, DEFAULT_CONCURRENCY_WORKERS);
        assert!(!config.scoped_expansion);
        assert!(config.components.image_scanner);
        assert!(!config.send_report());
    }

    #[test]
    fn test_parse_partial_config() {
        let json = r#"{
            "accountId": "acc-1",
            "clusterName": "prod",
            "imageScannerUrl": "http://argus-imagescan:8080",
            "eventReceiverUrl": "https://report.example.com",
            "components": {"policyScanner": false}
        }"#;
        let config: OperatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cluster_name, "prod");
        assert!(config.send_report());
        assert!(!config.components.policy_scanner);
        // unnamed components keep their defaults
        assert!(config.components.image_scanner);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_cluster_name() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ignored_namespaces() {
        assert!(is_namespace_ignored(
            CommandKind::SetPolicyScanCron,
            "kube-system"
        ));
        assert!(!is_namespace_ignored(CommandKind::ScanImages, "kube-system"));
        assert!(!is_namespace_ignored(CommandKind::SetPolicyScanCron, "web"));
        assert!(!is_namespace_ignored(CommandKind::SetPolicyScanCron, ""));
    }
}
