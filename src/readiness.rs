//! Startup actions and downstream readiness gating.
//!
//! Some command kinds must not be dispatched before their scanner is up.
//! Each kind maps to a probe that polls the scanner's readiness endpoint;
//! startup actions run their probe first and are then submitted like any
//! other command.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::command::{Command, CommandKind, ARG_POLICY_SCAN};
use crate::config::OperatorConfig;
use crate::pool::WorkerPool;
use crate::session::{self, CHANNEL_STARTUP};
use crate::wlid::build_wild_wlid;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Blocks until the scanner serving `kind` reports ready. Kinds without a
/// probe return immediately.
pub async fn wait_for_readiness(config: &OperatorConfig, http: &reqwest::Client, kind: CommandKind) {
    match kind {
        CommandKind::ScanImages | CommandKind::ScanFilteredSbom | CommandKind::ScanRegistry => {
            let url = format!(
                "{}/v1/readyz",
                config.image_scanner_url.trim_end_matches('/')
            );
            wait_for_url(http, &url, Probe::Get, "image scanner").await;
        }
        CommandKind::RunPolicyScan => {
            let url = format!("{}/readyz", config.policy_scanner_url.trim_end_matches('/'));
            wait_for_url(http, &url, Probe::Head, "policy scanner").await;
        }
        _ => {}
    }
}

enum Probe {
    Get,
    Head,
}

async fn wait_for_url(http: &reqwest::Client, url: &str, probe: Probe, what: &str) {
    let mut delay = INITIAL_RETRY_DELAY;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let request = match probe {
            Probe::Get => http.get(url),
            Probe::Head => http.head(url),
        };
        match request.send().await {
            Ok(response) if (200..=203).contains(&response.status().as_u16()) => {
                info!(url = %url, attempt, "{} is ready", what);
                return;
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "{} not ready yet", what);
            }
            Err(e) => {
                warn!(url = %url, error = %e, "{} readiness probe failed", what);
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_RETRY_DELAY);
    }
}

/// The actions fired once at startup: a full-cluster policy scan over the
/// default frameworks.
pub fn startup_actions(config: &OperatorConfig) -> Vec<Command> {
    let mut scan = Command::new(CommandKind::RunPolicyScan);
    scan.wild_wlid = build_wild_wlid(&config.cluster_name, "");
    scan.args.insert(
        ARG_POLICY_SCAN.to_string(),
        serde_json::json!({
            "targetType": "framework",
            "targetNames": ["allcontrols", "nsa", "mitre"],
            "hostScanner": false,
        }),
    );
    vec![scan]
}

/// Gates each startup action on its readiness probe, then submits it.
pub fn trigger_startup_actions(
    config: Arc<OperatorConfig>,
    http: reqwest::Client,
    pool: Arc<WorkerPool>,
) {
    for action in startup_actions(&config) {
        let config = Arc::clone(&config);
        let http = http.clone();
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            wait_for_readiness(&config, &http, action.command_name).await;
            let session = session::new_session(
                &config,
                http.clone(),
                action,
                CHANNEL_STARTUP,
                "",
                &uuid::Uuid::new_v4().to_string(),
                1,
            );
            pool.invoke_or_log(session);
        });
    }
}
