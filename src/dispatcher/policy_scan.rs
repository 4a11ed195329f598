//! Policy (configuration) scan handler.
//!
//! Posts the scan request to the policy scanner. The scanner answers with a
//! scan id and keeps working; when the command belongs to a parent job the
//! handler registers a re-handle callback that polls the status endpoint
//! until the scanner stops reporting `busy`.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::Dispatcher;
use crate::command::ARG_POLICY_SCAN;
use crate::error::{OperatorError, Result};
use crate::rehandler::RehandleCallback;
use crate::session::{JobStatus, Reporter, Session};

/// Delay between policy scan status polls.
pub const STATUS_POLL_DELAY: Duration = Duration::from_secs(40);

#[derive(Debug, Clone, Deserialize)]
struct PolicyScanResponse {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    response_type: String,
    #[serde(default)]
    response: serde_json::Value,
}

const RESPONSE_BUSY: &str = "busy";
const RESPONSE_ERROR: &str = "error";

impl Dispatcher {
    /// Handles `runPolicyScan`.
    pub(super) async fn run_policy_scan(&self, session: &Session) -> Result<()> {
        if !self.config().components.policy_scanner {
            return Err(OperatorError::Disabled("PolicyScanner"));
        }

        let request = session
            .command
            .args
            .get(ARG_POLICY_SCAN)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        let url = format!(
            "{}/v1/scan",
            self.config().policy_scanner_url.trim_end_matches('/')
        );
        let response = self.http().post(&url).json(&request).send().await?;
        let scan: PolicyScanResponse = response.json().await?;

        if scan.response_type == RESPONSE_ERROR {
            let err = OperatorError::Http(format!(
                "policy scan '{}' returned an error: {}",
                scan.id, scan.response
            ));
            error!(scan_id = %scan.id, error = %err, "policy scan rejected");
            session
                .reporter
                .send_error(&err, self.config().send_report(), false);
            return Ok(());
        }
        info!(scan_id = %scan.id, "policy scan triggered successfully");

        // Only chained commands await completion; fire-and-forget otherwise.
        if !session.reporter.parent_action().is_empty() {
            let callback = self.status_poll_callback(&scan.id, Arc::clone(&session.reporter));
            self.rehandler()
                .schedule("policy-scan-status", callback, STATUS_POLL_DELAY)
                .await;
        }
        Ok(())
    }

    /// Builds the callback polling one scan id. Returns `(true, delay)` while
    /// the scanner reports busy and finalizes the job otherwise.
    fn status_poll_callback(&self, scan_id: &str, reporter: Arc<dyn Reporter>) -> RehandleCallback {
        let http = self.http().clone();
        let send_report = self.config().send_report();
        let url = format!(
            "{}/v1/status?scanID={}",
            self.config().policy_scanner_url.trim_end_matches('/'),
            scan_id
        );
        let scan_id = scan_id.to_string();

        Arc::new(move || {
            let http = http.clone();
            let url = url.clone();
            let scan_id = scan_id.clone();
            let reporter = Arc::clone(&reporter);
            Box::pin(async move {
                let scan: PolicyScanResponse = match fetch_status(&http, &url).await {
                    Ok(scan) => scan,
                    Err(e) => {
                        error!(scan_id = %scan_id, error = %e, "policy scan status poll failed");
                        reporter.send_error(&e, send_report, false);
                        return (false, None);
                    }
                };

                if scan.response_type == RESPONSE_BUSY {
                    info!(
                        scan_id = %scan_id,
                        "policy scan still busy, polling again in {:?}",
                        STATUS_POLL_DELAY
                    );
                    return (true, Some(STATUS_POLL_DELAY));
                }

                info!(scan_id = %scan_id, "policy scan finished");
                reporter.send_status(JobStatus::Done, send_report);
                (false, None)
            })
        })
    }
}

async fn fetch_status(http: &reqwest::Client, url: &str) -> Result<PolicyScanResponse> {
    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(OperatorError::Http(format!(
            "status endpoint returned {}",
            response.status()
        )));
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let json = r#"{"id": "scan-1", "type": "busy", "response": {}}"#;
        let scan: PolicyScanResponse = serde_json::from_str(json).unwrap();
        assert_eq!(scan.id, "scan-1");
        assert_eq!(scan.response_type, RESPONSE_BUSY);
    }

    #[test]
    fn test_response_defaults_are_lenient() {
        let scan: PolicyScanResponse = serde_json::from_str("{}").unwrap();
        assert!(scan.id.is_empty());
        assert!(scan.response_type.is_empty());
        assert!(scan.response.is_null());
    }
}
