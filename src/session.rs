//! Per-command sessions and their progress reporters.
//!
//! A [`Session`] carries one command and the [`Reporter`] that streams its
//! progress to the backend event receiver. All outbound reports are
//! serialized through a single background sender task per session, so events
//! arrive in call order. Send failures go to the session's error channel,
//! which a logging task drains until the session ends.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::command::Command;
use crate::config::OperatorConfig;
use crate::error::OperatorError;

/// Where a session's command came from. Used as the reporter name upstream.
pub const CHANNEL_NOTIFICATIONS: &str = "websocket";
pub const CHANNEL_REST_API: &str = "rest-api";
pub const CHANNEL_WATCHER: &str = "watcher";
pub const CHANNEL_STARTUP: &str = "startup";

/// Progress state reported for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,
    Success,
    Done,
    Failed,
}

/// One report frame posted to the event receiver.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub account_id: String,
    pub reporter: String,
    pub target: String,
    pub action_name: String,
    #[serde(rename = "jobID")]
    pub job_id: String,
    #[serde(rename = "parentJobID")]
    pub parent_job_id: String,
    pub action_number: u32,
    pub details: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ReportState {
    target: String,
    action_name: String,
    job_id: String,
    parent_job_id: String,
    action_number: u32,
    details: String,
}

/// Structured progress channel for one session.
///
/// Implementations must be safe to share across tasks; setters only stage
/// state for the next send.
pub trait Reporter: Send + Sync {
    fn set_target(&self, target: &str);
    fn set_action_name(&self, name: &str);
    fn set_job_id(&self, job_id: &str);
    fn set_parent_action(&self, parent: &str);
    fn set_action_number(&self, n: u32);
    fn set_details(&self, details: &str);

    fn job_id(&self) -> String;
    fn parent_action(&self) -> String;
    fn action_number(&self) -> u32;
    fn timestamp(&self) -> DateTime<Utc>;

    fn send_status(&self, status: JobStatus, send_report: bool);
    fn send_error(&self, err: &OperatorError, send_report: bool, is_fatal: bool);
    fn send_details(&self, details: &str, send_report: bool);

    /// Sends the initial "started" frame in the background.
    fn send_as_routine(&self, send_report: bool) {
        self.send_status(JobStatus::Started, send_report);
    }
}

/// Reporter posting frames to the configured event receiver.
pub struct BackendReporter {
    account_id: String,
    reporter_name: String,
    created_at: DateTime<Utc>,
    state: Mutex<ReportState>,
    frames: mpsc::UnboundedSender<JobReport>,
}

impl BackendReporter {
    fn new(
        config: &OperatorConfig,
        http: reqwest::Client,
        reporter_name: &str,
        err_tx: mpsc::UnboundedSender<OperatorError>,
    ) -> Arc<Self> {
        let (frames, mut frame_rx) = mpsc::unbounded_channel::<JobReport>();
        let url = format!(
            "{}/v1/sysreport",
            config.event_receiver_url.trim_end_matches('/')
        );

        // Single sender task per session keeps frames in call order.
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let result = http.post(&url).json(&frame).send().await;
                let failure = match result {
                    Ok(resp) if resp.status().is_success() => None,
                    Ok(resp) => Some(OperatorError::Http(format!(
                        "event receiver returned {}",
                        resp.status()
                    ))),
                    Err(e) => Some(OperatorError::Http(e.to_string())),
                };
                if let Some(err) = failure {
                    // Receiver may already be gone during shutdown.
                    let _ = err_tx.send(err);
                }
            }
        });

        Arc::new(BackendReporter {
            account_id: config.account_id.clone(),
            reporter_name: reporter_name.to_string(),
            created_at: Utc::now(),
            state: Mutex::new(ReportState {
                target: String::new(),
                action_name: String::new(),
                job_id: String::new(),
                parent_job_id: String::new(),
                action_number: 1,
                details: String::new(),
            }),
            frames,
        })
    }

    fn frame(&self, status: JobStatus, error: Option<String>, fatal: Option<bool>) -> JobReport {
        let state = self.state.lock().unwrap();
        JobReport {
            account_id: self.account_id.clone(),
            reporter: self.reporter_name.clone(),
            target: state.target.clone(),
            action_name: state.action_name.clone(),
            job_id: state.job_id.clone(),
            parent_job_id: state.parent_job_id.clone(),
            action_number: state.action_number,
            details: state.details.clone(),
            status,
            error,
            fatal,
            timestamp: Utc::now(),
        }
    }

    fn push(&self, frame: JobReport) {
        // Fails only when the sender task is gone, i.e. during shutdown.
        let _ = self.frames.send(frame);
    }
}

impl Reporter for BackendReporter {
    fn set_target(&self, target: &str) {
        self.state.lock().unwrap().target = target.to_string();
    }

    fn set_action_name(&self, name: &str) {
        self.state.lock().unwrap().action_name = name.to_string();
    }

    fn set_job_id(&self, job_id: &str) {
        self.state.lock().unwrap().job_id = job_id.to_string();
    }

    fn set_parent_action(&self, parent: &str) {
        self.state.lock().unwrap().parent_job_id = parent.to_string();
    }

    fn set_action_number(&self, n: u32) {
        self.state.lock().unwrap().action_number = n;
    }

    fn set_details(&self, details: &str) {
        self.state.lock().unwrap().details = details.to_string();
    }

    fn job_id(&self) -> String {
        self.state.lock().unwrap().job_id.clone()
    }

    fn parent_action(&self) -> String {
        self.state.lock().unwrap().parent_job_id.clone()
    }

    fn action_number(&self) -> u32 {
        self.state.lock().unwrap().action_number
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn send_status(&self, status: JobStatus, send_report: bool) {
        if send_report {
            self.push(self.frame(status, None, None));
        }
    }

    fn send_error(&self, err: &OperatorError, send_report: bool, is_fatal: bool) {
        if send_report {
            self.push(self.frame(
                JobStatus::Failed,
                Some(err.to_string()),
                Some(is_fatal),
            ));
        }
    }

    fn send_details(&self, details: &str, send_report: bool) {
        self.set_details(details);
        if send_report {
            self.push(self.frame(JobStatus::Started, None, None));
        }
    }
}

/// Reporter used when no event receiver is configured. Still tracks job
/// identity so handlers can chain jobs; sends nowhere.
pub struct NullReporter {
    created_at: DateTime<Utc>,
    state: Mutex<ReportState>,
}

impl NullReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(NullReporter {
            created_at: Utc::now(),
            state: Mutex::new(ReportState {
                target: String::new(),
                action_name: String::new(),
                job_id: String::new(),
                parent_job_id: String::new(),
                action_number: 1,
                details: String::new(),
            }),
        })
    }
}

impl Reporter for NullReporter {
    fn set_target(&self, target: &str) {
        self.state.lock().unwrap().target = target.to_string();
    }

    fn set_action_name(&self, name: &str) {
        self.state.lock().unwrap().action_name = name.to_string();
    }

    fn set_job_id(&self, job_id: &str) {
        self.state.lock().unwrap().job_id = job_id.to_string();
    }

    fn set_parent_action(&self, parent: &str) {
        self.state.lock().unwrap().parent_job_id = parent.to_string();
    }

    fn set_action_number(&self, n: u32) {
        self.state.lock().unwrap().action_number = n;
    }

    fn set_details(&self, details: &str) {
        self.state.lock().unwrap().details = details.to_string();
    }

    fn job_id(&self) -> String {
        self.state.lock().unwrap().job_id.clone()
    }

    fn parent_action(&self) -> String {
        self.state.lock().unwrap().parent_job_id.clone()
    }

    fn action_number(&self) -> u32 {
        self.state.lock().unwrap().action_number
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn send_status(&self, _status: JobStatus, _send_report: bool) {}

    fn send_error(&self, _err: &OperatorError, _send_report: bool, _is_fatal: bool) {}

    fn send_details(&self, details: &str, _send_report: bool) {
        self.set_details(details);
    }
}

/// A command plus the reporter tracking it. Created by producers, consumed
/// once by a pool worker.
#[derive(Clone)]
pub struct Session {
    pub command: Command,
    pub reporter: Arc<dyn Reporter>,
}

/// Creates a session for `command`.
///
/// Picks a [`BackendReporter`] when an event receiver is configured and a
/// [`NullReporter`] otherwise, generates a job id when the producer supplied
/// none, and starts the error-drain task for the session.
pub fn new_session(
    config: &OperatorConfig,
    http: reqwest::Client,
    command: Command,
    channel: &str,
    parent_id: &str,
    job_id: &str,
    action_number: u32,
) -> Session {
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<OperatorError>();

    let reporter: Arc<dyn Reporter> = if config.send_report() {
        BackendReporter::new(config, http, channel, err_tx)
    } else {
        NullReporter::new()
    };

    let target = match command.id() {
        "" => format!("{:?}", command.args.keys().collect::<Vec<_>>()),
        id => id.to_string(),
    };
    reporter.set_target(&target);

    let job_id = if job_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        job_id.to_string()
    };
    reporter.set_job_id(&job_id);
    reporter.set_parent_action(parent_id);
    reporter.set_action_number(action_number);
    reporter.set_action_name(command.command_name.as_str());

    // Drains send failures until the reporter's sender task exits.
    tokio::spawn(async move {
        while let Some(err) = err_rx.recv().await {
            error!(error = %err, "failed to send job report");
        }
    });

    reporter.send_as_routine(config.send_report());
    info!(job_id = %job_id, command = %command.command_name, "session opened");

    Session { command, reporter }
}
