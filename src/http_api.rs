//! HTTP trigger endpoint.
//!
//! `POST /v1/triggerAction` accepts a command batch; every entry becomes one
//! worker-pool job. Commands the pool cannot take are counted and reported in
//! the response so callers can retry.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::command::Commands;
use crate::config::OperatorConfig;
use crate::error::{OperatorError, Result};
use crate::pool::WorkerPool;
use crate::session::{self, CHANNEL_REST_API};

/// Shared state of the trigger endpoint.
#[derive(Clone)]
pub struct ApiState {
    config: Arc<OperatorConfig>,
    http: reqwest::Client,
    pool: Arc<WorkerPool>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    accepted: usize,
    dropped: usize,
}

/// Builds the trigger router.
pub fn router(config: Arc<OperatorConfig>, http: reqwest::Client, pool: Arc<WorkerPool>) -> Router {
    let state = ApiState { config, http, pool };
    Router::new()
        .route("/v1/triggerAction", post(trigger_action))
        .with_state(state)
}

/// Serves the trigger endpoint until the listener fails.
pub async fn serve(
    config: Arc<OperatorConfig>,
    http: reqwest::Client,
    pool: Arc<WorkerPool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.trigger_port));
    let app = router(config, http, pool);
    info!(%addr, "serving trigger endpoint");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| OperatorError::Configuration(format!("cannot bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| OperatorError::Http(e.to_string()))
}

async fn trigger_action(
    State(state): State<ApiState>,
    Json(batch): Json<Commands>,
) -> (StatusCode, Json<TriggerResponse>) {
    let mut accepted = 0;
    let mut dropped = 0;

    for command in batch.commands {
        let session = session::new_session(
            &state.config,
            state.http.clone(),
            command.clone(),
            CHANNEL_REST_API,
            &command.job_tracking.parent_id,
            &command.job_tracking.job_id,
            1,
        );
        match state.pool.try_invoke(session) {
            Ok(()) => accepted += 1,
            Err(e) => {
                warn!(command = %command.command_name, error = %e, "failed to invoke job");
                dropped += 1;
            }
        }
    }

    let status = if dropped == 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(TriggerResponse { accepted, dropped }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_body_parses() {
        let body = r#"{
            "commands": [
                {"commandName": "runPolicyScan", "wildWlid": "wlid://cluster-prod/"},
                {"commandName": "scanImages", "wlid": "wlid://cluster-prod/namespace-web/deployment-api"}
            ]
        }"#;
        let batch: Commands = serde_json::from_str(body).unwrap();
        assert_eq!(batch.commands.len(), 2);
    }

    #[test]
    fn test_empty_batch_is_valid() {
        let batch: Commands = serde_json::from_str(r#"{"commands": []}"#).unwrap();
        assert!(batch.commands.is_empty());
        let batch: Commands = serde_json::from_str("{}").unwrap();
        assert!(batch.commands.is_empty());
    }

    #[test]
    fn test_trigger_response_shape() {
        let response = TriggerResponse {
            accepted: 2,
            dropped: 1,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["accepted"], 2);
        assert_eq!(json["dropped"], 1);
    }
}
