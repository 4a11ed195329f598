//! Argus Kubernetes Operator
//!
//! Routes scan commands from the notification gateway, the trigger REST
//! endpoint, and the cluster watchers to the Argus scanner services.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! argus-operator --config /etc/argus/config.json
//!
//! # Run with custom log level
//! RUST_LOG=debug argus-operator --config /etc/argus/config.json
//! ```

use argus_operator::dispatcher::Dispatcher;
use argus_operator::notifications::NotificationHandler;
use argus_operator::pool::WorkerPool;
use argus_operator::readiness;
use argus_operator::rehandler::ResponseRehandler;
use argus_operator::watcher::WatchHandler;
use argus_operator::{http_api, CommandKind, OperatorConfig};
use clap::Parser;
use kube::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Argus Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "argus-operator")]
#[command(version, about = "Kubernetes operator for the Argus scanner services")]
struct Args {
    /// Path to the operator configuration file
    #[arg(long, default_value = "/etc/argus/config.json")]
    config: PathBuf,

    /// Override the trigger endpoint port
    #[arg(long)]
    trigger_port: Option<u16>,

    /// Override the number of command workers
    #[arg(long)]
    concurrency_workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    let mut config = OperatorConfig::load(&args.config)?;
    if let Some(port) = args.trigger_port {
        config.trigger_port = port;
    }
    if let Some(workers) = args.concurrency_workers {
        config.concurrency_workers = workers;
    }
    let config = Arc::new(config);

    info!("Starting Argus Kubernetes Operator");
    info!("Cluster: {}", config.cluster_name);
    info!("Workers: {}", config.concurrency_workers);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let http = reqwest::Client::new();
    let rehandler = ResponseRehandler::new();
    let dispatcher = Dispatcher::new(
        Arc::clone(&config),
        client.clone(),
        http.clone(),
        rehandler.clone(),
    );

    let pool = {
        let dispatcher = Arc::clone(&dispatcher);
        Arc::new(WorkerPool::new(
            config.concurrency_workers,
            Arc::new(move |session| {
                let dispatcher = Arc::clone(&dispatcher);
                Box::pin(async move { dispatcher.handle(session).await })
            }),
        ))
    };

    // Notification stream producer
    let notifications_handle = {
        let handler =
            NotificationHandler::new(Arc::clone(&config), http.clone(), Arc::clone(&pool));
        tokio::spawn(async move { handler.run().await })
    };

    // Trigger REST endpoint
    let api_handle = {
        let config = Arc::clone(&config);
        let http = http.clone();
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(e) = http_api::serve(config, http, pool).await {
                error!("Trigger endpoint error: {}", e);
            }
        })
    };

    // Cluster watchers, gated on the image scanner being ready
    let watch_handle = {
        let config = Arc::clone(&config);
        let http = http.clone();
        let pool = Arc::clone(&pool);
        let client = client.clone();
        tokio::spawn(async move {
            info!("Waiting for the image scanner before starting watchers");
            readiness::wait_for_readiness(&config, &http, CommandKind::ScanImages).await;

            let watch_handler = WatchHandler::new(config, client, http);
            let pods = {
                let handler = Arc::clone(&watch_handler);
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { handler.pod_watch(pool).await })
            };
            let sboms = {
                let handler = Arc::clone(&watch_handler);
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { handler.sbom_watch(pool).await })
            };
            let _ = tokio::join!(pods, sboms);
        })
    };

    // Startup actions fire once their scanner reports ready
    readiness::trigger_startup_actions(Arc::clone(&config), http.clone(), Arc::clone(&pool));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = notifications_handle => {
            if let Err(e) = result {
                error!("Notification producer task failed: {}", e);
            }
        }
        result = api_handle => {
            if let Err(e) = result {
                error!("Trigger endpoint task failed: {}", e);
            }
        }
        result = watch_handle => {
            if let Err(e) = result {
                error!("Watch engine task failed: {}", e);
            }
        }
    }

    info!("Argus Operator shutting down");
    Ok(())
}
