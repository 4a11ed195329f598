//! Bounded worker pool consuming command sessions.
//!
//! Producers hand sessions to [`WorkerPool::try_invoke`], which fails
//! synchronously when the pool is saturated. Dropping commands under load is
//! intentional back-pressure; producers log and move on. A worker that
//! panics is replaced by its own recovery loop, so a bad handler never takes
//! the pool down.

use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::error::{OperatorError, Result};
use crate::session::Session;

/// dyn-compatible future alias for job handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The function every worker runs for a session.
pub type JobHandler = Arc<dyn Fn(Session) -> BoxFuture<()> + Send + Sync>;

/// Fixed-size pool of workers draining a shared session channel.
pub struct WorkerPool {
    tx: mpsc::Sender<Session>,
    workers: usize,
}

impl WorkerPool {
    /// Spawns `workers` consumer tasks running `handler` per session.
    pub fn new(workers: usize, handler: JobHandler) -> Self {
        let (tx, rx) = mpsc::channel::<Session>(workers.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let session = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(session) = session else {
                        // All producers are gone; drain complete.
                        break;
                    };
                    let job = std::panic::AssertUnwindSafe(handler(session)).catch_unwind();
                    if let Err(panic) = job.await {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(worker_id, panic = %msg, "worker recovered from panic");
                    }
                }
            });
        }

        WorkerPool { tx, workers: workers.max(1) }
    }

    /// Submits a session without blocking. Errors when every worker is busy
    /// and the hand-off slot is taken.
    pub fn try_invoke(&self, session: Session) -> Result<()> {
        self.tx.try_send(session).map_err(|e| match e {
            mpsc::error::TrySendError::Full(s) => OperatorError::Overloaded(format!(
                "dropping {} ({} workers busy)",
                s.command.command_name, self.workers
            )),
            mpsc::error::TrySendError::Closed(_) => {
                OperatorError::Overloaded("worker pool stopped".to_string())
            }
        })
    }

    /// Submits a session, or logs and drops it when the pool is saturated.
    pub fn invoke_or_log(&self, session: Session) {
        let id = session.command.id().to_string();
        let kind = session.command.command_name;
        if let Err(e) = self.try_invoke(session) {
            warn!(command = %kind, id = %id, error = %e, "failed to invoke job");
        }
    }

    pub fn size(&self) -> usize {
        self.workers
    }
}
