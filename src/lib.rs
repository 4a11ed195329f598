//! Argus Kubernetes Operator
//!
//! A cluster-side operator that routes scan commands to the Argus scanner
//! services. Commands arrive from the notification gateway, the trigger REST
//! endpoint, in-cluster scheduled jobs, and the operator's own cluster
//! watchers; a bounded worker pool executes them against the image scanner,
//! the policy scanner, and container registries.
//!
//! ## Command flow
//!
//! ```text
//! gateway ─┐
//! REST ────┼─▶ sessions ─▶ worker pool ─▶ dispatcher ─▶ scanner services
//! watcher ─┤                                  │
//! startup ─┘                                  └▶ response re-handler (polls)
//! ```

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http_api;
pub mod notifications;
pub mod pool;
pub mod readiness;
pub mod rehandler;
pub mod session;
pub mod watcher;
pub mod wlid;

pub use command::{Command, CommandKind, Commands};
pub use config::OperatorConfig;
pub use dispatcher::Dispatcher;
pub use error::{OperatorError, Result};
pub use pool::WorkerPool;
pub use rehandler::ResponseRehandler;
pub use session::{Reporter, Session};
pub use watcher::WatchHandler;
