//! Delayed re-handling of long-poll command responses.
//!
//! Handlers that trigger an asynchronous downstream job (e.g. a policy scan)
//! register a callback here instead of blocking a pool worker. After the
//! requested delay a sleeper pushes the callback back onto the response
//! channel; the single dispatcher task invokes callbacks serially. A callback
//! returning `(true, delay)` re-arms itself; `(false, _)` ends the chain.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::pool::BoxFuture;

/// Number of sleeper tasks waiting on re-handle timers.
pub const SLEEPER_POOL_SIZE: usize = 10;
/// Capacity of the response channel feeding the dispatcher task.
const RESPONSE_CHANNEL_SIZE: usize = 100;

/// A re-handle callback. Returns whether to re-arm and the delay to use for
/// the next invocation (falling back to the previous delay when `None`).
pub type RehandleCallback = Arc<dyn Fn() -> BoxFuture<(bool, Option<Duration>)> + Send + Sync>;

struct ResponseData {
    name: String,
    callback: RehandleCallback,
    delay: Duration,
}

struct TimerData {
    deadline: Instant,
    data: ResponseData,
}

/// Handle for scheduling delayed callback re-invocations.
#[derive(Clone)]
pub struct ResponseRehandler {
    timer_tx: mpsc::Sender<TimerData>,
}

impl ResponseRehandler {
    /// Spawns the dispatcher task and the sleeper pool.
    pub fn new() -> Self {
        let (timer_tx, timer_rx) = mpsc::channel::<TimerData>(SLEEPER_POOL_SIZE);
        let (response_tx, mut response_rx) = mpsc::channel::<ResponseData>(RESPONSE_CHANNEL_SIZE);

        let timer_rx = Arc::new(tokio::sync::Mutex::new(timer_rx));
        for _ in 0..SLEEPER_POOL_SIZE {
            let timer_rx = Arc::clone(&timer_rx);
            let response_tx = response_tx.clone();
            tokio::spawn(async move {
                loop {
                    let timer = {
                        let mut guard = timer_rx.lock().await;
                        guard.recv().await
                    };
                    let Some(TimerData { deadline, data }) = timer else {
                        break;
                    };
                    tokio::time::sleep_until(deadline).await;
                    if response_tx.send(data).await.is_err() {
                        break;
                    }
                }
            });
        }

        let rearm_tx = timer_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = response_rx.recv().await {
                let (again, next_delay) = (data.callback)().await;
                if again {
                    let delay = next_delay.unwrap_or(data.delay);
                    debug!(name = %data.name, ?delay, "re-arming response callback");
                    let timer = TimerData {
                        deadline: Instant::now() + delay,
                        data: ResponseData { delay, ..data },
                    };
                    if rearm_tx.send(timer).await.is_err() {
                        break;
                    }
                } else {
                    debug!(name = %data.name, "response chain finished");
                }
            }
        });

        ResponseRehandler { timer_tx }
    }

    /// Schedules `callback` to run after at least `delay`.
    pub async fn schedule(&self, name: &str, callback: RehandleCallback, delay: Duration) {
        let data = ResponseData {
            name: name.to_string(),
            callback,
            delay,
        };
        let timer = TimerData {
            deadline: Instant::now() + delay,
            data,
        };
        // Fails only when the sleeper pool has shut down.
        let _ = self.timer_tx.send(timer).await;
    }
}

impl Default for ResponseRehandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_chain_runs_until_callback_declines() {
        let rehandler = ResponseRehandler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);

        let callback: RehandleCallback = Arc::new(move || {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 6 {
                    (true, Some(Duration::from_millis(1)))
                } else {
                    (false, None)
                }
            })
        });

        rehandler
            .schedule("status-poll", callback, Duration::from_millis(1))
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 6);

        // The final link scheduled nothing; the count stays put.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_callback_waits_at_least_the_delay() {
        let rehandler = ResponseRehandler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);

        let callback: RehandleCallback = Arc::new(move || {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                (false, None)
            })
        });

        rehandler
            .schedule("delayed", callback, Duration::from_millis(80))
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_independent_chains_both_complete() {
        let rehandler = ResponseRehandler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let seen = Arc::clone(&counter);
            let callback: RehandleCallback = Arc::new(move || {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    (false, None)
                })
            });
            rehandler
                .schedule("chain", callback, Duration::from_millis(5))
                .await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
