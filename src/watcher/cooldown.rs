//! Cooldown queue: a time-bounded deduplicator for keyed cluster events.
//!
//! The first event for a key is forwarded to the output channel and opens a
//! cooldown window; later events with the same key are silently dropped until
//! the window expires. Entries are bounded both by TTL and by capacity
//! (oldest first), so a watch storm cannot grow the queue without limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Default capacity of the seen-keys table.
pub const DEFAULT_QUEUE_SIZE: usize = 512;
/// Default cooldown per key.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

struct SeenKeys {
    entries: HashMap<String, Instant>,
    // Insertion order for capacity eviction. May hold stale keys whose entry
    // was refreshed; eviction checks the expiry before removing.
    order: VecDeque<(String, Instant)>,
}

/// Deduplicating forwarder in front of a watch stream consumer.
pub struct CooldownQueue<T> {
    capacity: usize,
    ttl: Duration,
    seen: Mutex<SeenKeys>,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> CooldownQueue<T> {
    /// Creates a queue and its output stream.
    pub fn new(capacity: usize, ttl: Duration) -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CooldownQueue {
                capacity: capacity.max(1),
                ttl,
                seen: Mutex::new(SeenKeys {
                    entries: HashMap::new(),
                    order: VecDeque::new(),
                }),
                tx,
            },
            rx,
        )
    }

    /// Forwards `event` iff no live cooldown entry exists for `key`.
    /// Returns whether the event was forwarded. Never blocks.
    pub fn enqueue(&self, key: &str, event: T) -> bool {
        if key.is_empty() {
            debug!("dropping event without a key");
            return false;
        }

        let now = Instant::now();
        {
            let mut seen = self.seen.lock().unwrap();

            if let Some(expiry) = seen.entries.get(key) {
                if *expiry > now {
                    return false;
                }
            }

            let expiry = now + self.ttl;
            seen.entries.insert(key.to_string(), expiry);
            seen.order.push_back((key.to_string(), expiry));

            while seen.entries.len() > self.capacity {
                let Some((old_key, old_expiry)) = seen.order.pop_front() else {
                    break;
                };
                // Only drop the entry if it still belongs to this order slot.
                if seen.entries.get(&old_key) == Some(&old_expiry) {
                    seen.entries.remove(&old_key);
                }
            }
        }

        // The receiver side may have shut down already; nothing to do then.
        self.tx.send(event).is_ok()
    }

    /// Closes the output stream.
    pub fn stop(self) {}
}
