//! Rate-limited coalescing of high-frequency message kinds
//!
//! Kinds with a [`BulkPolicy`] are not sent as they are produced. They sit in
//! a per-kind queue and, once per interval, up to `max_batch_size` of them
//! leave together inside one [`Batch`] envelope.
//!
//! Queues are unbounded between flushes. A burst larger than one batch
//! drains over several intervals instead of being dropped, trading memory
//! for eventual delivery.

use crate::catalog::MessageCatalog;
use crate::messages::{Batch, Message, MessageKind};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Coalescing rule for a message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkPolicy {
    pub max_batch_size: u32,
    pub interval_ms: u32,
}

impl BulkPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.interval_ms))
    }
}

struct KindQueue {
    policy: BulkPolicy,
    pending: VecDeque<Message>,
    last_flush: Instant,
}

/// Per-kind outbound queues
///
/// Cheap to clone; every clone shares the same queues, so a worker thread
/// can enqueue while the tick thread flushes.
#[derive(Clone)]
pub struct BatchQueue {
    queues: Arc<Mutex<BTreeMap<MessageKind, KindQueue>>>,
}

impl BatchQueue {
    /// One queue per bulk kind in the catalog, with the interval clock
    /// starting at `now`
    pub fn new(catalog: &MessageCatalog, now: Instant) -> Self {
        let queues = catalog
            .descriptors()
            .filter_map(|d| {
                d.bulk.map(|policy| {
                    (
                        d.kind,
                        KindQueue {
                            policy,
                            pending: VecDeque::new(),
                            last_flush: now,
                        },
                    )
                })
            })
            .collect();
        Self {
            queues: Arc::new(Mutex::new(queues)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<MessageKind, KindQueue>> {
        // A panicking producer cannot leave a queue half-written
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_bulk(&self, kind: MessageKind) -> bool {
        self.lock().contains_key(&kind)
    }

    /// Queue a message of a bulk kind. Any other message is handed back so
    /// the caller can send it directly.
    pub fn enqueue(&self, message: Message) -> Result<(), Message> {
        let mut queues = self.lock();
        match queues.get_mut(&message.kind()) {
            Some(queue) => {
                queue.pending.push_back(message);
                Ok(())
            }
            None => Err(message),
        }
    }

    pub fn pending(&self, kind: MessageKind) -> usize {
        self.lock().get(&kind).map(|q| q.pending.len()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.lock().values().map(|q| q.pending.len()).sum()
    }

    /// Drain every due queue into at most one batch each, in tag order
    pub fn flush(&self, now: Instant) -> Vec<Batch> {
        let mut queues = self.lock();
        let mut batches = Vec::new();

        for (kind, queue) in queues.iter_mut() {
            if queue.pending.is_empty() {
                continue;
            }
            if now.saturating_duration_since(queue.last_flush) < queue.policy.interval() {
                continue;
            }

            let take = queue.pending.len().min(queue.policy.max_batch_size as usize);
            let items: Vec<Message> = queue.pending.drain(..take).collect();
            queue.last_flush = now;

            match Batch::new(*kind, items) {
                Ok(batch) => {
                    debug!(
                        "Flushing {} {} messages ({} still queued)",
                        batch.len(),
                        kind.name(),
                        queue.pending.len()
                    );
                    batches.push(batch);
                }
                Err(e) => warn!("Dropping malformed {} batch: {}", kind.name(), e),
            }
        }

        batches
    }

    /// Drop everything queued, e.g. when the session ends
    pub fn clear(&self) {
        for queue in self.lock().values_mut() {
            queue.pending.clear();
        }
    }
}
