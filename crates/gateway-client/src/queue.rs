//! Priority send queue (spec §4.2): bounded outbound queue with
//! class-based eviction and bounded exponential retry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentim_protocol::{PriorityClass, RETRY_ON_DROP_TYPES};
use tracing::{info, warn};

const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(16);
const RETRY_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub type_tag: String,
    pub priority: PriorityClass,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct DropEvent {
    pub type_tag: String,
    pub priority: PriorityClass,
}

pub type DropHook = Arc<dyn Fn(DropEvent) + Send + Sync>;

enum EnqueueOutcome {
    Enqueued,
    DroppedImmediately,
    NeedsRetry(QueueItem),
}

struct Inner {
    items: Mutex<VecDeque<QueueItem>>,
    max_size: usize,
    drop_count: AtomicU64,
    capacity_warned: AtomicBool,
    flushing: AtomicBool,
    drop_hook: DropHook,
}

/// Thread-safe, cloneable handle onto a gateway's priority send queue.
#[derive(Clone)]
pub struct SendQueue(Arc<Inner>);

impl SendQueue {
    pub fn new(max_size: usize, drop_hook: DropHook) -> Self {
        Self(Arc::new(Inner {
            items: Mutex::new(VecDeque::new()),
            max_size,
            drop_count: AtomicU64::new(0),
            capacity_warned: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            drop_hook,
        }))
    }

    pub fn len(&self) -> usize {
        self.0.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `item`, applying the bounded-drop eviction policy (§4.2) when
    /// full. Schedules a bounded exponential retry on the tokio runtime when
    /// the policy calls for one; the retry itself recurses through this
    /// same method, so a retry that finally succeeds goes through the same
    /// eviction logic as a fresh arrival.
    pub fn enqueue(&self, item: QueueItem) {
        match self.try_enqueue(item) {
            EnqueueOutcome::Enqueued | EnqueueOutcome::DroppedImmediately => {},
            EnqueueOutcome::NeedsRetry(item) => {
                let queue = self.clone();
                tokio::spawn(async move { queue.retry_with_backoff(item, 0).await });
            },
        }
    }

    fn try_enqueue(&self, item: QueueItem) -> EnqueueOutcome {
        let mut items = self.0.items.lock().unwrap();
        if items.len() < self.0.max_size {
            items.push_back(item);
            let len = items.len();
            drop(items);
            self.maybe_warn_capacity(len);
            return EnqueueOutcome::Enqueued;
        }

        match item.priority {
            PriorityClass::Critical => {
                if let Some(evicted) = evict_first(&mut items, PriorityClass::Normal)
                    .or_else(|| evict_first(&mut items, PriorityClass::High))
                {
                    items.push_back(item);
                    drop(items);
                    self.record_drop(evicted);
                    EnqueueOutcome::Enqueued
                } else {
                    drop(items);
                    EnqueueOutcome::NeedsRetry(item)
                }
            },
            PriorityClass::High => {
                if let Some(evicted) = evict_first(&mut items, PriorityClass::Normal) {
                    items.push_back(item);
                    drop(items);
                    self.record_drop(evicted);
                    EnqueueOutcome::Enqueued
                } else {
                    drop(items);
                    self.record_drop(item);
                    EnqueueOutcome::DroppedImmediately
                }
            },
            PriorityClass::Normal => {
                drop(items);
                if RETRY_ON_DROP_TYPES.contains(&item.type_tag.as_str()) {
                    EnqueueOutcome::NeedsRetry(item)
                } else {
                    self.record_drop(item);
                    EnqueueOutcome::DroppedImmediately
                }
            },
        }
    }

    fn retry_with_backoff(
        &self,
        item: QueueItem,
        attempt: u32,
    ) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if attempt >= RETRY_MAX_ATTEMPTS {
                self.record_drop(item);
                return;
            }
            let delay = (RETRY_INITIAL * 2u32.pow(attempt)).min(RETRY_CAP);
            tokio::time::sleep(delay).await;
            match self.try_enqueue(item) {
                EnqueueOutcome::Enqueued | EnqueueOutcome::DroppedImmediately => {},
                EnqueueOutcome::NeedsRetry(item) => self.retry_with_backoff(item, attempt + 1).await,
            }
        })
    }

    fn maybe_warn_capacity(&self, len: usize) {
        let threshold = (self.0.max_size * 3) / 4;
        if len >= threshold && !self.0.capacity_warned.swap(true, Ordering::SeqCst) {
            warn!(len, max = self.0.max_size, "send queue at 75% capacity");
        }
        if len < threshold {
            self.0.capacity_warned.store(false, Ordering::SeqCst);
        }
    }

    fn record_drop(&self, item: QueueItem) {
        let count = self.0.drop_count.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(
            item.type_tag.as_str(),
            "gateway:auth" | "gateway:message_complete" | "gateway:permission_request"
        ) {
            warn!(r#type = %item.type_tag, "dropped critical type");
        }
        if count.is_multiple_of(10) {
            warn!(drop_count = count, "send queue has dropped {count} messages");
        }
        (self.0.drop_hook)(DropEvent { type_tag: item.type_tag, priority: item.priority });
    }

    /// Flush the current batch in order via `send_fn` (true = sent
    /// successfully). If the socket closes or a send fails mid-flush, the
    /// unsent remainder is prepended back to the front, ahead of anything
    /// that arrived while the flush was running (spec §4.2 "Flush
    /// semantics", property P4). A reentrant guard prevents concurrent
    /// flushes.
    pub async fn flush<F, Fut>(&self, mut send_fn: F)
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = bool>,
    {
        if self.0.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        let batch: Vec<QueueItem> = {
            let mut items = self.0.items.lock().unwrap();
            items.drain(..).collect()
        };

        let mut sent = 0;
        for item in &batch {
            if send_fn(item.payload.clone()).await {
                sent += 1;
            } else {
                break;
            }
        }

        if sent < batch.len() {
            let mut items = self.0.items.lock().unwrap();
            for item in batch.into_iter().skip(sent).rev() {
                items.push_front(item);
            }
        } else {
            info!(count = sent, "flushed send queue");
        }

        self.0.flushing.store(false, Ordering::SeqCst);
    }
}

fn evict_first(items: &mut VecDeque<QueueItem>, class: PriorityClass) -> Option<QueueItem> {
    let pos = items.iter().position(|i| i.priority == class)?;
    items.remove(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn item(type_tag: &str, priority: PriorityClass) -> QueueItem {
        QueueItem { type_tag: type_tag.to_string(), priority, payload: type_tag.to_string() }
    }

    fn recording_hook() -> (DropHook, Arc<StdMutex<Vec<DropEvent>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log2 = log.clone();
        (Arc::new(move |e| log2.lock().unwrap().push(e)), log)
    }

    #[tokio::test]
    async fn queue_never_exceeds_max_size() {
        let (hook, _log) = recording_hook();
        let queue = SendQueue::new(3, hook);
        for i in 0..3 {
            queue.enqueue(item(&format!("terminal_data{i}"), PriorityClass::Normal));
        }
        assert_eq!(queue.len(), 3);
        // A 4th normal item with no room and not in the retry-on-drop set
        // drops immediately rather than growing the queue.
        queue.enqueue(item("terminal_data3", PriorityClass::Normal));
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn critical_evicts_oldest_normal_when_full() {
        let (hook, log) = recording_hook();
        let queue = SendQueue::new(2, hook);
        queue.enqueue(item("terminal_data", PriorityClass::Normal));
        queue.enqueue(item("typing", PriorityClass::Normal));
        queue.enqueue(item("gateway:auth", PriorityClass::Critical));

        assert_eq!(queue.len(), 2);
        let dropped = log.lock().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].type_tag, "terminal_data");
    }

    #[tokio::test]
    async fn high_drops_when_no_normal_to_evict() {
        let (hook, log) = recording_hook();
        let queue = SendQueue::new(1, hook);
        queue.enqueue(item("message_chunk", PriorityClass::High));
        queue.enqueue(item("agent_status", PriorityClass::High));

        assert_eq!(queue.len(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flush_sends_in_order_and_clears_queue() {
        let (hook, _log) = recording_hook();
        let queue = SendQueue::new(10, hook);
        queue.enqueue(item("a", PriorityClass::Normal));
        queue.enqueue(item("b", PriorityClass::Normal));

        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sent2 = sent.clone();
        queue
            .flush(move |payload| {
                let sent = sent2.clone();
                async move {
                    sent.lock().unwrap().push(payload);
                    true
                }
            })
            .await;

        assert_eq!(*sent.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn flush_prepends_unsent_remainder_on_failure() {
        let (hook, _log) = recording_hook();
        let queue = SendQueue::new(10, hook);
        queue.enqueue(item("a", PriorityClass::Normal));
        queue.enqueue(item("b", PriorityClass::Normal));
        queue.enqueue(item("c", PriorityClass::Normal));

        queue
            .flush(|payload| async move { payload != "b" })
            .await;

        // "a" sent, "b" failed — "b" and "c" go back to the front.
        assert_eq!(queue.len(), 2);

        // A new arrival during/after the failed flush lands at the back.
        queue.enqueue(item("d", PriorityClass::Normal));
        let items = queue.0.items.lock().unwrap();
        let tags: Vec<_> = items.iter().map(|i| i.type_tag.clone()).collect();
        assert_eq!(tags, vec!["b", "c", "d"]);
    }
}
