//! Per-subscriber message batching.
//!
//! Each subscriber gets one pending queue and at most one outstanding flush
//! timer, both behind that subscriber's own mutex. Enqueues for the same
//! subscriber serialize on it; different subscribers never contend.
//!
//! A queue flushes when:
//! - a message with [`Priority::is_immediate`] arrives
//! - the queue reaches `max_batch_size`
//! - the timer scheduled by the first deferred message fires
//!
//! Flushing drains the queue in FIFO order and coalesces patches that target
//! the same path (last writer wins, positioned at its last contributor).
//! One surviving entry is sent as-is; more are wrapped in a `batch_patch`.
//!
//! A subscriber can be held while its snapshot is in flight: messages queue
//! but nothing flushes until it is released.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use vivify_core::protocol::BatchPayload;
use vivify_core::{BatchEntry, Priority, ServerMessage, SubscriberId};

use crate::config::BatchConfig;
use crate::metrics::{BATCHES_FLUSHED_TOTAL, MESSAGES_ENQUEUED_TOTAL, PATCHES_COALESCED_TOTAL};

/// Delivery callback invoked with every batch the batcher produces on its own
/// (timer expiry) or on behalf of [`MessageBatcher::submit`].
pub type FlushSink = Arc<dyn Fn(Batch) + Send + Sync>;

/// Messages ready to transmit, in order. Empty when there was nothing to flush.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch(Vec<ServerMessage>);

impl Batch {
    /// A batch holding exactly one message.
    pub fn single(message: ServerMessage) -> Self {
        Self(vec![message])
    }

    /// Whether there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of frames to send.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Frames in send order.
    pub fn messages(&self) -> &[ServerMessage] {
        &self.0
    }

    /// Take the frames.
    pub fn into_messages(self) -> Vec<ServerMessage> {
        self.0
    }
}

/// One message waiting in a subscriber's queue.
#[derive(Clone, Debug)]
struct PendingMessage {
    message: ServerMessage,
    created_at: DateTime<Utc>,
    priority: Priority,
}

/// Scheduled flush, tagged so a timer that lost a race can tell it is stale.
struct FlushTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SubscriberQueue {
    pending: Vec<PendingMessage>,
    timer: Option<FlushTimer>,
    generation: u64,
    held: bool,
}

impl SubscriberQueue {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

type QueueHandle = Arc<Mutex<SubscriberQueue>>;

/// Per-subscriber accumulation, coalescing, and flush triggering.
pub struct MessageBatcher {
    config: BatchConfig,
    queues: DashMap<SubscriberId, QueueHandle>,
}

impl MessageBatcher {
    /// Create a batcher with the given policy.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            queues: DashMap::new(),
        }
    }

    /// The batching policy.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Queue a message for `id`.
    ///
    /// Returns the flushed batch when this message triggered a flush (or when
    /// batching is disabled). Otherwise a timer is scheduled, if none is
    /// outstanding, and `sink` receives the batch when it fires.
    pub fn enqueue(
        &self,
        id: &SubscriberId,
        message: ServerMessage,
        priority: Priority,
        sink: &FlushSink,
    ) -> Option<Batch> {
        counter!(MESSAGES_ENQUEUED_TOTAL).increment(1);
        if !self.config.enabled {
            return self.park(id, message, priority).map(Batch::single);
        }

        let handle = self.queue(id);
        let mut queue = handle.lock();
        self.push(id, &handle, &mut queue, message, priority, sink)
    }

    /// Like [`enqueue`](Self::enqueue), but a triggered batch goes to `sink`
    /// while the subscriber's queue is still held, so frames from a triggered
    /// flush and a timer flush can never be reordered on the transport.
    pub fn submit(
        &self,
        id: &SubscriberId,
        message: ServerMessage,
        priority: Priority,
        sink: &FlushSink,
    ) {
        counter!(MESSAGES_ENQUEUED_TOTAL).increment(1);
        if !self.config.enabled {
            if let Some(message) = self.park(id, message, priority) {
                sink(Batch::single(message));
            }
            return;
        }

        let handle = self.queue(id);
        let mut queue = handle.lock();
        if let Some(batch) = self.push(id, &handle, &mut queue, message, priority, sink) {
            sink(batch);
        }
    }

    /// Cancel any scheduled flush and drain whatever is pending.
    ///
    /// Empty batch when nothing is pending or the subscriber is unknown.
    pub fn flush_all(&self, id: &SubscriberId) -> Batch {
        let Some(handle) = self.existing(id) else {
            return Batch::default();
        };
        let mut queue = handle.lock();
        queue.cancel_timer();
        flush_queue(id, &mut queue)
    }

    /// [`flush_all`](Self::flush_all) with delivery under the queue lock.
    ///
    /// Returns whether anything was delivered.
    pub fn flush_to(&self, id: &SubscriberId, sink: &FlushSink) -> bool {
        let Some(handle) = self.existing(id) else {
            return false;
        };
        let mut queue = handle.lock();
        if queue.held {
            return false;
        }
        queue.cancel_timer();
        let batch = flush_queue(id, &mut queue);
        if batch.is_empty() {
            return false;
        }
        sink(batch);
        true
    }

    /// Stop every trigger for `id` until [`release`](Self::release).
    /// Messages keep queueing, in disabled mode too.
    pub fn hold(&self, id: &SubscriberId) {
        let handle = self.queue(id);
        handle.lock().held = true;
        trace!(subscriber_id = %id, "output held");
    }

    /// End a [`hold`](Self::hold) and deliver what queued meanwhile.
    ///
    /// With batching disabled the held messages go out unmerged, in order.
    /// Returns whether anything was delivered.
    pub fn release(&self, id: &SubscriberId, sink: &FlushSink) -> bool {
        let Some(handle) = self.existing(id) else {
            return false;
        };
        let mut queue = handle.lock();
        if !queue.held {
            return false;
        }
        queue.held = false;

        let batch = if self.config.enabled {
            flush_queue(id, &mut queue)
        } else {
            let held = std::mem::take(&mut queue.pending);
            let _ = self.queues.remove(id);
            Batch(held.into_iter().map(|p| p.message).collect())
        };
        trace!(subscriber_id = %id, frames = batch.len(), "output released");
        if batch.is_empty() {
            return false;
        }
        sink(batch);
        true
    }

    /// Cancel the timer and discard the queue without producing output.
    pub fn clear(&self, id: &SubscriberId) {
        if let Some((_, handle)) = self.queues.remove(id) {
            let mut queue = handle.lock();
            queue.cancel_timer();
            let dropped = queue.pending.len();
            queue.pending.clear();
            if dropped > 0 {
                debug!(subscriber_id = %id, dropped, "discarded pending messages");
            }
        }
    }

    fn queue(&self, id: &SubscriberId) -> QueueHandle {
        // Clone out so the shard lock is released before the queue lock.
        self.queues.entry(id.clone()).or_default().value().clone()
    }

    fn existing(&self, id: &SubscriberId) -> Option<QueueHandle> {
        self.queues.get(id).map(|entry| entry.value().clone())
    }

    /// Queue `message` when `id` is held; otherwise hand it back.
    fn park(&self, id: &SubscriberId, message: ServerMessage, priority: Priority) -> Option<ServerMessage> {
        let Some(handle) = self.existing(id) else {
            return Some(message);
        };
        let mut queue = handle.lock();
        if !queue.held {
            return Some(message);
        }
        queue.pending.push(PendingMessage {
            message,
            created_at: Utc::now(),
            priority,
        });
        None
    }

    fn push(
        &self,
        id: &SubscriberId,
        handle: &QueueHandle,
        queue: &mut SubscriberQueue,
        message: ServerMessage,
        priority: Priority,
        sink: &FlushSink,
    ) -> Option<Batch> {
        queue.pending.push(PendingMessage {
            message,
            created_at: Utc::now(),
            priority,
        });
        if queue.held {
            return None;
        }

        if priority.is_immediate() || queue.pending.len() >= self.config.max_batch_size {
            queue.cancel_timer();
            return Some(flush_queue(id, queue));
        }

        if queue.timer.is_none() {
            queue.generation += 1;
            let generation = queue.generation;
            let task = tokio::spawn(delayed_flush(
                id.clone(),
                Arc::clone(handle),
                generation,
                self.config.max_batch_delay(),
                Arc::clone(sink),
            ));
            queue.timer = Some(FlushTimer {
                generation,
                handle: task,
            });
            trace!(subscriber_id = %id, generation, "flush timer scheduled");
        }
        None
    }

    #[cfg(test)]
    fn pending_count(&self, id: &SubscriberId) -> usize {
        self.existing(id).map_or(0, |h| h.lock().pending.len())
    }

    #[cfg(test)]
    fn has_timer(&self, id: &SubscriberId) -> bool {
        self.existing(id).is_some_and(|h| h.lock().timer.is_some())
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self, id: &SubscriberId) -> bool {
        self.queues.contains_key(id)
    }
}

async fn delayed_flush(
    id: SubscriberId,
    handle: QueueHandle,
    generation: u64,
    delay: std::time::Duration,
    sink: FlushSink,
) {
    tokio::time::sleep(delay).await;

    let mut queue = handle.lock();
    // A flush that ran while this timer slept already took its slot.
    if queue.timer.as_ref().map(|t| t.generation) != Some(generation) {
        return;
    }
    queue.timer = None;
    // Release flushes whatever a hold kept back.
    if queue.held {
        return;
    }
    let batch = flush_queue(&id, &mut queue);
    if !batch.is_empty() {
        sink(batch);
    }
}

fn flush_queue(id: &SubscriberId, queue: &mut SubscriberQueue) -> Batch {
    let drained = std::mem::take(&mut queue.pending);
    let Some(oldest) = drained.first() else {
        return Batch::default();
    };
    let waited_ms = (Utc::now() - oldest.created_at).num_milliseconds();
    let drained_count = drained.len();
    let urgent = drained.iter().any(|m| m.priority.is_immediate());

    let (message, coalesced) = optimize(drained);
    counter!(BATCHES_FLUSHED_TOTAL).increment(1);
    if coalesced > 0 {
        counter!(PATCHES_COALESCED_TOTAL).increment(coalesced as u64);
    }
    debug!(
        subscriber_id = %id,
        drained = drained_count,
        coalesced,
        waited_ms,
        urgent,
        "batch flushed"
    );

    message.map(Batch::single).unwrap_or_default()
}

/// Coalesce drained messages into at most one outgoing frame.
///
/// Returns the frame and how many patches were superseded.
fn optimize(messages: Vec<PendingMessage>) -> (Option<ServerMessage>, usize) {
    let mut slots: Vec<Option<BatchEntry>> = Vec::with_capacity(messages.len());
    let mut by_path: HashMap<String, usize> = HashMap::new();
    let mut coalesced = 0;

    for pending in messages {
        match pending.message {
            ServerMessage::Patch(payload) => {
                for patch in payload.patches {
                    if let Some(previous) = by_path.insert(patch.path().to_owned(), slots.len()) {
                        slots[previous] = None;
                        coalesced += 1;
                    }
                    slots.push(Some(BatchEntry::Patch(patch)));
                }
            }
            other => slots.push(Some(BatchEntry::Message(other))),
        }
    }

    let mut entries: Vec<BatchEntry> = slots.into_iter().flatten().collect();
    let message = match entries.len() {
        0 => None,
        1 => entries.pop().map(|entry| match entry {
            BatchEntry::Patch(patch) => ServerMessage::patch(vec![patch]),
            BatchEntry::Message(message) => message,
        }),
        count => Some(ServerMessage::BatchPatch(BatchPayload {
            patches: entries,
            count,
            timestamp: Utc::now().to_rfc3339(),
        })),
    };
    (message, coalesced)
}
