//! Subscriber identities, channel membership, and the send path.
//!
//! The registry is the only owner of transport handles. It keeps a
//! bidirectional index (subscriber → channels, channel → subscribers) behind
//! one `RwLock` and hands every batched send to the [`MessageBatcher`], which
//! serializes per subscriber.
//!
//! A failed send is an implicit disconnect: the subscriber is deregistered
//! and the error never reaches the producer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use metrics::{counter, gauge};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vivify_core::{Priority, ServerMessage, SubscriberId, TransportError};

use crate::batcher::{Batch, FlushSink, MessageBatcher};
use crate::config::BatchConfig;
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_EVICTIONS_TOTAL,
};
use crate::transport::Transport;

/// Longest accepted channel name, in bytes.
pub const MAX_CHANNEL_LEN: usize = 256;

struct Subscriber {
    transport: Arc<dyn Transport>,
    channels: HashSet<String>,
    sink: FlushSink,
}

#[derive(Default)]
struct RegistryState {
    subscribers: HashMap<SubscriberId, Subscriber>,
    channels: HashMap<String, HashSet<SubscriberId>>,
}

/// Live subscribers and their channel membership.
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    batcher: MessageBatcher,
}

impl ConnectionRegistry {
    /// Create an empty registry with the given batching policy.
    pub fn new(config: BatchConfig) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RegistryState::default()),
            batcher: MessageBatcher::new(config),
        })
    }

    /// The batcher behind this registry.
    pub fn batcher(&self) -> &MessageBatcher {
        &self.batcher
    }

    /// Complete the transport handshake and start tracking the subscriber.
    ///
    /// Returns `None`, with no state change, when the handshake fails.
    pub async fn register(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Option<SubscriberId> {
        if let Err(error) = transport.accept().await {
            warn!(%error, "transport handshake failed");
            return None;
        }

        let id = SubscriberId::new();
        let sink = self.delivery_sink(id.clone(), Arc::clone(&transport));
        {
            let mut state = self.state.write().await;
            let _ = state.subscribers.insert(
                id.clone(),
                Subscriber {
                    transport,
                    channels: HashSet::new(),
                    sink,
                },
            );
        }

        info!(subscriber_id = %id, "subscriber registered");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        Some(id)
    }

    /// Forget a subscriber: identity, every channel membership, and its
    /// pending batch state. Idempotent.
    ///
    /// Returns whether the subscriber was registered.
    pub async fn deregister(&self, id: &SubscriberId) -> bool {
        let removed = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(subscriber) = state.subscribers.remove(id) else {
                return false;
            };
            for channel in &subscriber.channels {
                if let Some(members) = state.channels.get_mut(channel) {
                    let _ = members.remove(id);
                    if members.is_empty() {
                        let _ = state.channels.remove(channel);
                    }
                }
            }
            // Under the write lock, so no send can recreate the queue.
            self.batcher.clear(id);
            subscriber
        };

        removed.transport.close();
        info!(
            subscriber_id = %id,
            channels = removed.channels.len(),
            "subscriber deregistered"
        );
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        true
    }

    /// Add `id` to `channel`. No-op for unknown subscribers and invalid names.
    ///
    /// Returns whether membership changed.
    pub async fn subscribe(&self, id: &SubscriberId, channel: &str) -> bool {
        if !is_valid_channel(channel) {
            debug!(subscriber_id = %id, channel_len = channel.len(), "rejected channel name");
            return false;
        }
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(subscriber) = state.subscribers.get_mut(id) else {
            return false;
        };
        if !subscriber.channels.insert(channel.to_owned()) {
            return false;
        }
        let _ = state
            .channels
            .entry(channel.to_owned())
            .or_default()
            .insert(id.clone());
        debug!(subscriber_id = %id, channel, "subscribed");
        true
    }

    /// Remove `id` from `channel`. No-op when it is not a member.
    ///
    /// Returns whether membership changed.
    pub async fn unsubscribe(&self, id: &SubscriberId, channel: &str) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(subscriber) = state.subscribers.get_mut(id) else {
            return false;
        };
        if !subscriber.channels.remove(channel) {
            return false;
        }
        if let Some(members) = state.channels.get_mut(channel) {
            let _ = members.remove(id);
            if members.is_empty() {
                let _ = state.channels.remove(channel);
            }
        }
        debug!(subscriber_id = %id, channel, "unsubscribed");
        true
    }

    /// Transmit one message right away, bypassing the batcher.
    ///
    /// Used for the snapshot on connect and for control replies. A send
    /// failure deregisters the subscriber.
    pub async fn send_immediate(&self, id: &SubscriberId, message: ServerMessage) {
        let transport = {
            let state = self.state.read().await;
            state.subscribers.get(id).map(|s| Arc::clone(&s.transport))
        };
        let Some(transport) = transport else {
            return;
        };
        if let Err(error) = transport.send(&message) {
            warn!(subscriber_id = %id, kind = %message.kind(), %error, "send failed, evicting subscriber");
            counter!(WS_EVICTIONS_TOTAL).increment(1);
            let _ = self.deregister(id).await;
        }
    }

    /// Queue a message for one subscriber through the batcher.
    ///
    /// A flush triggered by this message, or by the timer it schedules, is
    /// transmitted by the registry. Unknown subscribers are ignored.
    pub async fn send(&self, id: &SubscriberId, message: ServerMessage, priority: Priority) {
        let state = self.state.read().await;
        let Some(subscriber) = state.subscribers.get(id) else {
            return;
        };
        self.batcher.submit(id, message, priority, &subscriber.sink);
    }

    /// Send to every current member of `channel`.
    ///
    /// Membership is copied first, so joins and leaves during fan-out do not
    /// affect this call. A failing member does not stop delivery to the rest.
    pub async fn broadcast(&self, channel: &str, message: ServerMessage, priority: Priority) {
        let members: Vec<SubscriberId> = {
            let state = self.state.read().await;
            state
                .channels
                .get(channel)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default()
        };
        debug!(
            channel,
            kind = %message.kind(),
            recipients = members.len(),
            "broadcast to channel"
        );
        self.fan_out(&members, message, priority).await;
    }

    /// Send to every registered subscriber regardless of membership.
    pub async fn broadcast_all(&self, message: ServerMessage, priority: Priority) {
        let members: Vec<SubscriberId> = {
            let state = self.state.read().await;
            state.subscribers.keys().cloned().collect()
        };
        debug!(kind = %message.kind(), recipients = members.len(), "broadcast to all");
        self.fan_out(&members, message, priority).await;
    }

    /// Deliver whatever is pending for `id` now.
    ///
    /// Returns whether anything was pending.
    pub async fn flush_connection(&self, id: &SubscriberId) -> bool {
        let state = self.state.read().await;
        let Some(subscriber) = state.subscribers.get(id) else {
            return false;
        };
        self.batcher.flush_to(id, &subscriber.sink)
    }

    /// Hold back batched output for `id` until [`release`](Self::release).
    ///
    /// Used while the snapshot is being built, so channel traffic that
    /// arrives meanwhile is sent after it instead of before it.
    pub async fn hold(&self, id: &SubscriberId) -> bool {
        let state = self.state.read().await;
        if !state.subscribers.contains_key(id) {
            return false;
        }
        self.batcher.hold(id);
        true
    }

    /// Deliver what was held back for `id` and resume normal batching.
    pub async fn release(&self, id: &SubscriberId) -> bool {
        let state = self.state.read().await;
        let Some(subscriber) = state.subscribers.get(id) else {
            return false;
        };
        self.batcher.release(id, &subscriber.sink)
    }

    /// Deliver whatever is pending for every subscriber.
    ///
    /// Returns how many subscribers had something pending.
    pub async fn flush_all_connections(&self) -> usize {
        let state = self.state.read().await;
        state
            .subscribers
            .iter()
            .filter(|&(id, subscriber)| self.batcher.flush_to(id, &subscriber.sink))
            .count()
    }

    /// Deregister every subscriber, closing its transport.
    ///
    /// Returns how many were still registered.
    pub async fn disconnect_all(&self) -> usize {
        let ids: Vec<SubscriberId> = self.state.read().await.subscribers.keys().cloned().collect();
        let mut closed = 0;
        for id in &ids {
            if self.deregister(id).await {
                closed += 1;
            }
        }
        closed
    }

    /// Number of registered subscribers.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.subscribers.len()
    }

    /// Number of members of `channel`.
    pub async fn channel_count(&self, channel: &str) -> usize {
        self.state
            .read()
            .await
            .channels
            .get(channel)
            .map_or(0, HashSet::len)
    }

    /// Number of channels with at least one member.
    pub async fn active_channels(&self) -> usize {
        self.state.read().await.channels.len()
    }

    /// Channels `id` belongs to, sorted. Empty for unknown subscribers.
    pub async fn channels_of(&self, id: &SubscriberId) -> Vec<String> {
        let state = self.state.read().await;
        let mut channels: Vec<String> = state
            .subscribers
            .get(id)
            .map(|s| s.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Whether `id` is registered.
    pub async fn is_registered(&self, id: &SubscriberId) -> bool {
        self.state.read().await.subscribers.contains_key(id)
    }

    async fn fan_out(&self, members: &[SubscriberId], message: ServerMessage, priority: Priority) {
        for id in members {
            self.send(id, message.clone(), priority).await;
        }
    }

    /// Sink used for every batch of one subscriber. A send failure schedules
    /// eviction on a separate task, since the sink runs under the
    /// subscriber's queue lock and possibly the registry read lock.
    fn delivery_sink(self: &Arc<Self>, id: SubscriberId, transport: Arc<dyn Transport>) -> FlushSink {
        let registry: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |batch: Batch| {
            let Err(error) = transmit(transport.as_ref(), batch) else {
                return;
            };
            warn!(subscriber_id = %id, %error, "batch send failed, evicting subscriber");
            counter!(WS_EVICTIONS_TOTAL).increment(1);
            if let Some(registry) = registry.upgrade() {
                let id = id.clone();
                let _ = tokio::spawn(async move {
                    let _ = registry.deregister(&id).await;
                });
            }
        })
    }
}

fn transmit(transport: &dyn Transport, batch: Batch) -> Result<(), TransportError> {
    for message in batch.into_messages() {
        transport.send(&message)?;
    }
    Ok(())
}

/// Channel names must be non-blank and at most [`MAX_CHANNEL_LEN`] bytes.
pub fn is_valid_channel(name: &str) -> bool {
    !name.trim().is_empty() && name.len() <= MAX_CHANNEL_LEN
}
