//! Event publisher - fan-out of engine events to subscribers
//!
//! Subscribers are keyed by client id and hold a subscription set of
//! `(channel, symbol)` pairs. Delivery is best-effort ordered: per
//! `(channel, symbol)` events arrive in the engine's emission order.
//!
//! Slow subscribers have a bounded outbound queue; when it fills, the
//! client is disconnected with `SlowConsumer` so the engine is never
//! blocked. Every 30 s each subscriber is pinged; one that has not
//! responded by the next interval is terminated.

use crate::core_types::ClientId;
use crate::engine::events::{Channel, EventMessage};
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What a subscriber receives: engine events, or liveness pings it must
/// answer with [`EventPublisher::pong`].
#[derive(Debug, Clone)]
pub enum PublisherMessage {
    Event(EventMessage),
    Ping,
}

struct Subscriber {
    tx: mpsc::Sender<PublisherMessage>,
    subscriptions: HashSet<(Channel, String)>,
    /// Set when a ping is sent, cleared by pong. Still set at the next
    /// heartbeat tick means the client is dead.
    awaiting_pong: bool,
}

/// Fan-out hub between symbol workers and transport-level subscribers.
pub struct EventPublisher {
    subscribers: DashMap<ClientId, Subscriber>,
    next_client_id: AtomicU64,
    queue_capacity: usize,
    heartbeat_interval: Duration,
}

impl EventPublisher {
    pub fn new(queue_capacity: usize, heartbeat_interval: Duration) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            queue_capacity,
            heartbeat_interval,
        }
    }

    /// Register a new client. Returns its id and the receiving end of its
    /// bounded outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<PublisherMessage>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers.insert(
            client_id,
            Subscriber {
                tx,
                subscriptions: HashSet::new(),
                awaiting_pong: false,
            },
        );
        tracing::info!(client_id, "subscriber registered");
        (client_id, rx)
    }

    pub fn subscribe(&self, client: ClientId, channel: Channel, symbol: &str) -> Result<()> {
        let mut sub = self.subscribers.get_mut(&client).ok_or(EngineError::NotFound)?;
        sub.subscriptions.insert((channel, symbol.to_string()));
        Ok(())
    }

    pub fn unsubscribe(&self, client: ClientId, channel: Channel, symbol: &str) -> Result<()> {
        let mut sub = self.subscribers.get_mut(&client).ok_or(EngineError::NotFound)?;
        sub.subscriptions.remove(&(channel, symbol.to_string()));
        Ok(())
    }

    /// Remove a client and drop its queue.
    pub fn disconnect(&self, client: ClientId) {
        if self.subscribers.remove(&client).is_some() {
            tracing::info!(client_id = client, "subscriber disconnected");
        }
    }

    /// Mark a client as alive in response to a ping.
    pub fn pong(&self, client: ClientId) {
        if let Some(mut sub) = self.subscribers.get_mut(&client) {
            sub.awaiting_pong = false;
        }
    }

    /// Deliver an event to every subscriber of `(event.channel, event.symbol)`.
    ///
    /// The subscriber set is snapshotted at this instant; a full queue
    /// disconnects that client (`SlowConsumer`) without blocking the
    /// caller. Failures are logged and swallowed - publication never rolls
    /// back engine state.
    pub fn publish(&self, event: EventMessage) {
        let key = (event.channel, event.symbol.clone());
        let targets: Vec<(ClientId, mpsc::Sender<PublisherMessage>)> = self
            .subscribers
            .iter()
            .filter(|entry| entry.subscriptions.contains(&key))
            .map(|entry| (*entry.key(), entry.tx.clone()))
            .collect();

        for (client_id, tx) in targets {
            match tx.try_send(PublisherMessage::Event(event.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        client_id,
                        channel = %event.channel,
                        symbol = %event.symbol,
                        "outbound queue full, disconnecting: {}",
                        EngineError::SlowConsumer
                    );
                    self.disconnect(client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.disconnect(client_id);
                }
            }
        }
    }

    /// Number of connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Run the heartbeat loop: ping every interval, terminate subscribers
    /// that failed to answer the previous ping.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.heartbeat_interval);
        // The first tick fires immediately; skip it so clients get a full
        // interval before their first ping.
        tick.tick().await;
        loop {
            tick.tick().await;
            self.heartbeat_round();
        }
    }

    /// One heartbeat pass, separated from the loop for testability.
    pub fn heartbeat_round(&self) {
        let mut dead: Vec<ClientId> = Vec::new();
        for mut entry in self.subscribers.iter_mut() {
            if entry.awaiting_pong {
                dead.push(*entry.key());
                continue;
            }
            match entry.tx.try_send(PublisherMessage::Ping) {
                Ok(()) => entry.awaiting_pong = true,
                Err(_) => dead.push(*entry.key()),
            }
        }
        for client_id in dead {
            tracing::warn!(client_id, "heartbeat missed, terminating subscriber");
            self.disconnect(client_id);
        }
    }
}
