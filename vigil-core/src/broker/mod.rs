//! Durable queue transport.
//!
//! A [`MessageBroker`] opens [`DeliveryChannel`]s for a [`Subscription`]:
//! a consumer group reading a fixed set of queues with a bounded number of
//! unacknowledged deliveries. Deliveries are at-least-once; a negative
//! acknowledgement hands the message to the same consumer again, ahead of
//! anything it has not read yet.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod dispatch;
pub mod memory;
pub mod streams;

pub use dispatch::{DeliveryHandler, DeliveryLoop, Outcome};
pub use memory::InProcBroker;
pub use streams::RedisStreamBroker;

/// Default wait for new deliveries before a read returns empty.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(1_000);

/// One message handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was read from.
    pub queue: String,
    /// Broker-assigned identifier used for ack/nack.
    pub tag: String,
    pub body: Vec<u8>,
    /// Set when the message was handed out before without an ack.
    pub redelivered: bool,
}

/// What a consumer reads and how much it may hold unacknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    /// Consumer group. Consumers sharing a group compete for messages;
    /// separate groups each see every message.
    pub group: String,
    /// Stable consumer name; pending messages survive a restart under it.
    pub consumer: String,
    pub queues: Vec<String>,
    /// Upper bound on unacknowledged deliveries per queue.
    pub prefetch: usize,
    pub idle_wait: Duration,
    /// Drop acknowledged messages from the queue. Only safe when this group
    /// is the queue's sole reader.
    pub delete_on_ack: bool,
}

impl Subscription {
    pub fn new(
        group: impl Into<String>,
        consumer: impl Into<String>,
        queues: Vec<String>,
        prefetch: usize,
    ) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            queues,
            prefetch: prefetch.max(1),
            idle_wait: DEFAULT_IDLE_WAIT,
            delete_on_ack: false,
        }
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn with_delete_on_ack(mut self) -> Self {
        self.delete_on_ack = true;
        self
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    type Channel: DeliveryChannel;

    /// Connect and (re)declare every queue of the subscription. Declaring is
    /// idempotent, so this is also the reconnect path.
    async fn subscribe(&self, subscription: &Subscription) -> Result<Self::Channel>;

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait DeliveryChannel: Send {
    /// Next deliveries in queue order, at most `prefetch` per queue. Returns
    /// an empty batch when nothing arrived within the idle wait.
    async fn next_batch(&mut self) -> Result<Vec<Delivery>>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Reject with requeue. The next read restarts from the oldest
    /// unacknowledged delivery, so the message comes back together with
    /// anything read after it and not yet acknowledged, in queue order.
    async fn nack(&mut self, delivery: &Delivery) -> Result<()>;
}
