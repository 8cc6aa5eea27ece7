use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{Delivery, DeliveryChannel, MessageBroker, Subscription};
use crate::error::{LeaseError, Result};

/// In-process broker with the same group/pending semantics as the Redis
/// Streams transport. Useful for tests and single-process runs; it keeps
/// nothing across restarts.
#[derive(Clone, Default)]
pub struct InProcBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueLog>>,
    published: Notify,
}

#[derive(Default)]
struct QueueLog {
    entries: Vec<Vec<u8>>,
    groups: HashMap<String, GroupCursor>,
}

#[derive(Default)]
struct GroupCursor {
    /// Index of the next never-delivered entry.
    next: usize,
    /// Delivered but unacknowledged entries, by index, with their consumer.
    pending: BTreeMap<usize, String>,
}

impl fmt::Debug for InProcBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue_count = self
            .inner
            .queues
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InProcBroker")
            .field("queue_count", &queue_count)
            .finish()
    }
}

impl InProcBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unacknowledged deliveries held by `group` on `queue`.
    pub async fn pending_count(&self, queue: &str, group: &str) -> usize {
        let queues = self.inner.queues.lock().await;
        queues
            .get(queue)
            .and_then(|log| log.groups.get(group))
            .map(|cursor| cursor.pending.len())
            .unwrap_or_default()
    }

    /// Entries `group` has not yet received on `queue`.
    pub async fn backlog(&self, queue: &str, group: &str) -> usize {
        let queues = self.inner.queues.lock().await;
        queues
            .get(queue)
            .map(|log| {
                let next = log.groups.get(group).map(|c| c.next).unwrap_or_default();
                log.entries.len().saturating_sub(next)
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBroker for InProcBroker {
    type Channel = InProcChannel;

    async fn subscribe(&self, subscription: &Subscription) -> Result<Self::Channel> {
        let mut queues = self.inner.queues.lock().await;
        for queue in &subscription.queues {
            queues
                .entry(queue.clone())
                .or_default()
                .groups
                .entry(subscription.group.clone())
                .or_default();
        }
        Ok(InProcChannel {
            inner: Arc::clone(&self.inner),
            subscription: subscription.clone(),
            replay: Some(HashMap::new()),
        })
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        {
            let mut queues = self.inner.queues.lock().await;
            queues
                .entry(queue.to_string())
                .or_default()
                .entries
                .push(body.to_vec());
        }
        self.inner.published.notify_waiters();
        Ok(())
    }
}

pub struct InProcChannel {
    inner: Arc<Inner>,
    subscription: Subscription,
    /// Set while re-reading this consumer's pending entries: the last index
    /// handed out again per queue.
    replay: Option<HashMap<String, usize>>,
}

impl fmt::Debug for InProcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcChannel")
            .field("subscription", &self.subscription)
            .field("replay", &self.replay)
            .finish()
    }
}

fn declared<'q>(
    queues: &'q mut HashMap<String, QueueLog>,
    sub: &Subscription,
    queue: &str,
) -> Result<(&'q mut Vec<Vec<u8>>, &'q mut GroupCursor)> {
    let QueueLog { entries, groups } = queues
        .get_mut(queue)
        .ok_or_else(|| LeaseError::ChannelClosed(format!("queue {queue} not declared")))?;
    let cursor = groups.get_mut(&sub.group).ok_or_else(|| {
        LeaseError::ChannelClosed(format!("group {} not declared on {queue}", sub.group))
    })?;
    Ok((entries, cursor))
}

impl InProcChannel {
    /// One page of pending replay while a replay is running. Once every queue
    /// has replayed all it holds, fresh entries fill the room left.
    async fn take(&mut self) -> Result<Vec<Delivery>> {
        let sub = &self.subscription;
        let mut queues = self.inner.queues.lock().await;
        let mut out = Vec::new();

        if let Some(replay) = self.replay.as_mut() {
            let mut exhausted = true;
            for queue in &sub.queues {
                let (entries, cursor) = declared(&mut queues, sub, queue)?;
                let from = replay.get(queue).map_or(0, |last| last + 1);
                let mine: Vec<usize> = cursor
                    .pending
                    .range(from..)
                    .filter(|(_, consumer)| **consumer == sub.consumer)
                    .map(|(index, _)| *index)
                    .take(sub.prefetch)
                    .collect();
                if mine.len() == sub.prefetch {
                    exhausted = false;
                }
                if let Some(last) = mine.last() {
                    replay.insert(queue.clone(), *last);
                }
                out.extend(mine.into_iter().map(|index| Delivery {
                    queue: queue.clone(),
                    tag: index.to_string(),
                    body: entries[index].clone(),
                    redelivered: true,
                }));
            }
            if !exhausted {
                return Ok(out);
            }
        }
        self.replay = None;

        for queue in &sub.queues {
            let (entries, cursor) = declared(&mut queues, sub, queue)?;
            let mut held = out.iter().filter(|d| &d.queue == queue).count();
            while cursor.next < entries.len() && held < sub.prefetch {
                let index = cursor.next;
                cursor.next += 1;
                cursor.pending.insert(index, sub.consumer.clone());
                out.push(Delivery {
                    queue: queue.clone(),
                    tag: index.to_string(),
                    body: entries[index].clone(),
                    redelivered: false,
                });
                held += 1;
            }
        }

        Ok(out)
    }

    fn parse_tag(delivery: &Delivery) -> Result<usize> {
        delivery
            .tag
            .parse()
            .map_err(|_| LeaseError::Internal(format!("foreign delivery tag {}", delivery.tag)))
    }
}

#[async_trait]
impl DeliveryChannel for InProcChannel {
    async fn next_batch(&mut self) -> Result<Vec<Delivery>> {
        if self.replay.is_some() {
            let batch = self.take().await?;
            if !batch.is_empty() {
                // A message that keeps failing comes straight back; let other
                // tasks run between attempts.
                tokio::task::yield_now().await;
                return Ok(batch);
            }
        }

        let inner = Arc::clone(&self.inner);
        let notified = inner.published.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let fresh = self.take().await?;
        if !fresh.is_empty() {
            return Ok(fresh);
        }

        let _ = tokio::time::timeout(self.subscription.idle_wait, notified).await;
        self.take().await
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let index = Self::parse_tag(delivery)?;
        let mut queues = self.inner.queues.lock().await;
        if let Some(log) = queues.get_mut(&delivery.queue)
            && let Some(cursor) = log.groups.get_mut(&self.subscription.group)
            && cursor.pending.remove(&index).is_some()
            && self.subscription.delete_on_ack
            && let Some(entry) = log.entries.get_mut(index)
        {
            *entry = Vec::new();
        }
        Ok(())
    }

    async fn nack(&mut self, _delivery: &Delivery) -> Result<()> {
        self.replay = Some(HashMap::new());
        Ok(())
    }
}
