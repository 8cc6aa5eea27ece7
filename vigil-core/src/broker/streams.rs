//! Redis Streams transport.
//!
//! Each queue is a stream and each consuming role a consumer group created
//! from the start of the stream, so messages published before the first
//! consumer existed are still delivered. `XREADGROUP COUNT` bounds the
//! unacknowledged window; entries stay in the group's pending list until
//! `XACK`. After a reconnect or a nack the channel pages through its own
//! pending list from `ID 0`, then reads new entries (`ID >`) into whatever
//! room the replay left.
//!
//! Publishing trims each stream to roughly [`DEFAULT_STREAM_MAX_LEN`]
//! entries. Subscriptions that own their queue outright delete entries as
//! they are acknowledged.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client, RedisError,
    aio::MultiplexedConnection,
    streams::{StreamMaxlen, StreamReadOptions, StreamReadReply},
};
use tracing::{debug, info, warn};

use super::{Delivery, DeliveryChannel, MessageBroker, Subscription};
use crate::error::Result;

const BODY_FIELD: &str = "body";
const FIRST_PENDING: &str = "0";
const NEW_ENTRIES: &str = ">";

/// Approximate number of entries each stream keeps when publishing.
pub const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

#[derive(Clone)]
pub struct RedisStreamBroker {
    client: Client,
    max_len: usize,
}

impl fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStreamBroker")
            .field("client", &"redis::Client")
            .field("max_len", &self.max_len)
            .finish()
    }
}

impl RedisStreamBroker {
    /// Parse the broker URL. No connection is made until a subscription or
    /// publish needs one.
    pub fn open(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            max_len: DEFAULT_STREAM_MAX_LEN,
        })
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    type Channel = RedisStreamChannel;

    async fn subscribe(&self, subscription: &Subscription) -> Result<Self::Channel> {
        let mut conn = self.connect().await?;

        for queue in &subscription.queues {
            let created: std::result::Result<(), RedisError> = conn
                .xgroup_create_mkstream(queue, &subscription.group, FIRST_PENDING)
                .await;
            match created {
                Ok(()) => info!(queue = %queue, group = %subscription.group, "declared queue"),
                Err(err) if is_busy_group(&err) => {
                    debug!(queue = %queue, group = %subscription.group, "queue already declared")
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(RedisStreamChannel {
            conn,
            subscription: subscription.clone(),
            replay: Some(HashMap::new()),
        })
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let mut conn = self.connect().await?;
        let _: String = conn
            .xadd_maxlen(
                queue,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[(BODY_FIELD, body)],
            )
            .await?;
        Ok(())
    }
}

pub struct RedisStreamChannel {
    conn: MultiplexedConnection,
    subscription: Subscription,
    /// Set while paging through this consumer's pending list: the last entry
    /// id replayed per stream.
    replay: Option<HashMap<String, String>>,
}

impl fmt::Debug for RedisStreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStreamChannel")
            .field("subscription", &self.subscription)
            .field("replay", &self.replay)
            .finish()
    }
}

/// One `XREADGROUP` reply.
#[derive(Default)]
struct Page {
    deliveries: Vec<Delivery>,
    /// Last entry id per stream, trimmed entries included.
    last_ids: HashMap<String, String>,
    /// Whether some stream returned the full count.
    full: bool,
}

impl RedisStreamChannel {
    /// Read from each subscribed stream starting after `ids` (positionally
    /// matched to the queues). Pending-list reads never block.
    async fn read(&mut self, ids: &[String], count: usize, block: bool) -> Result<Page> {
        let sub = &self.subscription;
        let history = ids.iter().any(|id| id != NEW_ENTRIES);
        let mut options = StreamReadOptions::default()
            .group(&sub.group, &sub.consumer)
            .count(count);
        if block && !history {
            options = options.block(sub.idle_wait.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> =
            self.conn.xread_options(&sub.queues, ids, &options).await?;

        let mut page = Page::default();
        let mut tombstones = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            page.full |= stream.ids.len() >= count;
            if let Some(last) = stream.ids.last() {
                page.last_ids.insert(stream.key.clone(), last.id.clone());
            }
            for entry in stream.ids {
                match entry.get::<Vec<u8>>(BODY_FIELD) {
                    Some(body) => page.deliveries.push(Delivery {
                        queue: stream.key.clone(),
                        tag: entry.id,
                        body,
                        redelivered: history,
                    }),
                    // Trimmed entries come back from the pending list without
                    // fields; there is nothing left to deliver.
                    None => tombstones.push((stream.key.clone(), entry.id)),
                }
            }
        }

        for (queue, id) in tombstones {
            warn!(queue = %queue, id = %id, "acknowledging trimmed pending entry");
            let _: i64 = self.conn.xack(&queue, &sub.group, &[&id]).await?;
        }

        Ok(page)
    }

    fn new_entry_ids(&self) -> Vec<String> {
        vec![NEW_ENTRIES.to_string(); self.subscription.queues.len()]
    }
}

#[async_trait]
impl DeliveryChannel for RedisStreamChannel {
    async fn next_batch(&mut self) -> Result<Vec<Delivery>> {
        let prefetch = self.subscription.prefetch;

        if let Some(replay) = &self.replay {
            let ids: Vec<String> = self
                .subscription
                .queues
                .iter()
                .map(|queue| {
                    replay
                        .get(queue)
                        .cloned()
                        .unwrap_or_else(|| FIRST_PENDING.to_string())
                })
                .collect();
            let page = self.read(&ids, prefetch, false).await?;
            if page.full {
                if let Some(replay) = self.replay.as_mut() {
                    replay.extend(page.last_ids);
                }
                return Ok(page.deliveries);
            }
            self.replay = None;

            let mut batch = page.deliveries;
            let held = self
                .subscription
                .queues
                .iter()
                .map(|queue| batch.iter().filter(|d| &d.queue == queue).count())
                .max()
                .unwrap_or_default();
            let room = prefetch.saturating_sub(held);
            if room > 0 {
                let ids = self.new_entry_ids();
                batch.extend(self.read(&ids, room, false).await?.deliveries);
            }
            if !batch.is_empty() {
                return Ok(batch);
            }
        }

        let ids = self.new_entry_ids();
        Ok(self.read(&ids, prefetch, true).await?.deliveries)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let sub = &self.subscription;
        let acked: i64 = self
            .conn
            .xack(&delivery.queue, &sub.group, &[&delivery.tag])
            .await?;
        if acked == 0 {
            warn!(queue = %delivery.queue, tag = %delivery.tag, "ack for a delivery that was not pending");
        } else if sub.delete_on_ack {
            let _: i64 = self.conn.xdel(&delivery.queue, &[&delivery.tag]).await?;
        }
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<()> {
        debug!(queue = %delivery.queue, tag = %delivery.tag, "requeue via pending replay");
        self.replay = Some(HashMap::new());
        Ok(())
    }
}
