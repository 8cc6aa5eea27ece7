//! Event ingestor: persists detection results from the shared event queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{
    DEFAULT_IDLE_WAIT, Delivery, DeliveryHandler, DeliveryLoop, MessageBroker, Outcome,
    Subscription,
};
use crate::error::Result;
use crate::protocol::{QueueNames, decode_event};
use crate::retry::RetryPolicy;
use crate::store::EventRepository;

pub const DEFAULT_EVENT_PREFETCH: usize = 50;
pub const INGESTOR_GROUP: &str = "ingestor";

#[derive(Clone, Debug)]
pub struct IngestorSettings {
    pub consumer_name: String,
    pub queues: QueueNames,
    pub prefetch: usize,
    pub retry: RetryPolicy,
    pub idle_wait: Duration,
}

impl IngestorSettings {
    pub fn new(consumer_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            queues: QueueNames::default(),
            prefetch: DEFAULT_EVENT_PREFETCH,
            retry: RetryPolicy::default(),
            idle_wait: DEFAULT_IDLE_WAIT,
        }
    }

    /// Ingestor instances share one group and split the queue between them.
    pub fn subscription(&self) -> Subscription {
        Subscription::new(
            INGESTOR_GROUP,
            self.consumer_name.as_str(),
            vec![self.queues.events()],
            self.prefetch,
        )
        .with_idle_wait(self.idle_wait)
        .with_delete_on_ack()
    }
}

#[derive(Debug)]
pub struct EventIngestor<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    settings: IngestorSettings,
}

impl<S, B> EventIngestor<S, B>
where
    S: EventRepository,
    B: MessageBroker,
{
    pub fn new(store: Arc<S>, broker: Arc<B>, settings: IngestorSettings) -> Self {
        Self {
            store,
            broker,
            settings,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(consumer = %self.settings.consumer_name, "event ingestor starting");
        let result = DeliveryLoop::new(
            self.broker.as_ref(),
            self,
            self.settings.subscription(),
            self.settings.retry,
        )
        .unordered()
        .run(shutdown)
        .await;
        info!(consumer = %self.settings.consumer_name, "event ingestor stopped");
        result
    }

    pub async fn ingest(&self, delivery: &Delivery) -> Result<Outcome> {
        let event = decode_event(&delivery.body)?;
        let inserted = self.store.insert_event(&event).await?;
        debug!(
            event_id = ?event.event_id,
            camera_id = %event.camera_id,
            detection_type = %event.detection_type,
            inserted,
            "detection event ingested"
        );
        Ok(if inserted {
            Outcome::Applied
        } else {
            Outcome::Skipped
        })
    }
}

#[async_trait]
impl<S, B> DeliveryHandler for EventIngestor<S, B>
where
    S: EventRepository,
    B: MessageBroker,
{
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
        self.ingest(delivery).await
    }
}
