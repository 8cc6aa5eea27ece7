//! Command consumer: applies start/stop/params control messages for one
//! capability to the lease store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{
    DEFAULT_IDLE_WAIT, Delivery, DeliveryHandler, DeliveryLoop, MessageBroker, Outcome,
    Subscription,
};
use crate::error::{LeaseError, Result};
use crate::protocol::{
    ControlMessage, DEFAULT_LEASE_TTL_SECS, ParamsCommand, QueueNames, StartCommand, StopCommand,
};
use crate::retry::RetryPolicy;
use crate::store::{AssignmentRepository, SubscriptionRepository};
use crate::types::{Capability, WorkerId};

/// Unacknowledged control messages a consumer may hold.
pub const DEFAULT_CONTROL_PREFETCH: usize = 3;

#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    pub capability: Capability,
    pub worker_id: WorkerId,
    pub queues: QueueNames,
    pub default_lease_ttl_secs: i64,
    pub prefetch: usize,
    pub retry: RetryPolicy,
    pub idle_wait: Duration,
}

impl ConsumerSettings {
    pub fn new(capability: Capability, worker_id: WorkerId) -> Self {
        Self {
            capability,
            worker_id,
            queues: QueueNames::default(),
            default_lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
            prefetch: DEFAULT_CONTROL_PREFETCH,
            retry: RetryPolicy::default(),
            idle_wait: DEFAULT_IDLE_WAIT,
        }
    }

    /// One consumer group per capability, so every capability sees every
    /// message on the shared queues.
    pub fn subscription(&self) -> Subscription {
        Subscription::new(
            self.capability.as_str(),
            self.worker_id.as_str(),
            self.queues.control_queues(&self.capability),
            self.prefetch,
        )
        .with_idle_wait(self.idle_wait)
    }
}

#[derive(Debug)]
pub struct CommandConsumer<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    settings: ConsumerSettings,
}

impl<S, B> CommandConsumer<S, B>
where
    S: AssignmentRepository + SubscriptionRepository,
    B: MessageBroker,
{
    pub fn new(store: Arc<S>, broker: Arc<B>, settings: ConsumerSettings) -> Self {
        Self {
            store,
            broker,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Consume until `shutdown` fires. Connection failures are retried per
    /// the configured policy; nothing else ends the loop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            capability = %self.settings.capability,
            worker_id = %self.settings.worker_id,
            "command consumer starting"
        );
        let result = DeliveryLoop::new(
            self.broker.as_ref(),
            self,
            self.settings.subscription(),
            self.settings.retry,
        )
        .run(shutdown)
        .await;
        info!(capability = %self.settings.capability, "command consumer stopped");
        result
    }

    /// Decode and apply one control delivery.
    pub async fn apply(&self, delivery: &Delivery) -> Result<Outcome> {
        let settings = &self.settings;
        let kind = settings
            .queues
            .control_kind(&settings.capability, &delivery.queue)
            .ok_or_else(|| {
                LeaseError::Internal(format!("delivery from unexpected queue {}", delivery.queue))
            })?;
        let Some(message) =
            ControlMessage::decode_for(kind, &settings.capability, &delivery.body)?
        else {
            debug!(
                kind = kind.as_str(),
                queue = %delivery.queue,
                "control message for another capability"
            );
            return Ok(Outcome::Skipped);
        };

        match message {
            ControlMessage::Start(cmd) => self.start(cmd).await,
            ControlMessage::Stop(cmd) => self.stop(cmd).await,
            ControlMessage::Params(cmd) => self.params(cmd).await,
        }
    }

    async fn start(&self, cmd: StartCommand) -> Result<Outcome> {
        let settings = &self.settings;
        let ttl_secs = cmd
            .lease_ttl_secs
            .unwrap_or(settings.default_lease_ttl_secs);
        let assignment = self
            .store
            .start_lease(cmd.camera_id, &settings.capability, &settings.worker_id, ttl_secs)
            .await?;
        info!(
            camera_id = %cmd.camera_id,
            capability = %settings.capability,
            worker_id = %settings.worker_id,
            ttl_secs,
            lease_until = ?assignment.lease_until,
            "lease started"
        );
        Ok(Outcome::Applied)
    }

    async fn stop(&self, cmd: StopCommand) -> Result<Outcome> {
        let capability = &self.settings.capability;
        self.store.stop_lease(cmd.camera_id, capability).await?;
        info!(camera_id = %cmd.camera_id, capability = %capability, "lease stopped");
        Ok(Outcome::Applied)
    }

    async fn params(&self, cmd: ParamsCommand) -> Result<Outcome> {
        let capability = &self.settings.capability;
        let subscription = self
            .store
            .merge_params(cmd.camera_id, capability, &cmd.params)
            .await?;
        info!(
            camera_id = %cmd.camera_id,
            capability = %capability,
            params = %serde_json::Value::Object(subscription.params),
            "params merged"
        );
        Ok(Outcome::Applied)
    }
}

#[async_trait]
impl<S, B> DeliveryHandler for CommandConsumer<S, B>
where
    S: AssignmentRepository + SubscriptionRepository,
    B: MessageBroker,
{
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
        self.apply(delivery).await
    }
}
