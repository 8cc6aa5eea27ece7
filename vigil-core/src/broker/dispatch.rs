//! Consume-handle-acknowledge loop shared by the command consumer and the
//! event ingestor.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Delivery, DeliveryChannel, MessageBroker, Subscription};
use crate::error::{LeaseError, Result};
use crate::retry::RetryPolicy;

/// What a handler did with a delivery it accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The store write committed.
    Applied,
    /// Valid, but addressed to someone else or already recorded.
    Skipped,
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Process one delivery to completion. `Ok` acknowledges it; `Err`
    /// requeues it.
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome>;
}

/// Why a subscribed channel stopped reading.
enum Interrupted {
    Shutdown,
    Failed(LeaseError),
}

/// Drives one [`DeliveryHandler`] against a broker until shutdown.
pub struct DeliveryLoop<'a, B, H> {
    broker: &'a B,
    handler: &'a H,
    subscription: Subscription,
    retry: RetryPolicy,
    ordered: bool,
}

impl<B, H> fmt::Debug for DeliveryLoop<'_, B, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryLoop")
            .field("subscription", &self.subscription)
            .field("retry", &self.retry)
            .field("ordered", &self.ordered)
            .finish()
    }
}

impl<'a, B, H> DeliveryLoop<'a, B, H>
where
    B: MessageBroker,
    H: DeliveryHandler,
{
    pub fn new(broker: &'a B, handler: &'a H, subscription: Subscription, retry: RetryPolicy) -> Self {
        Self {
            broker,
            handler,
            subscription,
            retry,
            ordered: true,
        }
    }

    /// Keep handling the rest of a batch after a delivery is requeued. By
    /// default the batch is dropped so later messages are never applied
    /// before an earlier one on the same queue.
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }

    /// Subscribe, drain, and on connection failure wait and subscribe again.
    /// Returns once `shutdown` fires, or with the last error if the retry
    /// policy gives up.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let sub = &self.subscription;
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let failure = match self.broker.subscribe(sub).await {
                Ok(channel) => {
                    attempt = 0;
                    info!(
                        group = %sub.group,
                        consumer = %sub.consumer,
                        queues = ?sub.queues,
                        prefetch = sub.prefetch,
                        "consuming"
                    );
                    match self.drain(channel, &shutdown).await {
                        Interrupted::Shutdown => return Ok(()),
                        Interrupted::Failed(err) => err,
                    }
                }
                Err(err) => err,
            };

            attempt = attempt.saturating_add(1);
            let Some(delay) = self.retry.delay_for(attempt) else {
                return Err(failure);
            };
            warn!(
                group = %sub.group,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "broker or store unavailable; reconnecting"
            );

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn drain(&self, mut channel: B::Channel, shutdown: &CancellationToken) -> Interrupted {
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => return Interrupted::Shutdown,
                batch = channel.next_batch() => batch,
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => return Interrupted::Failed(err),
            };

            for delivery in &batch {
                if shutdown.is_cancelled() {
                    // Unacknowledged deliveries stay pending for the next run.
                    return Interrupted::Shutdown;
                }
                match self.dispatch(&mut channel, delivery).await {
                    // Requeued: the rest of this batch comes back behind it.
                    Ok(false) if self.ordered => break,
                    Ok(_) => {}
                    Err(err) => return Interrupted::Failed(err),
                }
            }
        }
    }

    /// Returns whether the delivery was acknowledged.
    async fn dispatch(&self, channel: &mut B::Channel, delivery: &Delivery) -> Result<bool> {
        match self.handler.handle(delivery).await {
            Ok(outcome) => {
                channel.ack(delivery).await?;
                debug!(
                    queue = %delivery.queue,
                    tag = %delivery.tag,
                    redelivered = delivery.redelivered,
                    ?outcome,
                    "acknowledged"
                );
                Ok(true)
            }
            Err(err) => {
                channel.nack(delivery).await?;
                if err.is_transient() {
                    // Redelivery cannot succeed until the connection is back;
                    // let the reconnect delay apply instead of spinning.
                    return Err(err);
                }
                error!(
                    queue = %delivery.queue,
                    tag = %delivery.tag,
                    redelivered = delivery.redelivered,
                    error = %err,
                    "handler failed; requeued"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;
    use crate::broker::InProcBroker;

    /// Records bodies in handling order; fails the first `fail_first`
    /// attempts on any body equal to `poison`.
    struct Recorder {
        seen: Mutex<Vec<Vec<u8>>>,
        poison: Vec<u8>,
        fail_first: usize,
        failures: AtomicUsize,
        transient: bool,
    }

    impl Recorder {
        fn new(poison: &[u8], fail_first: usize, transient: bool) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                poison: poison.to_vec(),
                fail_first,
                failures: AtomicUsize::new(0),
                transient,
            }
        }
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
            self.seen.lock().await.push(delivery.body.clone());
            if delivery.body == self.poison
                && self.failures.fetch_add(1, Ordering::SeqCst) < self.fail_first
            {
                return Err(if self.transient {
                    LeaseError::ChannelClosed("store went away".into())
                } else {
                    LeaseError::InvalidMessage("not yet".into())
                });
            }
            Ok(Outcome::Applied)
        }
    }

    fn subscription() -> Subscription {
        Subscription::new("car", "car-test", vec!["q".into()], 3)
            .with_idle_wait(Duration::from_millis(10))
    }

    async fn run_until_idle(
        broker: &InProcBroker,
        delivery_loop: DeliveryLoop<'_, InProcBroker, Recorder>,
    ) {
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let broker_view = broker.clone();
        let waiter = tokio::spawn(async move {
            for _ in 0..200 {
                if broker_view.pending_count("q", "car").await == 0
                    && broker_view.backlog("q", "car").await == 0
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        delivery_loop.run(shutdown).await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_before_later_messages() {
        let broker = InProcBroker::new();
        for body in [b"a", b"b", b"c"] {
            broker.publish("q", body).await.unwrap();
        }
        let handler = Recorder::new(b"b", 1, false);

        run_until_idle(
            &broker,
            DeliveryLoop::new(&broker, &handler, subscription(), RetryPolicy::default()),
        )
        .await;

        let seen = handler.seen.lock().await.clone();
        assert_eq!(
            seen,
            vec![b"a".to_vec(), b"b".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[tokio::test]
    async fn unordered_loop_keeps_going_past_a_failing_delivery() {
        let broker = InProcBroker::new();
        for body in [b"a", b"p", b"c"] {
            broker.publish("q", body).await.unwrap();
        }
        let handler = Recorder::new(b"p", 3, false);

        run_until_idle(
            &broker,
            DeliveryLoop::new(&broker, &handler, subscription(), RetryPolicy::default()).unordered(),
        )
        .await;

        let seen = handler.seen.lock().await.clone();
        assert_eq!(seen[..3], [b"a".to_vec(), b"p".to_vec(), b"c".to_vec()]);
        assert_eq!(seen.iter().filter(|body| body.as_slice() == b"p").count(), 4);
        assert_eq!(broker.backlog("q", "car").await, 0);
    }

    #[tokio::test]
    async fn transient_failure_reconnects_and_replays() {
        let broker = InProcBroker::new();
        broker.publish("q", b"x").await.unwrap();
        let handler = Recorder::new(b"x", 2, true);

        let retry = RetryPolicy::FixedDelay(Duration::from_millis(5));
        run_until_idle(&broker, DeliveryLoop::new(&broker, &handler, subscription(), retry)).await;

        assert_eq!(handler.seen.lock().await.len(), 3);
        assert_eq!(broker.pending_count("q", "car").await, 0);
    }

    #[tokio::test]
    async fn shutdown_before_start_returns_immediately() {
        let broker = InProcBroker::new();
        let handler = Recorder::new(b"", 0, false);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = DeliveryLoop::new(&broker, &handler, subscription(), RetryPolicy::default())
            .run(shutdown)
            .await;
        assert!(result.is_ok());
        assert!(handler.seen.lock().await.is_empty());
    }
}
