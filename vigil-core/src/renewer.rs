use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::AssignmentRepository;
use crate::types::{Capability, WorkerId};

pub const DEFAULT_RENEW_EVERY: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_EXTENSION: Duration = Duration::from_secs(20);

/// Keeps this worker's leases alive by extending them on a fixed interval.
///
/// Ownership is read from the store on every tick; the renewer holds no
/// record of which cameras it serves and never creates rows.
#[derive(Debug)]
pub struct LeaseRenewer<S> {
    store: Arc<S>,
    capability: Capability,
    worker_id: WorkerId,
    every: Duration,
    extension: Duration,
}

impl<S> LeaseRenewer<S>
where
    S: AssignmentRepository,
{
    pub fn new(store: Arc<S>, capability: Capability, worker_id: WorkerId) -> Self {
        Self {
            store,
            capability,
            worker_id,
            every: DEFAULT_RENEW_EVERY,
            extension: DEFAULT_LEASE_EXTENSION,
        }
    }

    pub fn with_interval(mut self, every: Duration) -> Self {
        self.every = every;
        self
    }

    pub fn with_extension(mut self, extension: Duration) -> Self {
        self.extension = extension;
        self
    }

    /// One renewal pass. Returns the number of leases extended.
    pub async fn tick(&self) -> Result<u64> {
        let extension_secs = i64::try_from(self.extension.as_secs()).unwrap_or(i64::MAX);
        let renewed = self
            .store
            .renew_leases(&self.capability, &self.worker_id, extension_secs)
            .await?;
        debug!(
            capability = %self.capability,
            worker_id = %self.worker_id,
            renewed,
            extension_secs,
            "renewal tick"
        );
        Ok(renewed)
    }

    /// Wait one interval, renew, repeat until `shutdown` fires. Store errors
    /// are logged and the next tick tries again.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            capability = %self.capability,
            worker_id = %self.worker_id,
            every_ms = self.every.as_millis() as u64,
            extension_secs = self.extension.as_secs(),
            "lease renewer starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker_id = %self.worker_id, "lease renewer shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.every) => {
                    if let Err(err) = self.tick().await {
                        warn!(worker_id = %self.worker_id, error = %err, "lease renewal failed");
                    }
                }
            }
        }
    }
}
