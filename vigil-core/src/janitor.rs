use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::LeaseExpiryScanner;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Reclaims leases whose owner stopped renewing. The only writer that moves
/// an assignment to `expired`.
#[derive(Debug)]
pub struct LeaseJanitor<S> {
    store: Arc<S>,
    interval: Duration,
}

impl<S> LeaseJanitor<S>
where
    S: LeaseExpiryScanner,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn sweep(&self) -> Result<u64> {
        let expired = self.store.expire_leases().await?;
        if expired > 0 {
            info!(expired, "expired stale leases");
        } else {
            debug!("no stale leases");
        }
        Ok(expired)
    }

    /// Sweep immediately, then once per interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "lease janitor starting"
        );
        loop {
            if let Err(err) = self.sweep().await {
                warn!(error = %err, "lease sweep failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("lease janitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
