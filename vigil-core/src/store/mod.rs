//! Persistence ports for the lease protocol.
//!
//! The relational store is the only synchronization point between worker
//! processes, their renewal loops and the janitor. Every method here is a
//! single statement (or a single transaction) whose row-level write
//! semantics give the protocol its consistency; callers never hold state
//! between calls.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Assignment, CameraId, CameraSubscription, Capability, DetectionTypeId, NewDetectionEvent,
    ParamMap, WorkerId,
};

pub mod postgres;

pub use postgres::PostgresLeaseStore;

/// Lazily maps capability names to durable identifiers.
#[async_trait]
pub trait DetectionTypeRegistry: Send + Sync {
    /// Insert `name` if unseen, then return its id. Concurrent first use from
    /// several processes resolves to the same id without error.
    async fn resolve(&self, name: &Capability) -> Result<DetectionTypeId>;
}

/// Writes that move an assignment between `stopped`, `leased` and `expired`.
#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    /// Reset the lease on `(camera, capability)` to `worker` for `ttl_secs`
    /// from now, overwriting any previous owner.
    async fn start_lease(
        &self,
        camera_id: CameraId,
        capability: &Capability,
        worker: &WorkerId,
        ttl_secs: i64,
    ) -> Result<Assignment>;

    /// Release the pair unconditionally, creating the row if needed.
    async fn stop_lease(&self, camera_id: CameraId, capability: &Capability) -> Result<Assignment>;

    /// Extend every lease `worker` holds for `capability` to
    /// `max(lease_until, now) + extension_secs`. Returns rows touched.
    async fn renew_leases(
        &self,
        capability: &Capability,
        worker: &WorkerId,
        extension_secs: i64,
    ) -> Result<u64>;

    /// Current row for the pair, if one was ever written.
    async fn assignment(
        &self,
        camera_id: CameraId,
        capability: &Capability,
    ) -> Result<Option<Assignment>>;
}

/// Housekeeping capability used by the janitor process.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// Move every leased row past its expiry to `expired`. Returns rows
    /// transitioned.
    async fn expire_leases(&self) -> Result<u64>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Merge `params` over the stored mapping and force `enabled`.
    async fn merge_params(
        &self,
        camera_id: CameraId,
        capability: &Capability,
        params: &ParamMap,
    ) -> Result<CameraSubscription>;

    async fn subscription(
        &self,
        camera_id: CameraId,
        capability: &Capability,
    ) -> Result<Option<CameraSubscription>>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert the event unless an equivalent one is already stored. Returns
    /// `true` when a row was written.
    async fn insert_event(&self, event: &NewDetectionEvent) -> Result<bool>;
}
