//! # Vigil Core
//!
//! Lease-based work assignment for detection workers. A fleet of
//! per-capability worker processes claims cameras through control messages,
//! keeps its claims alive with periodic renewal, and loses them to the
//! janitor when renewal stops. Every component coordinates only through the
//! relational store.
//!
//! ## Components
//!
//! - [`consumer`]: applies start/stop/params control messages for one capability
//! - [`renewer`]: extends the leases a worker currently holds
//! - [`janitor`]: expires leases past their deadline
//! - [`ingestor`]: persists detection events idempotently
//! - [`store`]: persistence ports and the Postgres implementation
//! - [`broker`]: at-least-once queue transport (Redis Streams or in-process)
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use vigil_core::{
//!     Capability, ConsumerSettings, CommandConsumer, InProcBroker, LeaseRenewer,
//!     PostgresLeaseStore, WorkerId,
//! };
//!
//! async fn serve(pool: sqlx::PgPool) -> vigil_core::Result<()> {
//!     let store = Arc::new(PostgresLeaseStore::from_pool(pool));
//!     let broker = Arc::new(InProcBroker::new());
//!     let car = Capability::new("car")?;
//!     let me = WorkerId::new("car-host-a");
//!
//!     let shutdown = CancellationToken::new();
//!     let renewer = LeaseRenewer::new(store.clone(), car.clone(), me.clone());
//!     tokio::spawn({
//!         let shutdown = shutdown.clone();
//!         async move { renewer.run(shutdown).await }
//!     });
//!
//!     CommandConsumer::new(store, broker, ConsumerSettings::new(car, me))
//!         .run(shutdown)
//!         .await
//! }
//! ```

pub mod broker;
pub mod consumer;
pub mod error;
pub mod ingestor;
pub mod janitor;
pub mod protocol;
mod registry;
pub mod renewer;
pub mod retry;
pub mod store;
pub mod types;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use broker::{
    Delivery, DeliveryChannel, InProcBroker, MessageBroker, Outcome, RedisStreamBroker,
    Subscription,
};
pub use consumer::{CommandConsumer, ConsumerSettings};
pub use error::{LeaseError, Result};
pub use ingestor::{EventIngestor, IngestorSettings};
pub use janitor::LeaseJanitor;
pub use protocol::{ControlKind, ControlMessage, QueueNames};
pub use renewer::LeaseRenewer;
pub use retry::RetryPolicy;
pub use store::{
    AssignmentRepository, DetectionTypeRegistry, EventRepository, LeaseExpiryScanner,
    PostgresLeaseStore, SubscriptionRepository,
};
pub use types::{
    Assignment, AssignmentStatus, CameraId, CameraSubscription, Capability, DetectionTypeId,
    NewDetectionEvent, ParamMap, WorkerId,
};
