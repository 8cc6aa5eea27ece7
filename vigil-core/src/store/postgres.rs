//! Postgres implementation of the lease store.
//!
//! All timestamps come from the database clock (`NOW()`), so workers, the
//! janitor and the ingestor agree on "now" regardless of host clock skew.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, types::Json};
use tracing::debug;

use super::{
    AssignmentRepository, DetectionTypeRegistry, EventRepository, LeaseExpiryScanner,
    SubscriptionRepository,
};
use crate::error::Result;
use crate::registry::resolve_detection_type;
use crate::types::{
    Assignment, AssignmentStatus, CameraId, CameraSubscription, Capability, DetectionTypeId,
    NewDetectionEvent, ParamMap, WorkerId,
};

/// Shared handle over a connection pool; cheap to clone into each task.
#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresLeaseStore")
            .field("pool_size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .finish()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AssignmentRow {
    camera_id: i64,
    detection_type_id: i32,
    worker_id: Option<String>,
    lease_until: Option<DateTime<Utc>>,
    status: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = crate::error::LeaseError;

    fn try_from(row: AssignmentRow) -> Result<Self> {
        Ok(Assignment {
            camera_id: CameraId(row.camera_id),
            detection_type_id: DetectionTypeId(row.detection_type_id),
            worker_id: row.worker_id.map(WorkerId::new),
            lease_until: row.lease_until,
            status: AssignmentStatus::parse(&row.status)?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    camera_id: i64,
    detection_type_id: i32,
    params: Json<ParamMap>,
    enabled: bool,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for CameraSubscription {
    fn from(row: SubscriptionRow) -> Self {
        CameraSubscription {
            camera_id: CameraId(row.camera_id),
            detection_type_id: DetectionTypeId(row.detection_type_id),
            params: row.params.0,
            enabled: row.enabled,
            updated_at: row.updated_at,
        }
    }
}

impl PostgresLeaseStore {
    /// Wrap an existing pool. No I/O happens here; connectivity problems
    /// surface on the first statement and are retried by the caller.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DetectionTypeRegistry for PostgresLeaseStore {
    async fn resolve(&self, name: &Capability) -> Result<DetectionTypeId> {
        let mut conn = self.pool.acquire().await?;
        resolve_detection_type(&mut conn, name).await
    }
}

#[async_trait]
impl AssignmentRepository for PostgresLeaseStore {
    async fn start_lease(
        &self,
        camera_id: CameraId,
        capability: &Capability,
        worker: &WorkerId,
        ttl_secs: i64,
    ) -> Result<Assignment> {
        let mut tx = self.pool.begin().await?;
        let detection_type_id = resolve_detection_type(&mut tx, capability).await?;

        let row = sqlx::query_as::<_, AssignmentRow>(
            r#"
            INSERT INTO assignment (camera_id, detection_type_id, worker_id, lease_until, status, updated_at)
            VALUES ($1, $2, $3, NOW() + ($4::bigint) * INTERVAL '1 second', 'leased', NOW())
            ON CONFLICT (camera_id, detection_type_id) DO UPDATE
            SET worker_id = EXCLUDED.worker_id,
                lease_until = EXCLUDED.lease_until,
                status = 'leased',
                updated_at = NOW()
            RETURNING camera_id, detection_type_id, worker_id, lease_until, status, updated_at
            "#,
        )
        .bind(camera_id.0)
        .bind(detection_type_id.0)
        .bind(worker.as_str())
        .bind(ttl_secs)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn stop_lease(&self, camera_id: CameraId, capability: &Capability) -> Result<Assignment> {
        let mut tx = self.pool.begin().await?;
        let detection_type_id = resolve_detection_type(&mut tx, capability).await?;

        let row = sqlx::query_as::<_, AssignmentRow>(
            r#"
            INSERT INTO assignment (camera_id, detection_type_id, worker_id, lease_until, status, updated_at)
            VALUES ($1, $2, NULL, NULL, 'stopped', NOW())
            ON CONFLICT (camera_id, detection_type_id) DO UPDATE
            SET worker_id = NULL,
                lease_until = NULL,
                status = 'stopped',
                updated_at = NOW()
            RETURNING camera_id, detection_type_id, worker_id, lease_until, status, updated_at
            "#,
        )
        .bind(camera_id.0)
        .bind(detection_type_id.0)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn renew_leases(
        &self,
        capability: &Capability,
        worker: &WorkerId,
        extension_secs: i64,
    ) -> Result<u64> {
        // GREATEST keeps the extension monotonic: a late tick never pulls
        // lease_until back below what was last written.
        let result = sqlx::query(
            r#"
            UPDATE assignment a
            SET lease_until = GREATEST(a.lease_until, NOW()) + ($3::bigint) * INTERVAL '1 second',
                updated_at = NOW()
            FROM detection_type dt
            WHERE a.detection_type_id = dt.id
              AND dt.name = $1
              AND a.worker_id = $2
              AND a.status = 'leased'
            "#,
        )
        .bind(capability.as_str())
        .bind(worker.as_str())
        .bind(extension_secs)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn assignment(
        &self,
        camera_id: CameraId,
        capability: &Capability,
    ) -> Result<Option<Assignment>> {
        let row = sqlx::query_as::<_, AssignmentRow>(
            r#"
            SELECT a.camera_id, a.detection_type_id, a.worker_id, a.lease_until, a.status, a.updated_at
            FROM assignment a
            JOIN detection_type dt ON dt.id = a.detection_type_id
            WHERE a.camera_id = $1
              AND dt.name = $2
            "#,
        )
        .bind(camera_id.0)
        .bind(capability.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Assignment::try_from).transpose()
    }
}

#[async_trait]
impl LeaseExpiryScanner for PostgresLeaseStore {
    async fn expire_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE assignment
            SET status = 'expired',
                worker_id = NULL,
                lease_until = NULL,
                updated_at = NOW()
            WHERE status = 'leased'
              AND lease_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SubscriptionRepository for PostgresLeaseStore {
    async fn merge_params(
        &self,
        camera_id: CameraId,
        capability: &Capability,
        params: &ParamMap,
    ) -> Result<CameraSubscription> {
        let mut tx = self.pool.begin().await?;
        let detection_type_id = resolve_detection_type(&mut tx, capability).await?;

        // jsonb `||` is a shallow merge: right-hand keys win, the rest stay.
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO camera_subscription (camera_id, detection_type_id, params, enabled, updated_at)
            VALUES ($1, $2, $3, TRUE, NOW())
            ON CONFLICT (camera_id, detection_type_id) DO UPDATE
            SET params = camera_subscription.params || EXCLUDED.params,
                enabled = TRUE,
                updated_at = NOW()
            RETURNING camera_id, detection_type_id, params, enabled, updated_at
            "#,
        )
        .bind(camera_id.0)
        .bind(detection_type_id.0)
        .bind(Json(params))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn subscription(
        &self,
        camera_id: CameraId,
        capability: &Capability,
    ) -> Result<Option<CameraSubscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.camera_id, s.detection_type_id, s.params, s.enabled, s.updated_at
            FROM camera_subscription s
            JOIN detection_type dt ON dt.id = s.detection_type_id
            WHERE s.camera_id = $1
              AND dt.name = $2
            "#,
        )
        .bind(camera_id.0)
        .bind(capability.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CameraSubscription::from))
    }
}

#[async_trait]
impl EventRepository for PostgresLeaseStore {
    async fn insert_event(&self, event: &NewDetectionEvent) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let detection_type_id = resolve_detection_type(&mut tx, &event.detection_type).await?;

        // No conflict target: both the event_id index and the natural-key
        // index turn a duplicate into a no-op.
        let result = sqlx::query(
            r#"
            INSERT INTO det_event (event_id, camera_id, detection_type_id, ts, cls, conf)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(event.event_id.as_deref())
        .bind(event.camera_id.0)
        .bind(detection_type_id.0)
        .bind(event.ts)
        .bind(event.cls.as_deref())
        .bind(event.conf)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!(
                event_id = ?event.event_id,
                camera_id = %event.camera_id,
                "duplicate detection event ignored"
            );
        }
        Ok(inserted)
    }
}
