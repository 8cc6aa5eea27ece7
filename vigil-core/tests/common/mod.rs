#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use vigil_core::{Capability, InProcBroker, WorkerId};

pub fn car() -> Capability {
    Capability::new("car").expect("capability")
}

pub fn worker(name: &str) -> WorkerId {
    WorkerId::new(name)
}

/// Current time on the database clock.
pub async fn db_now(pool: &PgPool) -> DateTime<Utc> {
    sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
        .fetch_one(pool)
        .await
        .expect("db now")
}

/// Put every row for `camera_id` at `offset_secs` from now, as if time had
/// moved on since the lease was written.
pub async fn set_lease_offset(pool: &PgPool, camera_id: i64, offset_secs: i64) {
    sqlx::query(
        "UPDATE assignment SET lease_until = NOW() + ($2::bigint) * INTERVAL '1 second' WHERE camera_id = $1",
    )
    .bind(camera_id)
    .bind(offset_secs)
    .execute(pool)
    .await
    .expect("shift lease");
}

pub fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>, tolerance_secs: i64) {
    let drift = (actual - expected).num_milliseconds().abs();
    assert!(
        drift <= tolerance_secs * 1_000,
        "expected {actual} within {tolerance_secs}s of {expected}"
    );
}

/// Wait until `group` holds nothing pending or unread on any of `queues`.
pub async fn wait_until_drained(broker: &InProcBroker, group: &str, queues: &[String]) {
    for _ in 0..500 {
        let mut busy = false;
        for queue in queues {
            if broker.pending_count(queue, group).await > 0 || broker.backlog(queue, group).await > 0
            {
                busy = true;
            }
        }
        if !busy {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queues {queues:?} did not drain for group {group}");
}
