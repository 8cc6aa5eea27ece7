use sqlx::PgConnection;

use crate::error::Result;
use crate::types::{Capability, DetectionTypeId};

/// Insert-then-select keeps first use race free: two processes that both see
/// an unknown name each run a no-op insert for the loser and read the same
/// id back.
pub(crate) async fn resolve_detection_type(
    conn: &mut PgConnection,
    name: &Capability,
) -> Result<DetectionTypeId> {
    sqlx::query(
        r#"
        INSERT INTO detection_type (name)
        VALUES ($1)
        ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(name.as_str())
    .execute(&mut *conn)
    .await?;

    let id = sqlx::query_scalar::<_, i32>(
        r#"
        SELECT id
        FROM detection_type
        WHERE name = $1
        "#,
    )
    .bind(name.as_str())
    .fetch_one(&mut *conn)
    .await?;

    Ok(DetectionTypeId(id))
}
