//! Build-side housekeeping. Builds are executed by external workers; the
//! reconciler only creates rows, enforces the timeout and reclaims stale
//! image leases.

use std::time::Duration;

use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::Result;

/// Fail builds stuck in `building` past the timeout. The owning deployment
/// cascades to `failed` on the next deployment sweep.
pub async fn fail_timed_out_builds(pool: &PgPool, timeout: Duration) -> Result<usize> {
    let timed_out: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE builds
         SET status = 'failed', failed_at = now(), updated_at = now()
         WHERE status = 'building'
           AND building_at <= now() - ($1 * interval '1 second')
         RETURNING id",
    )
    .bind(timeout.as_secs() as i64)
    .fetch_all(pool)
    .await?;

    for (id,) in &timed_out {
        warn!(build = %id, "build timed out");
    }

    Ok(timed_out.len())
}

/// Builder workers claim an image by CAS on `building_by`; a worker that died
/// mid-build leaves its lease behind. Leases older than ten minutes are
/// cleared so another worker can claim the image.
pub async fn reclaim_stale_image_leases(pool: &PgPool) -> Result<usize> {
    let result = sqlx::query(
        "UPDATE images
         SET building_by = NULL, building_started_at = NULL, updated_at = now()
         WHERE building_by IS NOT NULL
           AND building_started_at <= now() - interval '10 minutes'",
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected() as usize)
}
