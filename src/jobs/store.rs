use super::types::{
    JobKind, JobRow, Queue, JOB_STATUS_COMPLETED, JOB_STATUS_FAILED, JOB_STATUS_PENDING,
    JOB_STATUS_RUNNING,
};
use crate::ids::dedup_key_hash;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use uuid::Uuid;

const JOB_COLUMNS: &str = r#"
    id, kind, queue, payload, dedup_key, status, attempts, not_before,
    created_at, updated_at, started_at, completed_at, last_error
"#;

/// Creates a job unless an active one with the same (kind, dedup key)
/// already exists. Returns the row and whether it was freshly created.
pub async fn enqueue(
    db: &PgPool,
    kind: JobKind,
    payload: JsonValue,
    dedup_key: Option<&str>,
) -> Result<(JobRow, bool), sqlx::Error> {
    let dedup_key = dedup_key.map(str::trim).filter(|key| !key.is_empty());
    let dedup_hash = dedup_key.map(|key| dedup_key_hash(kind.name(), key));

    if let Some(hash) = dedup_hash.as_deref() {
        let existing: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE kind = $1 AND dedup_hash = $2 AND status IN ($3, $4)
            LIMIT 1
            "#
        ))
        .bind(kind.name())
        .bind(hash)
        .bind(JOB_STATUS_PENDING)
        .bind(JOB_STATUS_RUNNING)
        .fetch_optional(db)
        .await?;
        if let Some(existing) = existing {
            return Ok((existing, false));
        }
    }

    let inserted: JobRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO jobs (
            id, kind, queue, payload, dedup_key, dedup_hash, status, attempts,
            not_before, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 0, now(), now(), now())
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(kind.name())
    .bind(kind.queue().as_str())
    .bind(SqlJson(payload))
    .bind(dedup_key)
    .bind(dedup_hash.as_deref())
    .bind(JOB_STATUS_PENDING)
    .fetch_one(db)
    .await?;

    Ok((inserted, true))
}

/// Active job for a (kind, dedup key), if one exists.
pub async fn find_active(
    db: &PgPool,
    kind: JobKind,
    dedup_key: &str,
) -> Result<Option<JobRow>, sqlx::Error> {
    let hash = dedup_key_hash(kind.name(), dedup_key);
    sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE kind = $1 AND dedup_hash = $2 AND status IN ($3, $4)
        LIMIT 1
        "#
    ))
    .bind(kind.name())
    .bind(hash)
    .bind(JOB_STATUS_PENDING)
    .bind(JOB_STATUS_RUNNING)
    .fetch_optional(db)
    .await
}

/// Claims the oldest runnable job on a queue, bumping its attempt counter.
/// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from double-claiming.
pub async fn claim_next_pending(db: &PgPool, queue: Queue) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        WITH next AS (
            SELECT id
            FROM jobs
            WHERE queue = $1 AND status = $2 AND not_before <= now()
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE jobs
        SET status = $3,
            attempts = attempts + 1,
            started_at = now(),
            updated_at = now()
        WHERE id IN (SELECT id FROM next)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(queue.as_str())
    .bind(JOB_STATUS_PENDING)
    .bind(JOB_STATUS_RUNNING)
    .fetch_optional(db)
    .await
}

pub async fn mark_completed(
    db: &PgPool,
    job_id: Uuid,
    result: JsonValue,
) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO job_results (job_id, result, created_at)
        VALUES ($1, $2, now())
        ON CONFLICT (job_id)
        DO UPDATE SET result = EXCLUDED.result, created_at = now()
        "#,
    )
    .bind(job_id)
    .bind(SqlJson(result))
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, completed_at = now(), updated_at = now(), last_error = NULL
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_COMPLETED)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Schedules another attempt after a transient failure.
pub async fn mark_retry(
    db: &PgPool,
    job_id: Uuid,
    not_before: DateTime<Utc>,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, not_before = $3, updated_at = now(), last_error = $4
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_PENDING)
    .bind(not_before)
    .bind(error)
    .execute(db)
    .await?;
    Ok(())
}

/// Quarantine: the job stops retrying but keeps its payload and last error
/// for inspection and manual replay.
pub async fn mark_quarantined(db: &PgPool, job_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, completed_at = now(), updated_at = now(), last_error = $3
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_FAILED)
    .bind(error)
    .execute(db)
    .await?;
    Ok(())
}

/// Cooperative cancellation re-enqueues without consuming the attempt the
/// claim charged.
pub async fn mark_cancelled_requeue(db: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            attempts = GREATEST(attempts - 1, 0),
            not_before = now(),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_PENDING)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn job(db: &PgPool, job_id: Uuid) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE id = $1
        LIMIT 1
        "#
    ))
    .bind(job_id)
    .fetch_optional(db)
    .await
}

pub async fn job_result(db: &PgPool, job_id: Uuid) -> Result<Option<JsonValue>, sqlx::Error> {
    #[derive(sqlx::FromRow)]
    struct Row {
        result: SqlJson<JsonValue>,
    }
    let row: Option<Row> = sqlx::query_as(
        r#"
        SELECT result
        FROM job_results
        WHERE job_id = $1
        LIMIT 1
        "#,
    )
    .bind(job_id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|row| row.result.0))
}

pub async fn pending_count(db: &PgPool, queue: Queue) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)::BIGINT
        FROM jobs
        WHERE queue = $1 AND status = $2
        "#,
    )
    .bind(queue.as_str())
    .bind(JOB_STATUS_PENDING)
    .fetch_one(db)
    .await?;
    Ok(row.0)
}

#[derive(Debug, sqlx::FromRow)]
pub struct QueueDepthRow {
    pub queue: String,
    pub status: String,
    pub count: i64,
}

pub async fn queue_depths(db: &PgPool) -> Result<Vec<QueueDepthRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT queue, status, COUNT(*)::BIGINT AS count
        FROM jobs
        GROUP BY queue, status
        ORDER BY queue, status
        "#,
    )
    .fetch_all(db)
    .await
}
