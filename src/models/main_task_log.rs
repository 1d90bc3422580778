//! MainTaskLog is one execution instance of a BaseTask.
//! Maps to `manager.base_task_log`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::models::status::Status;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MainTaskLog {
    pub s_id: Uuid,
    pub base_task_id: Uuid,
    pub status_id: Uuid,
    /// The TaskLog currently in progress at the top level, when any.
    pub current_task_id: Option<Uuid>,
    pub add_task_date: Option<DateTime<Utc>>,
    pub exec_task_date: Option<DateTime<Utc>>,
    pub end_task_date: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "mtl.s_id, mtl.base_task_id, mtl.status_id, mtl.current_task_id, \
                       mtl.add_task_date, mtl.exec_task_date, mtl.end_task_date";

impl MainTaskLog {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<MainTaskLog>> {
        let row = sqlx::query_as::<_, MainTaskLog>(&format!(
            "SELECT {COLUMNS} FROM manager.base_task_log mtl WHERE mtl.s_id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Logs in `progress` that have no TaskLogs generated yet.
    pub async fn list_awaiting_generation(pool: &PgPool) -> Result<Vec<MainTaskLog>> {
        let rows = sqlx::query_as::<_, MainTaskLog>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.base_task_log mtl
            JOIN manager.task_status st ON st.s_id = mtl.status_id
            WHERE st.system_name = 'progress'
              AND NOT EXISTS (
                  SELECT 1 FROM manager.task_log tl WHERE tl.main_task_log_id = mtl.s_id
              )
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Logs in `cancel` that still have TaskLogs to cascade into.
    pub async fn list_awaiting_cancellation(pool: &PgPool) -> Result<Vec<MainTaskLog>> {
        let rows = sqlx::query_as::<_, MainTaskLog>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.base_task_log mtl
            JOIN manager.task_status st ON st.s_id = mtl.status_id
            WHERE st.system_name = 'cancel'
              AND EXISTS (
                  SELECT 1 FROM manager.task_log tl WHERE tl.main_task_log_id = mtl.s_id
              )
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// All logs currently in `progress` (aggregation candidates).
    pub async fn list_in_progress(pool: &PgPool) -> Result<Vec<MainTaskLog>> {
        let rows = sqlx::query_as::<_, MainTaskLog>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.base_task_log mtl
            JOIN manager.task_status st ON st.s_id = mtl.status_id
            WHERE st.system_name = 'progress'
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Statuses of the children, as (status system name, count) summary input.
    pub async fn child_statuses(pool: &PgPool, id: Uuid) -> Result<Vec<Status>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT st.system_name
            FROM manager.task_log tl
            JOIN manager.task_status st ON st.s_id = tl.status_id
            WHERE tl.main_task_log_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(name,)| Status::parse(&name))
            .collect())
    }

    /// Status-guarded transition; a no-op when the row moved on concurrently.
    pub async fn transition(
        pool: &PgPool,
        id: Uuid,
        expected_status_id: Uuid,
        new_status_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE manager.base_task_log SET status_id = $3 WHERE s_id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(expected_status_id)
        .bind(new_status_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Finish: stamp the end timestamp and clear the current pointer.
    pub async fn finish(
        pool: &PgPool,
        id: Uuid,
        expected_status_id: Uuid,
        finish_status_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE manager.base_task_log
            SET status_id = $3, end_task_date = NOW(), current_task_id = NULL
            WHERE s_id = $1 AND status_id = $2
            "#,
        )
        .bind(id)
        .bind(expected_status_id)
        .bind(finish_status_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the top-level TaskLog now executing and stamp the start time.
    pub async fn set_current_task(pool: &PgPool, id: Uuid, task_log_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE manager.base_task_log
            SET current_task_id = $2,
                exec_task_date = COALESCE(exec_task_date, NOW())
            WHERE s_id = $1
            "#,
        )
        .bind(id)
        .bind(task_log_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
