//! TaskLog is one execution instance of an Action within a MainTaskLog.
//! Maps to `manager.task_log`; object links map to `manager.object_to_task_log`.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskLog {
    pub s_id: Uuid,
    pub main_task_log_id: Uuid,
    pub action_id: Uuid,
    pub status_id: Uuid,
}

/// Link between a TaskLog and an external business object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ObjectToTaskLog {
    pub s_id: Uuid,
    pub task_log_id: Uuid,
    pub object_id: Uuid,
}

const COLUMNS: &str = "tl.s_id, tl.main_task_log_id, tl.action_id, tl.status_id";

impl TaskLog {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<TaskLog>> {
        let row = sqlx::query_as::<_, TaskLog>(&format!(
            "SELECT {COLUMNS} FROM manager.task_log tl WHERE tl.s_id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Bulk insert one MainTaskLog's sequence, in order; the caller decides
    /// each row's status. The parent row is locked and the insert skipped
    /// entirely (empty result) when a sequence already exists, so racing
    /// generators cannot double-instantiate.
    pub async fn bulk_create(
        pool: &PgPool,
        main_task_log_id: Uuid,
        rows: &[(Uuid, Uuid)], // (action_id, status_id)
    ) -> Result<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(rows.len());
        let mut tx = pool.begin().await?;
        sqlx::query("SELECT 1 FROM manager.base_task_log WHERE s_id = $1 FOR UPDATE")
            .bind(main_task_log_id)
            .execute(&mut *tx)
            .await?;
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM manager.task_log WHERE main_task_log_id = $1)",
        )
        .bind(main_task_log_id)
        .fetch_one(&mut *tx)
        .await?;
        if exists {
            return Ok(Vec::new());
        }
        for (action_id, status_id) in rows {
            let (id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO manager.task_log (s_id, main_task_log_id, action_id, status_id)
                VALUES (gen_random_uuid(), $1, $2, $3)
                RETURNING s_id
                "#,
            )
            .bind(main_task_log_id)
            .bind(action_id)
            .bind(status_id)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Logs in `progress` whose target module is currently healthy.
    pub async fn list_dispatchable(pool: &PgPool) -> Result<Vec<TaskLog>> {
        let rows = sqlx::query_as::<_, TaskLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.task_log tl
            JOIN manager.task_status st ON st.s_id = tl.status_id
            JOIN manager.action a ON a.s_id = tl.action_id
            JOIN manager.method_module m ON m.s_id = a.method_id
            JOIN manager.module md ON md.s_id = m.module_id
            WHERE st.system_name = 'progress' AND md.status = TRUE
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Progress logs bound to the given module's methods that never produced
    /// an expansion; re-dispatch candidates after the module reconnects.
    pub async fn list_redispatchable_for_module(
        pool: &PgPool,
        module_id: Uuid,
    ) -> Result<Vec<TaskLog>> {
        let rows = sqlx::query_as::<_, TaskLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.task_log tl
            JOIN manager.task_status st ON st.s_id = tl.status_id
            JOIN manager.action a ON a.s_id = tl.action_id
            JOIN manager.method_module m ON m.s_id = a.method_id
            WHERE st.system_name = 'progress' AND m.module_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM manager.command_log cl WHERE cl.task_log_id = tl.s_id
              )
            "#
        ))
        .bind(module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Cancelled logs that still hold live CommandLogs.
    pub async fn list_awaiting_cancellation(pool: &PgPool) -> Result<Vec<TaskLog>> {
        let rows = sqlx::query_as::<_, TaskLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.task_log tl
            JOIN manager.task_status st ON st.s_id = tl.status_id
            WHERE st.system_name = 'cancel'
              AND EXISTS (
                  SELECT 1 FROM manager.command_log cl
                  JOIN manager.task_status cst ON cst.s_id = cl.status_id
                  WHERE cl.task_log_id = tl.s_id
                    AND cst.system_name IN ('set', 'progress')
              )
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Progress logs with a `set` child and no errored child; candidates for
    /// sequential sibling advancement under them.
    pub async fn list_with_advancing_children(pool: &PgPool) -> Result<Vec<TaskLog>> {
        let rows = sqlx::query_as::<_, TaskLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.task_log tl
            JOIN manager.task_status st ON st.s_id = tl.status_id
            WHERE st.system_name = 'progress'
              AND EXISTS (
                  SELECT 1 FROM manager.command_log cl
                  JOIN manager.task_status cst ON cst.s_id = cl.status_id
                  WHERE cl.task_log_id = tl.s_id AND cst.system_name = 'set'
              )
              AND NOT EXISTS (
                  SELECT 1 FROM manager.command_log cl
                  JOIN manager.task_status cst ON cst.s_id = cl.status_id
                  WHERE cl.task_log_id = tl.s_id AND cst.system_name = 'error'
              )
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Progress logs whose action defines commands (aggregation candidates).
    pub async fn list_aggregatable(pool: &PgPool) -> Result<Vec<TaskLog>> {
        let rows = sqlx::query_as::<_, TaskLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.task_log tl
            JOIN manager.task_status st ON st.s_id = tl.status_id
            WHERE st.system_name = 'progress'
              AND EXISTS (
                  SELECT 1 FROM manager.command c WHERE c.action_id = tl.action_id
              )
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Status-guarded transition; a no-op when the row moved on concurrently.
    pub async fn transition(
        pool: &PgPool,
        id: Uuid,
        expected_status_id: Uuid,
        new_status_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE manager.task_log SET status_id = $3 WHERE s_id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(expected_status_id)
        .bind(new_status_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel every `set` child of the given MainTaskLogs in one statement.
    pub async fn cancel_pending_of(
        pool: &PgPool,
        main_task_log_ids: &[Uuid],
        set_status_id: Uuid,
        cancel_status_id: Uuid,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE manager.task_log
            SET status_id = $3
            WHERE main_task_log_id = ANY($1) AND status_id = $2
            "#,
        )
        .bind(main_task_log_ids)
        .bind(set_status_id)
        .bind(cancel_status_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

impl ObjectToTaskLog {
    pub async fn list_for_task_log(pool: &PgPool, task_log_id: Uuid) -> Result<Vec<ObjectToTaskLog>> {
        let rows = sqlx::query_as::<_, ObjectToTaskLog>(
            r#"
            SELECT s_id, task_log_id, object_id
            FROM manager.object_to_task_log
            WHERE task_log_id = $1
            "#,
        )
        .bind(task_log_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
