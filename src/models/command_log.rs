//! CommandLog is one execution instance of a Command within a TaskLog; its
//! tree mirrors the Command tree via `parent_id`.
//! Maps to `manager.command_log`; object links map to
//! `manager.object_to_command_log`.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::models::status::Status;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CommandLog {
    pub s_id: Uuid,
    pub task_log_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub command_id: Uuid,
    pub status_id: Uuid,
}

/// Link between a CommandLog and an external business object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ObjectToCommandLog {
    pub s_id: Uuid,
    pub command_log_id: Uuid,
    pub object_id: Uuid,
}

const COLUMNS: &str = "cl.s_id, cl.task_log_id, cl.parent_id, cl.command_id, cl.status_id";

impl CommandLog {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<CommandLog>> {
        let row = sqlx::query_as::<_, CommandLog>(&format!(
            "SELECT {COLUMNS} FROM manager.command_log cl WHERE cl.s_id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn create(
        pool: &PgPool,
        task_log_id: Uuid,
        parent_id: Option<Uuid>,
        command_id: Uuid,
        status_id: Uuid,
    ) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO manager.command_log (s_id, task_log_id, parent_id, command_id, status_id)
            VALUES (gen_random_uuid(), $1, $2, $3, $4)
            RETURNING s_id
            "#,
        )
        .bind(task_log_id)
        .bind(parent_id)
        .bind(command_id)
        .bind(status_id)
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    /// All logs in `progress` (dispatch candidates).
    pub async fn list_in_progress(pool: &PgPool) -> Result<Vec<CommandLog>> {
        let rows = sqlx::query_as::<_, CommandLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.command_log cl
            JOIN manager.task_status st ON st.s_id = cl.status_id
            WHERE st.system_name = 'progress'
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Progress logs bound to the given module's methods that have no
    /// children; re-dispatch candidates after the module reconnects.
    pub async fn list_redispatchable_for_module(
        pool: &PgPool,
        module_id: Uuid,
    ) -> Result<Vec<CommandLog>> {
        let rows = sqlx::query_as::<_, CommandLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.command_log cl
            JOIN manager.task_status st ON st.s_id = cl.status_id
            JOIN manager.command c ON c.s_id = cl.command_id
            JOIN manager.method_module m ON m.s_id = c.method_id
            WHERE st.system_name = 'progress' AND m.module_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM manager.command_log ch WHERE ch.parent_id = cl.s_id
              )
            "#
        ))
        .bind(module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Cancelled logs that still hold live children.
    pub async fn list_awaiting_cancellation(pool: &PgPool) -> Result<Vec<CommandLog>> {
        let rows = sqlx::query_as::<_, CommandLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.command_log cl
            JOIN manager.task_status st ON st.s_id = cl.status_id
            WHERE st.system_name = 'cancel'
              AND EXISTS (
                  SELECT 1 FROM manager.command_log ch
                  JOIN manager.task_status cst ON cst.s_id = ch.status_id
                  WHERE ch.parent_id = cl.s_id
                    AND cst.system_name IN ('set', 'progress')
              )
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Progress parents with a `set` child and no errored child.
    pub async fn list_with_advancing_children(pool: &PgPool) -> Result<Vec<CommandLog>> {
        let rows = sqlx::query_as::<_, CommandLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.command_log cl
            JOIN manager.task_status st ON st.s_id = cl.status_id
            WHERE st.system_name = 'progress'
              AND EXISTS (
                  SELECT 1 FROM manager.command_log ch
                  JOIN manager.task_status cst ON cst.s_id = ch.status_id
                  WHERE ch.parent_id = cl.s_id AND cst.system_name = 'set'
              )
              AND NOT EXISTS (
                  SELECT 1 FROM manager.command_log ch
                  JOIN manager.task_status cst ON cst.s_id = ch.status_id
                  WHERE ch.parent_id = cl.s_id AND cst.system_name = 'error'
              )
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Progress logs whose command template defines children (aggregation
    /// candidates).
    pub async fn list_aggregatable(pool: &PgPool) -> Result<Vec<CommandLog>> {
        let rows = sqlx::query_as::<_, CommandLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.command_log cl
            JOIN manager.task_status st ON st.s_id = cl.status_id
            WHERE st.system_name = 'progress'
              AND EXISTS (
                  SELECT 1 FROM manager.command c WHERE c.parent_id = cl.command_id
              )
            "#
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Children of a CommandLog parent.
    pub async fn children_of(pool: &PgPool, parent_id: Uuid) -> Result<Vec<CommandLog>> {
        let rows = sqlx::query_as::<_, CommandLog>(&format!(
            "SELECT {COLUMNS} FROM manager.command_log cl WHERE cl.parent_id = $1"
        ))
        .bind(parent_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Direct CommandLogs of a TaskLog (the whole expansion, all depths share
    /// the task_log_id; top-level rows have no parent).
    pub async fn list_for_task_log(pool: &PgPool, task_log_id: Uuid) -> Result<Vec<CommandLog>> {
        let rows = sqlx::query_as::<_, CommandLog>(&format!(
            "SELECT {COLUMNS} FROM manager.command_log cl WHERE cl.task_log_id = $1"
        ))
        .bind(task_log_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Statuses of children under the given parent scope.
    pub async fn child_statuses(pool: &PgPool, scope: ChildScope) -> Result<Vec<Status>> {
        let rows: Vec<(String,)> = match scope {
            ChildScope::OfCommandLog(parent_id) => {
                sqlx::query_as(
                    r#"
                    SELECT st.system_name
                    FROM manager.command_log cl
                    JOIN manager.task_status st ON st.s_id = cl.status_id
                    WHERE cl.parent_id = $1
                    "#,
                )
                .bind(parent_id)
                .fetch_all(pool)
                .await?
            }
            ChildScope::OfTaskLog(task_log_id) => {
                sqlx::query_as(
                    r#"
                    SELECT st.system_name
                    FROM manager.command_log cl
                    JOIN manager.task_status st ON st.s_id = cl.status_id
                    WHERE cl.task_log_id = $1
                    "#,
                )
                .bind(task_log_id)
                .fetch_all(pool)
                .await?
            }
        };
        Ok(rows
            .into_iter()
            .filter_map(|(name,)| Status::parse(&name))
            .collect())
    }

    /// Highest Command.number among finished children of the scope.
    pub async fn latest_finished_number(pool: &PgPool, scope: ChildScope) -> Result<Option<i32>> {
        let row: Option<(i32,)> = match scope {
            ChildScope::OfCommandLog(parent_id) => {
                sqlx::query_as(
                    r#"
                    SELECT c.number
                    FROM manager.command_log cl
                    JOIN manager.task_status st ON st.s_id = cl.status_id
                    JOIN manager.command c ON c.s_id = cl.command_id
                    WHERE cl.parent_id = $1 AND st.system_name = 'finish'
                    ORDER BY c.number DESC
                    LIMIT 1
                    "#,
                )
                .bind(parent_id)
                .fetch_optional(pool)
                .await?
            }
            ChildScope::OfTaskLog(task_log_id) => {
                sqlx::query_as(
                    r#"
                    SELECT c.number
                    FROM manager.command_log cl
                    JOIN manager.task_status st ON st.s_id = cl.status_id
                    JOIN manager.command c ON c.s_id = cl.command_id
                    WHERE cl.task_log_id = $1 AND cl.parent_id IS NULL
                      AND st.system_name = 'finish'
                    ORDER BY c.number DESC
                    LIMIT 1
                    "#,
                )
                .bind(task_log_id)
                .fetch_optional(pool)
                .await?
            }
        };
        Ok(row.map(|(n,)| n))
    }

    /// `set` siblings of the scope with the given non-parallel ordinal.
    pub async fn pending_siblings_with_number(
        pool: &PgPool,
        scope: ChildScope,
        number: i32,
    ) -> Result<Vec<CommandLog>> {
        let rows = match scope {
            ChildScope::OfCommandLog(parent_id) => {
                sqlx::query_as::<_, CommandLog>(&format!(
                    r#"
                    SELECT {COLUMNS} FROM manager.command_log cl
                    JOIN manager.task_status st ON st.s_id = cl.status_id
                    JOIN manager.command c ON c.s_id = cl.command_id
                    WHERE cl.parent_id = $1 AND st.system_name = 'set'
                      AND c.is_parallel = FALSE AND c.number = $2
                    "#
                ))
                .bind(parent_id)
                .bind(number)
                .fetch_all(pool)
                .await?
            }
            ChildScope::OfTaskLog(task_log_id) => {
                sqlx::query_as::<_, CommandLog>(&format!(
                    r#"
                    SELECT {COLUMNS} FROM manager.command_log cl
                    JOIN manager.task_status st ON st.s_id = cl.status_id
                    JOIN manager.command c ON c.s_id = cl.command_id
                    WHERE cl.task_log_id = $1 AND cl.parent_id IS NULL
                      AND st.system_name = 'set'
                      AND c.is_parallel = FALSE AND c.number = $2
                    "#
                ))
                .bind(task_log_id)
                .bind(number)
                .fetch_all(pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// `progress` children of the parent that still hold `set` children of
    /// their own (cancellation must recurse into them).
    pub async fn live_branches_of(pool: &PgPool, parent_id: Uuid) -> Result<Vec<CommandLog>> {
        let rows = sqlx::query_as::<_, CommandLog>(&format!(
            r#"
            SELECT DISTINCT {COLUMNS} FROM manager.command_log cl
            JOIN manager.task_status st ON st.s_id = cl.status_id
            WHERE cl.parent_id = $1 AND st.system_name = 'progress'
              AND EXISTS (
                  SELECT 1 FROM manager.command_log ch
                  JOIN manager.task_status cst ON cst.s_id = ch.status_id
                  WHERE ch.parent_id = cl.s_id AND cst.system_name = 'set'
              )
            "#
        ))
        .bind(parent_id)
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
            "UPDATE manager.command_log SET status_id = $3 WHERE s_id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(expected_status_id)
        .bind(new_status_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel every `set` child of the given scope in one statement.
    pub async fn cancel_pending_of(
        pool: &PgPool,
        scope: ChildScope,
        set_status_id: Uuid,
        cancel_status_id: Uuid,
    ) -> Result<u64> {
        let result = match scope {
            ChildScope::OfCommandLog(parent_id) => {
                sqlx::query(
                    r#"
                    UPDATE manager.command_log
                    SET status_id = $3
                    WHERE parent_id = $1 AND status_id = $2
                    "#,
                )
                .bind(parent_id)
                .bind(set_status_id)
                .bind(cancel_status_id)
                .execute(pool)
                .await?
            }
            ChildScope::OfTaskLog(task_log_id) => {
                sqlx::query(
                    r#"
                    UPDATE manager.command_log
                    SET status_id = $3
                    WHERE task_log_id = $1 AND status_id = $2
                    "#,
                )
                .bind(task_log_id)
                .bind(set_status_id)
                .bind(cancel_status_id)
                .execute(pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }
}

/// Parent scope for CommandLog child queries: either a CommandLog subtree or
/// the top level of a TaskLog's expansion.
#[derive(Debug, Clone, Copy)]
pub enum ChildScope {
    OfCommandLog(Uuid),
    OfTaskLog(Uuid),
}

impl ObjectToCommandLog {
    pub async fn create(pool: &PgPool, command_log_id: Uuid, object_id: Uuid) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO manager.object_to_command_log (s_id, command_log_id, object_id)
            VALUES (gen_random_uuid(), $1, $2)
            RETURNING s_id
            "#,
        )
        .bind(command_log_id)
        .bind(object_id)
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    pub async fn list_for_command_log(
        pool: &PgPool,
        command_log_id: Uuid,
    ) -> Result<Vec<ObjectToCommandLog>> {
        let rows = sqlx::query_as::<_, ObjectToCommandLog>(
            r#"
            SELECT s_id, command_log_id, object_id
            FROM manager.object_to_command_log
            WHERE command_log_id = $1
            "#,
        )
        .bind(command_log_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
