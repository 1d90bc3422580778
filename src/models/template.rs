//! Static workflow templates: BaseTask → ordered Tasks (via TaskSequence) →
//! ordered Actions bound to Methods. Edited externally, read-only here.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::Result;

/// Maps to `manager.base_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BaseTask {
    pub s_id: Uuid,
    pub name: Option<String>,
}

/// Maps to `manager.task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub s_id: Uuid,
    pub name: Option<String>,
}

/// Ordering of Tasks inside a BaseTask. Maps to `manager.task_sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskSequence {
    pub s_id: Uuid,
    pub base_task_id: Uuid,
    pub task_id: Uuid,
    pub number: i32,
}

/// An ordered step of a Task, bound to a Method. Maps to `manager.action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Action {
    pub s_id: Uuid,
    pub task_id: Uuid,
    pub method_id: Uuid,
    pub name: Option<String>,
    pub number: i32,
}

impl TaskSequence {
    pub async fn list_for_base_task(pool: &PgPool, base_task_id: Uuid) -> Result<Vec<TaskSequence>> {
        let rows = sqlx::query_as::<_, TaskSequence>(
            r#"
            SELECT s_id, base_task_id, task_id, number
            FROM manager.task_sequence
            WHERE base_task_id = $1
            ORDER BY number
            "#,
        )
        .bind(base_task_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

impl Action {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Action>> {
        let row = sqlx::query_as::<_, Action>(
            r#"
            SELECT s_id, task_id, method_id, name, number
            FROM manager.action
            WHERE s_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Action>> {
        let rows = sqlx::query_as::<_, Action>(
            r#"
            SELECT s_id, task_id, method_id, name, number
            FROM manager.action
            WHERE task_id = $1
            ORDER BY number
            "#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// All actions of a base task in execution order: TaskSequence.number
    /// first, Action.number within each task.
    pub async fn list_for_base_task_ordered(
        pool: &PgPool,
        base_task_id: Uuid,
    ) -> Result<Vec<Action>> {
        let rows = sqlx::query_as::<_, Action>(
            r#"
            SELECT a.s_id, a.task_id, a.method_id, a.name, a.number
            FROM manager.action a
            JOIN manager.task_sequence ts ON ts.task_id = a.task_id
            WHERE ts.base_task_id = $1
            ORDER BY ts.number, a.number
            "#,
        )
        .bind(base_task_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
