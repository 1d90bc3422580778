//! Command is a dispatchable sub-step realizing an Action on a Method,
//! organized as a tree with explicit sequencing and parallelism.
//! Maps to `manager.command`.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Command {
    pub s_id: Uuid,
    pub action_id: Uuid,
    pub method_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: Option<String>,
    pub is_parallel: bool,
    pub number: i32,
}

impl Command {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Command>> {
        let row = sqlx::query_as::<_, Command>(
            r#"
            SELECT s_id, action_id, method_id, parent_id, name, is_parallel, number
            FROM manager.command
            WHERE s_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Resolve a command by method system name, scoped to the sending module
    /// and the originating action (the dispatch-expansion lookup).
    pub async fn resolve(
        pool: &PgPool,
        method_system_name: &str,
        module_id: Uuid,
        action_id: Uuid,
    ) -> Result<Option<Command>> {
        let row = sqlx::query_as::<_, Command>(
            r#"
            SELECT c.s_id, c.action_id, c.method_id, c.parent_id, c.name, c.is_parallel, c.number
            FROM manager.command c
            JOIN manager.method_module m ON m.s_id = c.method_id
            WHERE m.system_name = $1
              AND m.module_id = $2
              AND c.action_id = $3
            "#,
        )
        .bind(method_system_name)
        .bind(module_id)
        .bind(action_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}
