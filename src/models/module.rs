//! Module represents an independent functional service endpoint.
//! Maps to `manager.module`.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{Result, TaskerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Module {
    pub s_id: Uuid,
    pub name: Option<String>,
    pub system_name: String,
    /// Notification channel this module's own runtime listens on.
    pub channel_name: String,
    /// Health flag, flipped by the orchestrator on connect/heartbeat events.
    pub status: bool,
}

impl Module {
    /// Resolve a module by system name. Missing or ambiguous rows are fatal
    /// at startup, so both cases surface as distinct errors.
    pub async fn find_by_system_name(pool: &PgPool, system_name: &str) -> Result<Module> {
        let rows = sqlx::query_as::<_, Module>(
            r#"
            SELECT s_id, name, system_name, channel_name, status
            FROM manager.module
            WHERE system_name = $1
            "#,
        )
        .bind(system_name)
        .fetch_all(pool)
        .await?;

        match rows.len() {
            0 => Err(TaskerError::not_found(
                "Module",
                format!("no module with system name '{system_name}'"),
            )),
            1 => Ok(rows.into_iter().next().unwrap()),
            n => Err(TaskerError::Configuration(format!(
                "{n} modules share the system name '{system_name}'"
            ))),
        }
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Module>> {
        let row = sqlx::query_as::<_, Module>(
            r#"
            SELECT s_id, name, system_name, channel_name, status
            FROM manager.module
            WHERE s_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// All modules except the given one (the heartbeat probes everyone else).
    pub async fn list_others(pool: &PgPool, own_id: Uuid) -> Result<Vec<Module>> {
        let rows = sqlx::query_as::<_, Module>(
            r#"
            SELECT s_id, name, system_name, channel_name, status
            FROM manager.module
            WHERE s_id != $1
            "#,
        )
        .bind(own_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Flip the health flag.
    pub async fn set_health(pool: &PgPool, id: Uuid, healthy: bool) -> Result<()> {
        sqlx::query("UPDATE manager.module SET status = $2 WHERE s_id = $1")
            .bind(id)
            .bind(healthy)
            .execute(pool)
            .await?;
        Ok(())
    }
}
