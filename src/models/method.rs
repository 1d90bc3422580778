//! Method is a named capability a Module advertises.
//! Maps to `manager.method_module`.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Method {
    pub s_id: Uuid,
    pub module_id: Uuid,
    pub name: Option<String>,
    pub system_name: String,
}

impl Method {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Method>> {
        let row = sqlx::query_as::<_, Method>(
            r#"
            SELECT s_id, module_id, name, system_name
            FROM manager.method_module
            WHERE s_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn list_for_module(pool: &PgPool, module_id: Uuid) -> Result<Vec<Method>> {
        let rows = sqlx::query_as::<_, Method>(
            r#"
            SELECT s_id, module_id, name, system_name
            FROM manager.method_module
            WHERE module_id = $1
            "#,
        )
        .bind(module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
