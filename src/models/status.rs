//! Task execution status lookup.
//!
//! Statuses live in the `manager.task_status` reference table and are joined
//! by `system_name` everywhere a predicate guards a transition. The
//! [`StatusCache`] resolves the five well-known statuses to their row ids once
//! at startup so handlers never re-query the lookup table.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{Result, TaskerError};

/// The five task execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Set,
    Progress,
    Finish,
    Error,
    Cancel,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Set,
        Status::Progress,
        Status::Finish,
        Status::Error,
        Status::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Set => "set",
            Status::Progress => "progress",
            Status::Finish => "finish",
            Status::Error => "error",
            Status::Cancel => "cancel",
        }
    }

    pub fn parse(value: &str) -> Option<Status> {
        match value {
            "set" => Some(Status::Set),
            "progress" => Some(Status::Progress),
            "finish" => Some(Status::Finish),
            "error" => Some(Status::Error),
            "cancel" => Some(Status::Cancel),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Finish | Status::Error | Status::Cancel)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of the `manager.task_status` lookup table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskStatus {
    pub s_id: Uuid,
    pub name: Option<String>,
    pub system_name: String,
}

impl TaskStatus {
    pub async fn list_all(pool: &PgPool) -> Result<Vec<TaskStatus>> {
        let rows = sqlx::query_as::<_, TaskStatus>(
            "SELECT s_id, name, system_name FROM manager.task_status",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Startup-resolved mapping from [`Status`] to lookup row id.
#[derive(Debug, Clone)]
pub struct StatusCache {
    ids: HashMap<Status, Uuid>,
}

impl StatusCache {
    /// Load the lookup table; every well-known status must be present.
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let rows = TaskStatus::list_all(pool).await?;
        let mut ids = HashMap::new();
        for row in rows {
            if let Some(status) = Status::parse(&row.system_name) {
                ids.insert(status, row.s_id);
            }
        }
        for status in Status::ALL {
            if !ids.contains_key(&status) {
                return Err(TaskerError::Configuration(format!(
                    "task_status lookup is missing the '{status}' row"
                )));
            }
        }
        Ok(Self { ids })
    }

    pub fn id(&self, status: Status) -> Uuid {
        // load() guarantees every status is present
        self.ids[&status]
    }

    pub fn status_of(&self, id: Uuid) -> Option<Status> {
        self.ids
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| *k)
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let ids = Status::ALL
            .iter()
            .map(|s| (*s, Uuid::new_v4()))
            .collect();
        Self { ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for status in Status::ALL {
            assert_eq!(Status::parse(status.as_str()), Some(status));
        }
        assert_eq!(Status::parse("unknown"), None);
    }

    #[test]
    fn test_terminal() {
        assert!(!Status::Set.is_terminal());
        assert!(!Status::Progress.is_terminal());
        assert!(Status::Finish.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(Status::Cancel.is_terminal());
    }

    #[test]
    fn test_cache_lookup() {
        let cache = StatusCache::for_tests();
        let id = cache.id(Status::Progress);
        assert_eq!(cache.status_of(id), Some(Status::Progress));
    }
}
