//! Protocol Message between two Modules.
//!
//! Maps to `manager.message`. `msg_type` and the delivery `status` are
//! string-valued in the store; delivery status is monotonic
//! (sent → received → processed) and unsent rows carry NULL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{Result, TaskerError};

/// Protocol message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Connect,
    Task,
    Info,
    Success,
    Error,
    Warning,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Connect => "connect",
            MsgType::Task => "task",
            MsgType::Info => "info",
            MsgType::Success => "success",
            MsgType::Error => "error",
            MsgType::Warning => "warning",
        }
    }

    pub fn parse(value: &str) -> Option<MsgType> {
        match value {
            "connect" => Some(MsgType::Connect),
            "task" => Some(MsgType::Task),
            "info" => Some(MsgType::Info),
            "success" => Some(MsgType::Success),
            "error" => Some(MsgType::Error),
            "warning" => Some(MsgType::Warning),
            _ => None,
        }
    }
}

/// Delivery status; strictly advances, never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Sent,
    Received,
    Processed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Sent => "sent",
            SendStatus::Received => "received",
            SendStatus::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub s_id: Uuid,
    pub task_log_id: Option<Uuid>,
    pub command_log_id: Option<Uuid>,
    pub parent_msg_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub data: Option<Value>,
    pub msg_type: String,
    pub status: Option<String>,
    pub date_created: DateTime<Utc>,
}

/// Typed view of the JSON `data` column.
///
/// Required `task_id` echoes the Message id for correlation. `connect`
/// carries nothing else; `task` carries either `method` (module-originated)
/// or `method_list` + `object_list` (dispatch-expansion input).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub task_id: Uuid,
    pub msg_type: MsgType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MessagePayload {
    pub fn connect(task_id: Uuid) -> Self {
        Self {
            task_id,
            msg_type: MsgType::Connect,
            method: None,
            method_list: None,
            object_list: None,
            message: None,
        }
    }

    pub fn task(task_id: Uuid, method: &str) -> Self {
        Self {
            task_id,
            msg_type: MsgType::Task,
            method: Some(method.to_string()),
            method_list: None,
            object_list: None,
            message: None,
        }
    }

    pub fn error(task_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            task_id,
            msg_type: MsgType::Error,
            method: None,
            method_list: None,
            object_list: None,
            message: Some(message.into()),
        }
    }
}

/// Fields for inserting a new Message row.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub msg_type: MsgType,
    pub status: Option<SendStatus>,
    pub task_log_id: Option<Uuid>,
    pub command_log_id: Option<Uuid>,
    pub parent_msg_id: Option<Uuid>,
    pub data: Option<Value>,
}

const COLUMNS: &str = "msg.s_id, msg.task_log_id, msg.command_log_id, msg.parent_msg_id, \
                       msg.sender_id, msg.recipient_id, msg.data, msg.msg_type, msg.status, \
                       msg.date_created";

impl Message {
    /// Parse the typed payload; missing or malformed data is a validation
    /// error to be answered with an `error` reply.
    pub fn payload(&self) -> Result<MessagePayload> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| TaskerError::Validation("message carries no payload".to_string()))?;
        let payload: MessagePayload = serde_json::from_value(data.clone())?;
        Ok(payload)
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::parse(&self.msg_type)
    }

    /// Insert with a caller-chosen id so the payload's `task_id` can echo it.
    pub async fn create_with_id(pool: &PgPool, id: Uuid, new: &NewMessage) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO manager.message
                (s_id, task_log_id, command_log_id, parent_msg_id, sender_id, recipient_id,
                 data, msg_type, status, date_created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            "#,
        )
        .bind(id)
        .bind(new.task_log_id)
        .bind(new.command_log_id)
        .bind(new.parent_msg_id)
        .bind(new.sender_id)
        .bind(new.recipient_id)
        .bind(&new.data)
        .bind(new.msg_type.as_str())
        .bind(new.status.map(|s| s.as_str()))
        .execute(pool)
        .await?;
        Ok(id)
    }

    pub async fn create(pool: &PgPool, new: &NewMessage) -> Result<Uuid> {
        Self::create_with_id(pool, Uuid::new_v4(), new).await
    }

    /// Monotonic delivery-status advance. Guarded so replays cannot regress
    /// the status.
    pub async fn advance_status(pool: &PgPool, id: Uuid, to: SendStatus) -> Result<bool> {
        let result = match to {
            SendStatus::Sent => {
                sqlx::query(
                    "UPDATE manager.message SET status = 'sent' WHERE s_id = $1 AND status IS NULL",
                )
                .bind(id)
                .execute(pool)
                .await?
            }
            SendStatus::Received => {
                sqlx::query(
                    "UPDATE manager.message SET status = 'received' WHERE s_id = $1 AND status = 'sent'",
                )
                .bind(id)
                .execute(pool)
                .await?
            }
            SendStatus::Processed => {
                sqlx::query(
                    "UPDATE manager.message SET status = 'processed' WHERE s_id = $1 AND status IN ('sent', 'received')",
                )
                .bind(id)
                .execute(pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    /// Unsent outgoing messages: any unsent `task` plus this module's own
    /// unsent `connect` probes.
    pub async fn list_unsent(pool: &PgPool, own_module_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.message msg
            WHERE msg.status IS NULL
              AND (msg.msg_type = 'task'
                   OR (msg.msg_type = 'connect' AND msg.sender_id = $1))
            "#
        ))
        .bind(own_module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Sent `task` messages addressed to this module (expansion input).
    pub async fn list_inbound_tasks(pool: &PgPool, own_module_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.message msg
            WHERE msg.msg_type = 'task' AND msg.status = 'sent' AND msg.recipient_id = $1
            "#
        ))
        .bind(own_module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Sent success/error replies for a CommandLog still in `progress`.
    pub async fn list_command_log_finalizers(
        pool: &PgPool,
        own_module_id: Uuid,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.message msg
            JOIN manager.command_log cl ON cl.s_id = msg.command_log_id
            JOIN manager.task_status st ON st.s_id = cl.status_id
            WHERE msg.msg_type IN ('success', 'error')
              AND msg.status = 'sent'
              AND msg.recipient_id = $1
              AND st.system_name = 'progress'
            "#
        ))
        .bind(own_module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Sent success/error replies for a TaskLog still in `progress`, with no
    /// CommandLog attached (direct action-level replies).
    pub async fn list_task_log_finalizers(
        pool: &PgPool,
        own_module_id: Uuid,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.message msg
            JOIN manager.task_log tl ON tl.s_id = msg.task_log_id
            JOIN manager.task_status st ON st.s_id = tl.status_id
            WHERE msg.msg_type IN ('success', 'error')
              AND msg.status = 'sent'
              AND msg.recipient_id = $1
              AND msg.command_log_id IS NULL
              AND st.system_name = 'progress'
            "#
        ))
        .bind(own_module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Sent info/warning notices addressed to this module.
    pub async fn list_notices(pool: &PgPool, own_module_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.message msg
            WHERE msg.msg_type IN ('info', 'warning')
              AND msg.status = 'sent'
              AND msg.recipient_id = $1
            "#
        ))
        .bind(own_module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Sent connect replies addressed to this module.
    pub async fn list_connect_replies(pool: &PgPool, own_module_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {COLUMNS} FROM manager.message msg
            WHERE msg.msg_type = 'connect'
              AND msg.status = 'sent'
              AND msg.recipient_id = $1
            "#
        ))
        .bind(own_module_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Latest success and error reply times for a (task_log, command_log)
    /// dispatch pair; drives the dispatch dedup policy.
    pub async fn latest_reply_times(
        pool: &PgPool,
        task_log_id: Uuid,
        command_log_id: Option<Uuid>,
    ) -> Result<ReplyTimes> {
        let row: (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = match command_log_id {
            Some(command_log_id) => {
                sqlx::query_as(
                    r#"
                    SELECT
                        MAX(date_created) FILTER (WHERE msg_type = 'success'),
                        MAX(date_created) FILTER (WHERE msg_type = 'error')
                    FROM manager.message
                    WHERE task_log_id = $1 AND command_log_id = $2
                    "#,
                )
                .bind(task_log_id)
                .bind(command_log_id)
                .fetch_one(pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT
                        MAX(date_created) FILTER (WHERE msg_type = 'success'),
                        MAX(date_created) FILTER (WHERE msg_type = 'error')
                    FROM manager.message
                    WHERE task_log_id = $1 AND command_log_id IS NULL
                    "#,
                )
                .bind(task_log_id)
                .fetch_one(pool)
                .await?
            }
        };
        Ok(ReplyTimes {
            last_success: row.0,
            last_error: row.1,
        })
    }

    /// Does an unanswered connect probe to the module exist (no reply
    /// referencing it as parent)?
    pub async fn has_unanswered_probe(
        pool: &PgPool,
        own_module_id: Uuid,
        module_id: Uuid,
    ) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM manager.message probe
                WHERE probe.sender_id = $1 AND probe.recipient_id = $2
                  AND probe.msg_type = 'connect'
                  AND NOT EXISTS (
                      SELECT 1 FROM manager.message reply
                      WHERE reply.parent_msg_id = probe.s_id
                  )
            )
            "#,
        )
        .bind(own_module_id)
        .bind(module_id)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    /// Time of the latest connect reply from the module, when any.
    pub async fn last_connect_reply_at(
        pool: &PgPool,
        own_module_id: Uuid,
        module_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        let (at,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MAX(date_created)
            FROM manager.message
            WHERE sender_id = $2 AND recipient_id = $1 AND msg_type = 'connect'
            "#,
        )
        .bind(own_module_id)
        .bind(module_id)
        .fetch_one(pool)
        .await?;
        Ok(at)
    }
}

/// Dedup input for `dispatch_message`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplyTimes {
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let id = Uuid::new_v4();
        let payload = MessagePayload::task(id, "sync_state");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["task_id"], id.to_string());
        assert_eq!(json["msg_type"], "task");
        assert_eq!(json["method"], "sync_state");
        assert!(json.get("method_list").is_none());

        let parsed: MessagePayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_connect_payload_is_bare() {
        let payload = MessagePayload::connect(Uuid::new_v4());
        let json = serde_json::to_value(&payload).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 2); // task_id + msg_type only
    }

    #[test]
    fn test_expansion_payload_parses() {
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "task_id": id,
            "msg_type": "task",
            "method_list": ["m1", "m2"],
            "object_list": ["11111111-1111-1111-1111-111111111111"],
        });
        let payload: MessagePayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.msg_type, MsgType::Task);
        assert_eq!(payload.method_list.as_deref(), Some(&["m1".to_string(), "m2".to_string()][..]));
        assert_eq!(payload.object_list.unwrap().len(), 1);
    }

    #[test]
    fn test_missing_msg_type_is_rejected() {
        let json = serde_json::json!({ "task_id": Uuid::new_v4() });
        let result: std::result::Result<MessagePayload, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_msg_type_round_trip() {
        for t in [
            MsgType::Connect,
            MsgType::Task,
            MsgType::Info,
            MsgType::Success,
            MsgType::Error,
            MsgType::Warning,
        ] {
            assert_eq!(MsgType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MsgType::parse("bogus"), None);
    }
}
