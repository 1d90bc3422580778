//! LISTEN/NOTIFY plumbing: the change-feed listener and the per-channel
//! debounce counters that decide when a scan is worth running.

pub mod debounce;
pub mod listener;

pub use debounce::{DebounceParams, NotifyCount};
pub use listener::{ChangeFeedListener, FeedEvent, ListenerStats};

use sqlx::PgPool;

use crate::error::Result;

/// Publish a payload on a channel via `pg_notify`.
pub async fn publish(pool: &PgPool, channel: &str, payload: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}
