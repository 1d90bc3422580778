//! Change-feed listener over PostgreSQL LISTEN/NOTIFY.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::error::Result;

/// One turn of the listener loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A NOTIFY arrived on one of the subscribed channels.
    Notification { channel: String, payload: String },
    /// The poll window elapsed without traffic.
    Timeout,
    /// Shutdown was requested.
    Shutdown,
}

/// Statistics about the listener connection.
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub connected: bool,
    pub events_received: u64,
    pub timeouts: u64,
    pub connection_errors: u64,
    pub last_event_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
}

/// LISTEN/NOTIFY subscriber with timeout-based polling.
///
/// `next_event` never returns a transport error to the caller: connection
/// failures are absorbed by reconnecting with backoff and re-issuing LISTEN
/// for every subscribed channel.
pub struct ChangeFeedListener {
    pool: PgPool,
    config: ListenerConfig,
    channels: Vec<String>,
    listener: Option<PgListener>,
    shutdown: Arc<Notify>,
    stats: Arc<RwLock<ListenerStats>>,
}

impl ChangeFeedListener {
    pub fn new(pool: PgPool, config: ListenerConfig, channels: Vec<String>) -> Self {
        Self {
            pool,
            config,
            channels,
            listener: None,
            shutdown: Arc::new(Notify::new()),
            stats: Arc::new(RwLock::new(ListenerStats::default())),
        }
    }

    /// Handle used to request shutdown from another task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// Connect and LISTEN on every configured channel.
    pub async fn connect(&mut self) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        for channel in &self.channels {
            listener.listen(channel).await?;
            debug!(channel = %channel, "listening on channel");
        }
        self.listener = Some(listener);
        self.stats.write().connected = true;
        info!(channels = self.channels.len(), "change-feed listener connected");
        Ok(())
    }

    /// Wait for the next event, poll timeout, or shutdown request.
    pub async fn next_event(&mut self) -> Result<FeedEvent> {
        let shutdown = Arc::clone(&self.shutdown);
        loop {
            if self.listener.is_none() && !self.reconnect_with_backoff().await? {
                info!("change-feed listener shutting down");
                return Ok(FeedEvent::Shutdown);
            }
            let poll_timeout = Duration::from_secs(self.config.poll_timeout_seconds);
            let Some(listener) = self.listener.as_mut() else {
                continue;
            };

            let received = tokio::select! {
                _ = shutdown.notified() => {
                    info!("change-feed listener shutting down");
                    return Ok(FeedEvent::Shutdown);
                }
                received = tokio::time::timeout(poll_timeout, listener.recv()) => received,
            };

            match received {
                Err(_elapsed) => {
                    self.stats.write().timeouts += 1;
                    return Ok(FeedEvent::Timeout);
                }
                Ok(Ok(notification)) => {
                    let mut stats = self.stats.write();
                    stats.events_received += 1;
                    stats.last_event_at = Some(SystemTime::now());
                    return Ok(FeedEvent::Notification {
                        channel: notification.channel().to_string(),
                        payload: notification.payload().to_string(),
                    });
                }
                Ok(Err(e)) => {
                    {
                        let mut stats = self.stats.write();
                        stats.connection_errors += 1;
                        stats.last_error_at = Some(SystemTime::now());
                        stats.connected = false;
                    }
                    warn!(error = %e, "change-feed connection lost, reconnecting");
                    self.listener = None;
                }
            }
        }
    }

    /// Reconnect, retrying with a fixed backoff. Returns false when a
    /// shutdown request interrupted the wait.
    async fn reconnect_with_backoff(&mut self) -> Result<bool> {
        let shutdown = Arc::clone(&self.shutdown);
        let backoff = Duration::from_secs(self.config.reconnect_backoff_seconds);
        loop {
            tokio::select! {
                _ = shutdown.notified() => return Ok(false),
                _ = tokio::time::sleep(backoff) => {}
            }
            match self.connect().await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    error!(error = %e, backoff_seconds = backoff.as_secs(), "reconnect failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_start_disconnected() {
        let stats = ListenerStats::default();
        assert!(!stats.connected);
        assert_eq!(stats.events_received, 0);
        assert_eq!(stats.timeouts, 0);
    }

    #[test]
    fn test_feed_event_equality() {
        let a = FeedEvent::Notification {
            channel: "task_log".to_string(),
            payload: "{}".to_string(),
        };
        assert_eq!(a.clone(), a);
        assert_ne!(a, FeedEvent::Timeout);
        assert_ne!(FeedEvent::Timeout, FeedEvent::Shutdown);
    }
}
