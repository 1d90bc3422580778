//! The task-manager orchestrator service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::{Result, TaskerError};
use crate::execution::WorkerPool;
use crate::models::{Module, StatusCache};
use crate::notify::{DebounceParams, NotifyCount};
use crate::orchestration::handlers::ManagerContext;
use crate::orchestration::scans;
use crate::runtime::Service;

/// Debounce thresholds per channel kind. The message channel is the busiest
/// and tolerates a bigger burst before an early flush.
const MESSAGE_DEBOUNCE: DebounceParams = DebounceParams {
    max_count: 100,
    wait_time: Duration::from_secs(10),
};
const LOG_DEBOUNCE: DebounceParams = DebounceParams {
    max_count: 10,
    wait_time: Duration::from_secs(10),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    MainTaskLog,
    TaskLog,
    CommandLog,
    Message,
}

struct ScanEntry {
    kind: ScanKind,
    counter: NotifyCount,
}

/// Channel-to-scan routing with per-channel debounce state, validated once
/// at startup.
struct ScanRegistry {
    entries: HashMap<String, ScanEntry>,
}

impl ScanRegistry {
    fn build(config: &ManagerConfig) -> Result<Self> {
        let mut entries = HashMap::new();
        let routes = [
            (&config.manager.main_task_log_channel, ScanKind::MainTaskLog, LOG_DEBOUNCE),
            (&config.manager.task_log_channel, ScanKind::TaskLog, LOG_DEBOUNCE),
            (&config.manager.command_log_channel, ScanKind::CommandLog, LOG_DEBOUNCE),
            (&config.manager.message_channel, ScanKind::Message, MESSAGE_DEBOUNCE),
        ];
        for (channel, kind, params) in routes {
            if channel.is_empty() {
                return Err(TaskerError::Configuration(format!(
                    "empty channel name for {kind:?} scan"
                )));
            }
            if entries
                .insert(
                    channel.clone(),
                    ScanEntry {
                        kind,
                        counter: NotifyCount::new(params),
                    },
                )
                .is_some()
            {
                return Err(TaskerError::Configuration(format!(
                    "duplicate channel name: {channel}"
                )));
            }
        }
        Ok(Self { entries })
    }
}

/// The orchestrator: routes debounced change-feed notifications into scan
/// jobs and drives the periodic heartbeat.
pub struct TaskManager {
    ctx: Arc<ManagerContext>,
    config: ManagerConfig,
    scans: ScanRegistry,
    workers: Mutex<WorkerPool>,
    last_period_at: parking_lot::Mutex<Option<Instant>>,
}

impl TaskManager {
    /// Resolve the manager's own Module row, load the status lookup, and
    /// build the scan routing. Missing or ambiguous setup data is fatal.
    pub async fn new(config: ManagerConfig, pool: PgPool) -> Result<Self> {
        config.validate()?;
        let statuses = StatusCache::load(&pool).await?;
        let module =
            Module::find_by_system_name(&pool, &config.manager.module_system_name).await?;
        Module::set_health(&pool, module.s_id, true).await?;
        info!(
            module = %module.system_name,
            module_id = %module.s_id,
            "task manager module resolved"
        );

        let scans = ScanRegistry::build(&config)?;
        let workers = Mutex::new(WorkerPool::new(config.worker_pool.clone()));
        let ctx = Arc::new(ManagerContext {
            pool,
            statuses,
            module,
            period: chrono::Duration::minutes(config.manager.period_time_minutes),
        });
        Ok(Self {
            ctx,
            config,
            scans,
            workers,
            last_period_at: parking_lot::Mutex::new(None),
        })
    }

    pub fn context(&self) -> &Arc<ManagerContext> {
        &self.ctx
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.config.manager.period_time_minutes as u64 * 60)
    }

    async fn run_scan(&self, kind: ScanKind) -> Result<()> {
        debug!(scan = ?kind, "running scan");
        let workers = self.workers.lock().await;
        match kind {
            ScanKind::MainTaskLog => scans::scan_main_task_log(&self.ctx, &workers).await,
            ScanKind::TaskLog => scans::scan_task_log(&self.ctx, &workers).await,
            ScanKind::CommandLog => scans::scan_command_log(&self.ctx, &workers).await,
            ScanKind::Message => scans::scan_message(&self.ctx, &workers).await,
        }
    }

    /// Cold-start reconciliation: one pass over everything, since changes
    /// from before the subscription produced no notifications.
    async fn run_all_scans(&self) -> Result<()> {
        for kind in [
            ScanKind::MainTaskLog,
            ScanKind::Message,
            ScanKind::TaskLog,
            ScanKind::CommandLog,
        ] {
            self.run_scan(kind).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for TaskManager {
    fn name(&self) -> &str {
        "task-manager"
    }

    fn channels(&self) -> Vec<String> {
        self.config.channels()
    }

    async fn on_start(&self) -> Result<()> {
        self.workers.lock().await.start();
        Ok(())
    }

    async fn on_notify(&self, channel: &str, _payload: &str) -> Result<()> {
        let Some(entry) = self.scans.entries.get(channel) else {
            warn!(channel = %channel, "notification on unrouted channel");
            return Ok(());
        };
        if entry.counter.record_event() {
            self.run_scan(entry.kind).await?;
        }
        Ok(())
    }

    async fn on_timeout(&self, first_tick: bool) -> Result<()> {
        if first_tick {
            *self.last_period_at.lock() = Some(Instant::now());
            return self.run_all_scans().await;
        }
        for entry in self.scans.entries.values() {
            if entry.counter.flush_if_stale() {
                self.run_scan(entry.kind).await?;
            }
        }
        Ok(())
    }

    fn is_period_due(&self) -> bool {
        self.last_period_at
            .lock()
            .is_some_and(|at| at.elapsed() >= self.period())
    }

    async fn on_periodic(&self) -> Result<()> {
        *self.last_period_at.lock() = Some(Instant::now());
        let workers = self.workers.lock().await;
        scans::queue_heartbeat(&self.ctx, &workers)
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.workers.lock().await.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_registry_routes_all_channels() {
        let config = ManagerConfig::default();
        let registry = ScanRegistry::build(&config).unwrap();
        assert_eq!(registry.entries.len(), 4);
        assert_eq!(
            registry.entries[&config.manager.message_channel].kind,
            ScanKind::Message
        );
        assert_eq!(
            registry.entries[&config.manager.task_log_channel].kind,
            ScanKind::TaskLog
        );
    }

    #[test]
    fn test_scan_registry_rejects_duplicate_channels() {
        let mut config = ManagerConfig::default();
        config.manager.task_log_channel = config.manager.message_channel.clone();
        assert!(matches!(
            ScanRegistry::build(&config),
            Err(TaskerError::Configuration(_))
        ));
    }

    #[test]
    fn test_message_channel_tolerates_bigger_bursts() {
        assert!(MESSAGE_DEBOUNCE.max_count > LOG_DEBOUNCE.max_count);
        assert_eq!(MESSAGE_DEBOUNCE.wait_time, LOG_DEBOUNCE.wait_time);
    }
}
