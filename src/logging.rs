//! Structured logging setup.
//!
//! Environment-aware tracing initialization: `RUST_LOG` wins when set,
//! otherwise the level falls back on `TASK_MANAGER_ENV` (debug everywhere
//! except production).

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber. Safe to call more than once.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_level()));

        // try_init so embedding in tests with their own subscriber keeps working
        let result = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .try_init();

        if result.is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}

fn default_log_level() -> String {
    match std::env::var("TASK_MANAGER_ENV").as_deref() {
        Ok("production") => "info".to_string(),
        _ => "debug".to_string(),
    }
}
