//! # Task Manager
//!
//! Orchestrator for distributed task execution over a shared PostgreSQL
//! store. Work templates (base task → tasks → actions → command trees) are
//! instantiated into execution logs whose status changes, observed through
//! LISTEN/NOTIFY, drive message dispatch to the functional modules and
//! bottom-up result aggregation.
//!
//! Layers, bottom-up:
//! - [`models`]: the `manager` schema entities and their status-guarded
//!   queries
//! - [`notify`]: the change-feed listener and per-channel debouncing
//! - [`execution`]: the worker pool the scan jobs run on
//! - [`runtime`]: the generic notification-driven service loop
//! - [`orchestration`]: the task manager itself

pub mod config;
pub mod database;
pub mod error;
pub mod execution;
pub mod logging;
pub mod models;
pub mod notify;
pub mod orchestration;
pub mod runtime;

pub use config::ManagerConfig;
pub use database::DatabaseConnection;
pub use error::{Result, TaskerError};
pub use orchestration::TaskManager;
pub use runtime::{Service, ServiceRuntime};
