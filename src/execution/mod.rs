//! Background execution: the worker pool scan jobs run on.

pub mod worker_pool;

pub use worker_pool::{Job, PoolStats, WorkerPool};
