//! The task-manager orchestration layer: scan routing, transition handlers,
//! and the periodic heartbeat, all on top of the generic service runtime.

pub mod handlers;
pub mod heartbeat;
pub mod manager;
pub mod scans;
pub mod transitions;

pub use handlers::{ManagerContext, Reply};
pub use manager::TaskManager;
