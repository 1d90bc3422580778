//! Data models for the `manager` schema.
//!
//! One module per aggregate, each pairing a `FromRow` struct with the
//! queries the scan and transition routines need. All state changes go
//! through status-guarded UPDATEs so replayed work is a no-op.

pub mod command;
pub mod command_log;
pub mod main_task_log;
pub mod message;
pub mod method;
pub mod module;
pub mod status;
pub mod task_log;
pub mod template;

pub use command::Command;
pub use command_log::{ChildScope, CommandLog, ObjectToCommandLog};
pub use main_task_log::MainTaskLog;
pub use message::{Message, MessagePayload, MsgType, NewMessage, ReplyTimes, SendStatus};
pub use method::Method;
pub use module::Module;
pub use status::{Status, StatusCache, TaskStatus};
pub use task_log::{ObjectToTaskLog, TaskLog};
pub use template::{Action, BaseTask, Task, TaskSequence};
