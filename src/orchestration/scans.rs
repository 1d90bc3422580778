//! Debounced scan routines, one per watched table.
//!
//! A scan queries the candidate rows for each transition and hands the batch
//! to the worker pool; the handlers re-validate everything against the store,
//! so running a scan twice on the same snapshot is harmless.

use std::sync::Arc;

use crate::error::Result;
use crate::execution::{Job, WorkerPool};
use crate::models::{ChildScope, CommandLog, MainTaskLog, Message, TaskLog};
use crate::orchestration::handlers::{self, ManagerContext};
use crate::orchestration::heartbeat;

/// MainTaskLog changes: freshly started logs need their TaskLog sequence,
/// freshly cancelled ones need their pending children cancelled.
pub async fn scan_main_task_log(ctx: &Arc<ManagerContext>, workers: &WorkerPool) -> Result<()> {
    let awaiting = MainTaskLog::list_awaiting_generation(&ctx.pool).await?;
    if !awaiting.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("generate_task_logs", async move {
            for main_task_log in &awaiting {
                handlers::generate_task_logs(&ctx, main_task_log).await?;
            }
            Ok(())
        }))?;
    }

    let cancelling = MainTaskLog::list_awaiting_cancellation(&ctx.pool).await?;
    if !cancelling.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("cancel_task_logs", async move {
            handlers::cancel_task_logs(&ctx, &cancelling).await
        }))?;
    }
    Ok(())
}

/// TaskLog changes: dispatch progress logs, cascade cancellations into their
/// expansions, and re-aggregate the parents.
pub async fn scan_task_log(ctx: &Arc<ManagerContext>, workers: &WorkerPool) -> Result<()> {
    let dispatchable = TaskLog::list_dispatchable(&ctx.pool).await?;
    if !dispatchable.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("dispatch_task_logs", async move {
            for task_log in &dispatchable {
                handlers::dispatch_task_log(&ctx, task_log).await?;
            }
            Ok(())
        }))?;
    }

    let cancelling = TaskLog::list_awaiting_cancellation(&ctx.pool).await?;
    if !cancelling.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("cancel_task_log_expansions", async move {
            for task_log in &cancelling {
                handlers::cancel_command_logs(&ctx, ChildScope::OfTaskLog(task_log.s_id)).await?;
            }
            Ok(())
        }))?;
    }

    let in_progress = MainTaskLog::list_in_progress(&ctx.pool).await?;
    if !in_progress.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("aggregate_main_task_logs", async move {
            for main_task_log in &in_progress {
                handlers::aggregate_main_task_log(&ctx, main_task_log).await?;
            }
            Ok(())
        }))?;
    }
    Ok(())
}

/// CommandLog changes: dispatch, cascade cancellations, advance sequential
/// siblings, and aggregate both CommandLog and TaskLog parents.
pub async fn scan_command_log(ctx: &Arc<ManagerContext>, workers: &WorkerPool) -> Result<()> {
    let dispatchable = CommandLog::list_in_progress(&ctx.pool).await?;
    if !dispatchable.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("dispatch_command_logs", async move {
            for command_log in &dispatchable {
                handlers::dispatch_command_log(&ctx, command_log).await?;
            }
            Ok(())
        }))?;
    }

    let cancelling = CommandLog::list_awaiting_cancellation(&ctx.pool).await?;
    if !cancelling.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("cancel_command_log_subtrees", async move {
            for command_log in &cancelling {
                handlers::cancel_command_logs(&ctx, ChildScope::OfCommandLog(command_log.s_id))
                    .await?;
            }
            Ok(())
        }))?;
    }

    let advancing_commands = CommandLog::list_with_advancing_children(&ctx.pool).await?;
    if !advancing_commands.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("advance_command_log_siblings", async move {
            for command_log in &advancing_commands {
                handlers::advance_sequential_siblings(
                    &ctx,
                    ChildScope::OfCommandLog(command_log.s_id),
                )
                .await?;
            }
            Ok(())
        }))?;
    }

    let advancing_tasks = TaskLog::list_with_advancing_children(&ctx.pool).await?;
    if !advancing_tasks.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("advance_task_log_siblings", async move {
            for task_log in &advancing_tasks {
                handlers::advance_sequential_siblings(&ctx, ChildScope::OfTaskLog(task_log.s_id))
                    .await?;
            }
            Ok(())
        }))?;
    }

    let aggregatable_commands = CommandLog::list_aggregatable(&ctx.pool).await?;
    if !aggregatable_commands.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("aggregate_command_logs", async move {
            for command_log in &aggregatable_commands {
                handlers::aggregate_command_log(&ctx, command_log).await?;
            }
            Ok(())
        }))?;
    }

    let aggregatable_tasks = TaskLog::list_aggregatable(&ctx.pool).await?;
    if !aggregatable_tasks.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("aggregate_task_logs", async move {
            for task_log in &aggregatable_tasks {
                handlers::aggregate_task_log(&ctx, task_log).await?;
            }
            Ok(())
        }))?;
    }
    Ok(())
}

/// Message changes: publish the unsent, then run every manager-addressed
/// message through the acknowledge-handle-reply pipeline.
pub async fn scan_message(ctx: &Arc<ManagerContext>, workers: &WorkerPool) -> Result<()> {
    let own_id = ctx.module.s_id;

    let unsent = Message::list_unsent(&ctx.pool, own_id).await?;
    if !unsent.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("publish_unsent_messages", async move {
            handlers::publish_unsent(&ctx, &unsent).await
        }))?;
    }

    let inbound_tasks = Message::list_inbound_tasks(&ctx.pool, own_id).await?;
    if !inbound_tasks.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("expand_command_logs", async move {
            for message in &inbound_tasks {
                handlers::process_inbound(&ctx, message, || {
                    handlers::expand_to_command_logs(&ctx, message)
                })
                .await?;
            }
            Ok(())
        }))?;
    }

    let command_replies = Message::list_command_log_finalizers(&ctx.pool, own_id).await?;
    if !command_replies.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("finalize_command_logs", async move {
            for message in &command_replies {
                handlers::process_inbound(&ctx, message, || {
                    handlers::finalize_from_reply(&ctx, message)
                })
                .await?;
            }
            Ok(())
        }))?;
    }

    let task_replies = Message::list_task_log_finalizers(&ctx.pool, own_id).await?;
    if !task_replies.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("finalize_task_logs", async move {
            for message in &task_replies {
                handlers::process_inbound(&ctx, message, || {
                    handlers::finalize_from_reply(&ctx, message)
                })
                .await?;
            }
            Ok(())
        }))?;
    }

    let notices = Message::list_notices(&ctx.pool, own_id).await?;
    if !notices.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("acknowledge_notices", async move {
            for message in &notices {
                handlers::process_inbound(&ctx, message, || async {
                    Ok(handlers::Reply::None)
                })
                .await?;
            }
            Ok(())
        }))?;
    }

    let connect_replies = Message::list_connect_replies(&ctx.pool, own_id).await?;
    if !connect_replies.is_empty() {
        let ctx = Arc::clone(ctx);
        workers.submit(Job::new("recover_modules", async move {
            for message in &connect_replies {
                handlers::process_inbound(&ctx, message, || handlers::recover_module(&ctx, message))
                    .await?;
            }
            Ok(())
        }))?;
    }
    Ok(())
}

/// The periodic heartbeat pass, queued like any other scan job.
pub fn queue_heartbeat(ctx: &Arc<ManagerContext>, workers: &WorkerPool) -> Result<()> {
    let ctx = Arc::clone(ctx);
    workers.submit(Job::new("heartbeat", async move {
        heartbeat::run_heartbeat(&ctx).await
    }))
}
