//! Transition handlers run by the worker pool.
//!
//! Every handler re-checks state in the store and applies status-guarded
//! updates, so a handler observing a stale snapshot degenerates into a no-op
//! instead of a double transition.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, TaskerError};
use crate::models::{
    Action, ChildScope, Command, CommandLog, MainTaskLog, Message, MessagePayload, Method, Module,
    MsgType, NewMessage, ObjectToCommandLog, ObjectToTaskLog, SendStatus, Status, StatusCache,
    TaskLog,
};
use crate::notify;
use crate::orchestration::transitions;

/// Shared state every handler needs: the pool, the resolved status ids, and
/// this manager's own Module row.
pub struct ManagerContext {
    pub pool: PgPool,
    pub statuses: StatusCache,
    pub module: Module,
    pub period: chrono::Duration,
}

impl ManagerContext {
    fn status_id(&self, status: Status) -> Uuid {
        self.statuses.id(status)
    }
}

/// Outcome of an inbound-message handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Option<Value>),
    Error { message: String },
    None,
}

/// Acknowledge-handle-reply pipeline for one inbound message:
/// sent → received, run the handler, persist any reply, then → processed.
/// A message no longer `sent` was claimed by an earlier job and is skipped.
/// Business failures become `error` replies; infrastructure failures abort
/// the pipeline, leaving the message `received`.
pub async fn process_inbound<F, Fut>(
    ctx: &Arc<ManagerContext>,
    message: &Message,
    handler: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Reply>>,
{
    if !Message::advance_status(&ctx.pool, message.s_id, SendStatus::Received).await? {
        // another job already took this message past `sent`
        debug!(message_id = %message.s_id, "message no longer pending, skipping");
        return Ok(());
    }
    let reply = match handler().await {
        Ok(reply) => reply,
        Err(e) if e.is_business() => {
            warn!(message_id = %message.s_id, error = %e, "message handling failed");
            Reply::Error {
                message: e.to_string(),
            }
        }
        Err(e) => return Err(e),
    };
    persist_reply(ctx, message, reply).await?;
    Message::advance_status(&ctx.pool, message.s_id, SendStatus::Processed).await?;
    Ok(())
}

/// Write a reply row referencing the inbound message and notify the sender's
/// channel right away. Replies do not go through the unsent-message scan.
async fn persist_reply(ctx: &Arc<ManagerContext>, inbound: &Message, reply: Reply) -> Result<()> {
    let (msg_type, message_text, data) = match reply {
        Reply::None => return Ok(()),
        Reply::Success(data) => (MsgType::Success, None, data),
        Reply::Error { message } => (MsgType::Error, Some(message), None),
    };
    let sender = match Module::find_by_id(&ctx.pool, inbound.sender_id).await? {
        Some(module) => module,
        None => {
            warn!(module_id = %inbound.sender_id, "reply recipient module no longer exists");
            return Ok(());
        }
    };

    let reply_id = Uuid::new_v4();
    let payload = MessagePayload {
        task_id: reply_id,
        msg_type,
        method: None,
        method_list: None,
        object_list: None,
        message: message_text,
    };
    let mut payload_value = serde_json::to_value(&payload)?;
    if let Some(extra) = data {
        if let (Some(target), Some(source)) = (payload_value.as_object_mut(), extra.as_object()) {
            for (key, value) in source {
                target.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    Message::create_with_id(
        &ctx.pool,
        reply_id,
        &NewMessage {
            sender_id: ctx.module.s_id,
            recipient_id: inbound.sender_id,
            msg_type,
            status: Some(SendStatus::Sent),
            task_log_id: inbound.task_log_id,
            command_log_id: inbound.command_log_id,
            parent_msg_id: Some(inbound.s_id),
            data: Some(payload_value.clone()),
        },
    )
    .await?;
    notify::publish(&ctx.pool, &sender.channel_name, &payload_value.to_string()).await
}

/// Instantiate the TaskLog sequence of a freshly started MainTaskLog:
/// every Action of the template in (TaskSequence.number, Action.number)
/// order, first row `progress` and recorded as the current task.
pub async fn generate_task_logs(ctx: &Arc<ManagerContext>, main_task_log: &MainTaskLog) -> Result<()> {
    let actions = Action::list_for_base_task_ordered(&ctx.pool, main_task_log.base_task_id).await?;
    if actions.is_empty() {
        warn!(main_task_log_id = %main_task_log.s_id, "template defines no actions");
        return Ok(());
    }

    let set_id = ctx.status_id(Status::Set);
    let progress_id = ctx.status_id(Status::Progress);
    let rows: Vec<(Uuid, Uuid)> = actions
        .iter()
        .enumerate()
        .map(|(i, action)| {
            let status = if i == 0 { progress_id } else { set_id };
            (action.s_id, status)
        })
        .collect();

    let ids = TaskLog::bulk_create(&ctx.pool, main_task_log.s_id, &rows).await?;
    if ids.is_empty() {
        debug!(main_task_log_id = %main_task_log.s_id, "task log sequence already exists");
        return Ok(());
    }
    if let Some(first) = ids.first() {
        MainTaskLog::set_current_task(&ctx.pool, main_task_log.s_id, *first).await?;
    }
    debug!(
        main_task_log_id = %main_task_log.s_id,
        task_logs = ids.len(),
        "task logs generated"
    );
    Ok(())
}

/// Cancel the pending (`set`) TaskLogs of cancelled MainTaskLogs. Progress
/// TaskLogs are left to the command-log cascade.
pub async fn cancel_task_logs(
    ctx: &Arc<ManagerContext>,
    main_task_logs: &[MainTaskLog],
) -> Result<()> {
    let ids: Vec<Uuid> = main_task_logs.iter().map(|m| m.s_id).collect();
    let cancelled = TaskLog::cancel_pending_of(
        &ctx.pool,
        &ids,
        ctx.status_id(Status::Set),
        ctx.status_id(Status::Cancel),
    )
    .await?;
    debug!(main_task_logs = ids.len(), cancelled, "pending task logs cancelled");
    Ok(())
}

/// Cancel the pending CommandLogs under a scope, recursing into progress
/// branches that still hold pending work of their own.
pub fn cancel_command_logs<'a>(
    ctx: &'a Arc<ManagerContext>,
    scope: ChildScope,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        CommandLog::cancel_pending_of(
            &ctx.pool,
            scope,
            ctx.status_id(Status::Set),
            ctx.status_id(Status::Cancel),
        )
        .await?;
        // A TaskLog scope covers every depth in one statement; only a
        // CommandLog subtree needs to walk its live branches.
        if let ChildScope::OfCommandLog(parent_id) = scope {
            for branch in CommandLog::live_branches_of(&ctx.pool, parent_id).await? {
                cancel_command_logs(ctx, ChildScope::OfCommandLog(branch.s_id)).await?;
            }
        }
        Ok(())
    })
}

/// Dispatch a progress TaskLog to the module owning its Action's method,
/// unless dedup says the work is already underway.
pub async fn dispatch_task_log(ctx: &Arc<ManagerContext>, task_log: &TaskLog) -> Result<()> {
    let action = Action::find_by_id(&ctx.pool, task_log.action_id)
        .await?
        .ok_or_else(|| TaskerError::not_found("action", task_log.action_id.to_string()))?;
    let (method, module) = resolve_target(ctx, action.method_id).await?;
    if !module.status {
        return Ok(());
    }

    let has_expansion = !CommandLog::list_for_task_log(&ctx.pool, task_log.s_id)
        .await?
        .is_empty();
    let replies = Message::latest_reply_times(&ctx.pool, task_log.s_id, None).await?;
    if !transitions::should_dispatch(replies, has_expansion) {
        return Ok(());
    }

    create_dispatch(ctx, &module, &method.system_name, task_log.s_id, None).await
}

/// Dispatch a progress CommandLog to the module owning its Command's method.
pub async fn dispatch_command_log(ctx: &Arc<ManagerContext>, command_log: &CommandLog) -> Result<()> {
    let command = Command::find_by_id(&ctx.pool, command_log.command_id)
        .await?
        .ok_or_else(|| TaskerError::not_found("command", command_log.command_id.to_string()))?;
    let (method, module) = resolve_target(ctx, command.method_id).await?;
    if !module.status {
        return Ok(());
    }

    let has_expansion = !CommandLog::children_of(&ctx.pool, command_log.s_id)
        .await?
        .is_empty();
    let replies =
        Message::latest_reply_times(&ctx.pool, command_log.task_log_id, Some(command_log.s_id))
            .await?;
    if !transitions::should_dispatch(replies, has_expansion) {
        return Ok(());
    }

    create_dispatch(
        ctx,
        &module,
        &method.system_name,
        command_log.task_log_id,
        Some(command_log.s_id),
    )
    .await
}

async fn resolve_target(ctx: &Arc<ManagerContext>, method_id: Uuid) -> Result<(Method, Module)> {
    let method = Method::find_by_id(&ctx.pool, method_id)
        .await?
        .ok_or_else(|| TaskerError::not_found("method", method_id.to_string()))?;
    let module = Module::find_by_id(&ctx.pool, method.module_id)
        .await?
        .ok_or_else(|| TaskerError::not_found("module", method.module_id.to_string()))?;
    Ok((method, module))
}

/// Insert an unsent `task` message; the unsent-message scan publishes it.
async fn create_dispatch(
    ctx: &Arc<ManagerContext>,
    module: &Module,
    method_system_name: &str,
    task_log_id: Uuid,
    command_log_id: Option<Uuid>,
) -> Result<()> {
    let message_id = Uuid::new_v4();
    let payload = MessagePayload::task(message_id, method_system_name);
    Message::create_with_id(
        &ctx.pool,
        message_id,
        &NewMessage {
            sender_id: ctx.module.s_id,
            recipient_id: module.s_id,
            msg_type: MsgType::Task,
            status: None,
            task_log_id: Some(task_log_id),
            command_log_id,
            parent_msg_id: None,
            data: Some(serde_json::to_value(&payload)?),
        },
    )
    .await?;
    debug!(
        module = %module.system_name,
        method = method_system_name,
        task_log_id = %task_log_id,
        "task message created"
    );
    Ok(())
}

/// Promote the next non-parallel sibling ordinal under a scope, strictly
/// after its predecessor finished.
pub async fn advance_sequential_siblings(
    ctx: &Arc<ManagerContext>,
    scope: ChildScope,
) -> Result<()> {
    let latest = CommandLog::latest_finished_number(&ctx.pool, scope).await?;
    let Some(next_number) = transitions::next_sibling_number(latest) else {
        return Ok(());
    };
    let set_id = ctx.status_id(Status::Set);
    let progress_id = ctx.status_id(Status::Progress);
    for sibling in CommandLog::pending_siblings_with_number(&ctx.pool, scope, next_number).await? {
        CommandLog::transition(&ctx.pool, sibling.s_id, set_id, progress_id).await?;
    }
    Ok(())
}

/// Fold a CommandLog's children verdict into the log itself.
pub async fn aggregate_command_log(ctx: &Arc<ManagerContext>, command_log: &CommandLog) -> Result<()> {
    let children =
        CommandLog::child_statuses(&ctx.pool, ChildScope::OfCommandLog(command_log.s_id)).await?;
    if let Some(verdict) = transitions::aggregate_verdict(&children) {
        CommandLog::transition(
            &ctx.pool,
            command_log.s_id,
            ctx.status_id(Status::Progress),
            ctx.status_id(verdict),
        )
        .await?;
    }
    Ok(())
}

/// Fold a TaskLog's expansion verdict into the log itself.
pub async fn aggregate_task_log(ctx: &Arc<ManagerContext>, task_log: &TaskLog) -> Result<()> {
    let children =
        CommandLog::child_statuses(&ctx.pool, ChildScope::OfTaskLog(task_log.s_id)).await?;
    if let Some(verdict) = transitions::aggregate_verdict(&children) {
        TaskLog::transition(
            &ctx.pool,
            task_log.s_id,
            ctx.status_id(Status::Progress),
            ctx.status_id(verdict),
        )
        .await?;
    }
    Ok(())
}

/// Fold the TaskLog verdict into a MainTaskLog; finishing additionally
/// stamps the end date and clears the current-task pointer.
pub async fn aggregate_main_task_log(
    ctx: &Arc<ManagerContext>,
    main_task_log: &MainTaskLog,
) -> Result<()> {
    let children = MainTaskLog::child_statuses(&ctx.pool, main_task_log.s_id).await?;
    let progress_id = ctx.status_id(Status::Progress);
    match transitions::aggregate_verdict(&children) {
        Some(Status::Error) => {
            MainTaskLog::transition(
                &ctx.pool,
                main_task_log.s_id,
                progress_id,
                ctx.status_id(Status::Error),
            )
            .await?;
        }
        Some(Status::Finish) => {
            MainTaskLog::finish(
                &ctx.pool,
                main_task_log.s_id,
                progress_id,
                ctx.status_id(Status::Finish),
            )
            .await?;
        }
        _ => {}
    }
    Ok(())
}

/// Publish unsent messages: mark each `sent`, then NOTIFY the recipient's
/// channel with the JSON payload.
pub async fn publish_unsent(ctx: &Arc<ManagerContext>, messages: &[Message]) -> Result<()> {
    for message in messages {
        let Some(module) = Module::find_by_id(&ctx.pool, message.recipient_id).await? else {
            warn!(message_id = %message.s_id, "recipient module no longer exists");
            continue;
        };
        let Some(data) = &message.data else {
            warn!(message_id = %message.s_id, "unsent message carries no payload");
            continue;
        };
        if Message::advance_status(&ctx.pool, message.s_id, SendStatus::Sent).await? {
            notify::publish(&ctx.pool, &module.channel_name, &data.to_string()).await?;
        }
    }
    Ok(())
}

/// Expand an inbound `task` message (method_list x object_list) into the
/// CommandLog tree under the referenced TaskLog.
pub async fn expand_to_command_logs(ctx: &Arc<ManagerContext>, message: &Message) -> Result<Reply> {
    let payload = message.payload()?;
    let task_log_id = message.task_log_id.ok_or_else(|| {
        TaskerError::Validation("task message carries no task log reference".to_string())
    })?;
    let task_log = TaskLog::find_by_id(&ctx.pool, task_log_id)
        .await?
        .ok_or_else(|| TaskerError::not_found("task_log", task_log_id.to_string()))?;

    let Some(method_list) = &payload.method_list else {
        warn!(message_id = %message.s_id, "task message without a method list");
        return Ok(Reply::None);
    };
    // Explicit object list wins; otherwise fall back on the objects already
    // linked to the task log.
    let objects: Vec<Uuid> = match &payload.object_list {
        Some(object_list) => object_list
            .iter()
            .map(|raw| {
                Uuid::parse_str(raw)
                    .map_err(|_| TaskerError::Validation(format!("invalid object id: {raw}")))
            })
            .collect::<Result<_>>()?,
        None => ObjectToTaskLog::list_for_task_log(&ctx.pool, task_log_id)
            .await?
            .into_iter()
            .map(|link| link.object_id)
            .collect(),
    };
    if objects.is_empty() {
        warn!(message_id = %message.s_id, "task message resolves to no objects");
        return Ok(Reply::None);
    }

    let mut commands = Vec::with_capacity(method_list.len());
    for method_name in method_list {
        match Command::resolve(&ctx.pool, method_name, message.sender_id, task_log.action_id)
            .await?
        {
            Some(command) => commands.push(command),
            None => warn!(
                method = %method_name,
                action_id = %task_log.action_id,
                "no command for requested method, skipping"
            ),
        }
    }
    if commands.is_empty() {
        return Ok(Reply::None);
    }

    let parallel = transitions::combined_parallel(commands.iter().map(|c| c.is_parallel));
    let set_id = ctx.status_id(Status::Set);
    let progress_id = ctx.status_id(Status::Progress);
    for (index, command) in commands.iter().enumerate() {
        let status_id = if parallel || index == 0 { progress_id } else { set_id };
        for object_id in &objects {
            let command_log_id = CommandLog::create(
                &ctx.pool,
                task_log_id,
                message.command_log_id,
                command.s_id,
                status_id,
            )
            .await?;
            ObjectToCommandLog::create(&ctx.pool, command_log_id, *object_id).await?;
        }
    }
    debug!(
        task_log_id = %task_log_id,
        commands = commands.len(),
        objects = objects.len(),
        parallel,
        "command logs expanded"
    );
    Ok(Reply::None)
}

/// Apply a success/error reply to the CommandLog or TaskLog it references.
pub async fn finalize_from_reply(ctx: &Arc<ManagerContext>, message: &Message) -> Result<Reply> {
    let verdict = match message.msg_type() {
        Some(MsgType::Success) => Status::Finish,
        Some(MsgType::Error) => Status::Error,
        _ => {
            return Err(TaskerError::Protocol(format!(
                "unexpected reply type: {}",
                message.msg_type
            )))
        }
    };
    let progress_id = ctx.status_id(Status::Progress);
    let verdict_id = ctx.status_id(verdict);
    if let Some(command_log_id) = message.command_log_id {
        CommandLog::transition(&ctx.pool, command_log_id, progress_id, verdict_id).await?;
    } else if let Some(task_log_id) = message.task_log_id {
        TaskLog::transition(&ctx.pool, task_log_id, progress_id, verdict_id).await?;
    } else {
        return Err(TaskerError::Protocol(
            "reply references neither a task log nor a command log".to_string(),
        ));
    }
    Ok(Reply::None)
}

/// A connect reply proves the sender is alive: mark it healthy and
/// re-dispatch its in-progress logs that never produced work.
pub async fn recover_module(ctx: &Arc<ManagerContext>, message: &Message) -> Result<Reply> {
    let Some(module) = Module::find_by_id(&ctx.pool, message.sender_id).await? else {
        return Err(TaskerError::not_found("module", message.sender_id.to_string()));
    };
    if module.status {
        return Ok(Reply::None);
    }
    Module::set_health(&ctx.pool, module.s_id, true).await?;
    debug!(module = %module.system_name, "module recovered");

    for task_log in TaskLog::list_redispatchable_for_module(&ctx.pool, module.s_id).await? {
        dispatch_task_log(ctx, &task_log).await?;
    }
    for command_log in CommandLog::list_redispatchable_for_module(&ctx.pool, module.s_id).await? {
        dispatch_command_log(ctx, &command_log).await?;
    }
    Ok(Reply::None)
}
