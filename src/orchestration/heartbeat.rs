//! Periodic liveness probing of the other modules.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Message, MessagePayload, Module, MsgType, NewMessage};
use crate::orchestration::handlers::ManagerContext;
use crate::orchestration::transitions::{probe_decision, ProbeDecision};

/// One heartbeat pass: decide per remote module whether to probe, and flag
/// down modules whose previous probe went unanswered. The flagged module is
/// still probed in the same pass so it can recover on its own.
pub async fn run_heartbeat(ctx: &Arc<ManagerContext>) -> Result<()> {
    let now = Utc::now();
    for module in Module::list_others(&ctx.pool, ctx.module.s_id).await? {
        let unanswered =
            Message::has_unanswered_probe(&ctx.pool, ctx.module.s_id, module.s_id).await?;
        let reply_age = Message::last_connect_reply_at(&ctx.pool, ctx.module.s_id, module.s_id)
            .await?
            .map(|at| now - at);

        match probe_decision(module.status, unanswered, reply_age, ctx.period) {
            ProbeDecision::Skip => continue,
            ProbeDecision::MarkUnhealthyAndResend => {
                warn!(module = %module.system_name, "connect probe unanswered, flagging module down");
                Module::set_health(&ctx.pool, module.s_id, false).await?;
                send_probe(ctx, module.s_id).await?;
            }
            ProbeDecision::Send => {
                send_probe(ctx, module.s_id).await?;
            }
        }
    }
    Ok(())
}

/// Insert an unsent `connect` probe; the unsent-message scan publishes it.
async fn send_probe(ctx: &Arc<ManagerContext>, module_id: Uuid) -> Result<()> {
    let message_id = Uuid::new_v4();
    let payload = MessagePayload::connect(message_id);
    Message::create_with_id(
        &ctx.pool,
        message_id,
        &NewMessage {
            sender_id: ctx.module.s_id,
            recipient_id: module_id,
            msg_type: MsgType::Connect,
            status: None,
            task_log_id: None,
            command_log_id: None,
            parent_msg_id: None,
            data: Some(serde_json::to_value(&payload)?),
        },
    )
    .await?;
    debug!(module_id = %module_id, "connect probe queued");
    Ok(())
}
