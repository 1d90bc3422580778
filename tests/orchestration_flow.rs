//! Database-backed orchestration flow tests.
//!
//! These run against a live PostgreSQL with the `manager` schema loaded:
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/manager_test cargo test -- --ignored
//! ```

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use task_manager::models::{
    ChildScope, CommandLog, MainTaskLog, Message, MessagePayload, Module, MsgType, NewMessage,
    ObjectToCommandLog, SendStatus, Status, StatusCache, TaskLog,
};
use task_manager::orchestration::handlers::{self, ManagerContext};

async fn connect() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
    PgPool::connect(&url).await.expect("database connection")
}

/// Seeded template fixture: one base task with one task of two sequential
/// actions, both bound to a single worker module.
struct Fixture {
    ctx: Arc<ManagerContext>,
    worker_module_id: Uuid,
    base_task_id: Uuid,
    task_id: Uuid,
    first_action_id: Uuid,
    first_method_id: Uuid,
    first_method_name: String,
    second_method_id: Uuid,
    second_method_name: String,
    first_command_id: Uuid,
    second_command_id: Uuid,
}

async fn seed(pool: &PgPool) -> Fixture {
    for status in Status::ALL {
        sqlx::query(
            r#"
            INSERT INTO manager.task_status (s_id, name, system_name)
            SELECT gen_random_uuid(), $1, $1
            WHERE NOT EXISTS (
                SELECT 1 FROM manager.task_status WHERE system_name = $1
            )
            "#,
        )
        .bind(status.as_str())
        .execute(pool)
        .await
        .unwrap();
    }
    let statuses = StatusCache::load(pool).await.unwrap();

    // unique names per run so tests do not collide
    let run = Uuid::new_v4().simple().to_string();
    let manager_module_id = insert_module(pool, &format!("manager_{run}")).await;
    let worker_module_id = insert_module(pool, &format!("worker_{run}")).await;

    let base_task_id = insert_returning(
        pool,
        "INSERT INTO manager.base_task (s_id, name) VALUES (gen_random_uuid(), $1) RETURNING s_id",
        &format!("base_{run}"),
    )
    .await;
    let task_id = insert_returning(
        pool,
        "INSERT INTO manager.task (s_id, name) VALUES (gen_random_uuid(), $1) RETURNING s_id",
        &format!("task_{run}"),
    )
    .await;
    sqlx::query(
        r#"
        INSERT INTO manager.task_sequence (s_id, base_task_id, task_id, number)
        VALUES (gen_random_uuid(), $1, $2, 1)
        "#,
    )
    .bind(base_task_id)
    .bind(task_id)
    .execute(pool)
    .await
    .unwrap();

    let first_method_name = format!("collect_{run}");
    let first_method_id = insert_method(pool, worker_module_id, &first_method_name).await;
    let second_method_name = format!("report_{run}");
    let second_method_id = insert_method(pool, worker_module_id, &second_method_name).await;
    let first_action_id = insert_action(pool, task_id, first_method_id, 1).await;
    insert_action(pool, task_id, second_method_id, 2).await;

    // two sequential commands under the first action
    let first_command_id =
        insert_command(pool, first_action_id, first_method_id, false, 1).await;
    let second_command_id =
        insert_command(pool, first_action_id, second_method_id, false, 2).await;

    let module = Module::find_by_id(pool, manager_module_id).await.unwrap().unwrap();
    let ctx = Arc::new(ManagerContext {
        pool: pool.clone(),
        statuses,
        module,
        period: chrono::Duration::minutes(5),
    });
    Fixture {
        ctx,
        worker_module_id,
        base_task_id,
        task_id,
        first_action_id,
        first_method_id,
        first_method_name,
        second_method_id,
        second_method_name,
        first_command_id,
        second_command_id,
    }
}

async fn insert_module(pool: &PgPool, system_name: &str) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO manager.module (s_id, name, system_name, channel_name, status)
        VALUES (gen_random_uuid(), $1, $1, $2, TRUE)
        RETURNING s_id
        "#,
    )
    .bind(system_name)
    .bind(format!("chan_{system_name}"))
    .fetch_one(pool)
    .await
    .unwrap();
    id
}

async fn insert_returning(pool: &PgPool, sql: &str, name: &str) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(sql).bind(name).fetch_one(pool).await.unwrap();
    id
}

async fn insert_method(pool: &PgPool, module_id: Uuid, system_name: &str) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO manager.method_module (s_id, module_id, name, system_name)
        VALUES (gen_random_uuid(), $1, $2, $2)
        RETURNING s_id
        "#,
    )
    .bind(module_id)
    .bind(system_name)
    .fetch_one(pool)
    .await
    .unwrap();
    id
}

async fn insert_action(pool: &PgPool, task_id: Uuid, method_id: Uuid, number: i32) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO manager.action (s_id, task_id, method_id, name, number)
        VALUES (gen_random_uuid(), $1, $2, 'step', $3)
        RETURNING s_id
        "#,
    )
    .bind(task_id)
    .bind(method_id)
    .bind(number)
    .fetch_one(pool)
    .await
    .unwrap();
    id
}

async fn insert_command(
    pool: &PgPool,
    action_id: Uuid,
    method_id: Uuid,
    is_parallel: bool,
    number: i32,
) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO manager.command (s_id, action_id, method_id, parent_id, name, is_parallel, number)
        VALUES (gen_random_uuid(), $1, $2, NULL, 'cmd', $3, $4)
        RETURNING s_id
        "#,
    )
    .bind(action_id)
    .bind(method_id)
    .bind(is_parallel)
    .bind(number)
    .fetch_one(pool)
    .await
    .unwrap();
    id
}

async fn insert_main_task_log(pool: &PgPool, fixture: &Fixture, status: Status) -> MainTaskLog {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO manager.base_task_log (s_id, base_task_id, status_id, add_task_date)
        VALUES (gen_random_uuid(), $1, $2, NOW())
        RETURNING s_id
        "#,
    )
    .bind(fixture.base_task_id)
    .bind(fixture.ctx.statuses.id(status))
    .fetch_one(pool)
    .await
    .unwrap();
    MainTaskLog::find_by_id(pool, id).await.unwrap().unwrap()
}

fn status_of(ctx: &ManagerContext, status_id: Uuid) -> Status {
    ctx.statuses.status_of(status_id).expect("well-known status")
}

#[tokio::test]
#[ignore]
async fn generate_task_logs_builds_the_ordered_sequence() {
    let pool = connect().await;
    let fixture = seed(&pool).await;
    let ctx = &fixture.ctx;

    let main_task_log = insert_main_task_log(&pool, &fixture, Status::Progress).await;
    handlers::generate_task_logs(ctx, &main_task_log).await.unwrap();

    let logs: Vec<TaskLog> = sqlx::query_as(
        r#"
        SELECT tl.s_id, tl.main_task_log_id, tl.action_id, tl.status_id
        FROM manager.task_log tl
        JOIN manager.action a ON a.s_id = tl.action_id
        WHERE tl.main_task_log_id = $1
        ORDER BY a.number
        "#,
    )
    .bind(main_task_log.s_id)
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(logs.len(), 2);
    assert_eq!(status_of(ctx, logs[0].status_id), Status::Progress);
    assert_eq!(status_of(ctx, logs[1].status_id), Status::Set);
    assert_eq!(logs[0].action_id, fixture.first_action_id);

    let reloaded = MainTaskLog::find_by_id(&pool, main_task_log.s_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.current_task_id, Some(logs[0].s_id));
    assert!(reloaded.exec_task_date.is_some());

    // replaying generation must not duplicate: the log is no longer awaiting
    let awaiting = MainTaskLog::list_awaiting_generation(&pool).await.unwrap();
    assert!(!awaiting.iter().any(|m| m.s_id == main_task_log.s_id));

    // a second generator racing on a stale snapshot must insert nothing
    handlers::generate_task_logs(ctx, &main_task_log).await.unwrap();
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM manager.task_log WHERE main_task_log_id = $1")
            .bind(main_task_log.s_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
#[ignore]
async fn expansion_creates_ordered_command_logs_with_object_links() {
    let pool = connect().await;
    let fixture = seed(&pool).await;
    let ctx = &fixture.ctx;

    let main_task_log = insert_main_task_log(&pool, &fixture, Status::Progress).await;
    handlers::generate_task_logs(ctx, &main_task_log).await.unwrap();
    let reloaded = MainTaskLog::find_by_id(&pool, main_task_log.s_id)
        .await
        .unwrap()
        .unwrap();
    let task_log_id = reloaded.current_task_id.unwrap();

    let object_id = Uuid::new_v4();
    let message_id = Uuid::new_v4();
    let payload = serde_json::json!({
        "task_id": message_id,
        "msg_type": "task",
        "method_list": [fixture.first_method_name.clone(), "unknown_method".to_string()],
        "object_list": [object_id.to_string()],
    });
    Message::create_with_id(
        &pool,
        message_id,
        &NewMessage {
            sender_id: fixture.worker_module_id,
            recipient_id: ctx.module.s_id,
            msg_type: MsgType::Task,
            status: Some(SendStatus::Sent),
            task_log_id: Some(task_log_id),
            command_log_id: None,
            parent_msg_id: None,
            data: Some(payload),
        },
    )
    .await
    .unwrap();

    let message = Message::list_inbound_tasks(&pool, ctx.module.s_id)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.s_id == message_id)
        .unwrap();
    handlers::process_inbound(ctx, &message, || {
        handlers::expand_to_command_logs(ctx, &message)
    })
    .await
    .unwrap();

    // unknown methods are skipped; the resolved command expands once
    let command_logs = CommandLog::list_for_task_log(&pool, task_log_id).await.unwrap();
    assert_eq!(command_logs.len(), 1);
    assert_eq!(command_logs[0].command_id, fixture.first_command_id);
    assert_eq!(status_of(ctx, command_logs[0].status_id), Status::Progress);

    let links = ObjectToCommandLog::list_for_command_log(&pool, command_logs[0].s_id)
        .await
        .unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].object_id, object_id);

    // the pipeline fully acknowledged the inbound message
    let processed: (Option<String>,) =
        sqlx::query_as("SELECT status FROM manager.message WHERE s_id = $1")
            .bind(message_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(processed.0.as_deref(), Some("processed"));

    // a second queued job carrying the same message snapshot is a no-op:
    // the message is past `sent`, so the handler never runs again
    handlers::process_inbound(ctx, &message, || {
        handlers::expand_to_command_logs(ctx, &message)
    })
    .await
    .unwrap();
    let command_logs = CommandLog::list_for_task_log(&pool, task_log_id).await.unwrap();
    assert_eq!(command_logs.len(), 1);
}

#[tokio::test]
#[ignore]
async fn parallel_expansion_promotes_every_command_log() {
    let pool = connect().await;
    let fixture = seed(&pool).await;
    let ctx = &fixture.ctx;

    // an action whose two commands both allow parallel execution
    let parallel_action_id =
        insert_action(&pool, fixture.task_id, fixture.first_method_id, 3).await;
    insert_command(&pool, parallel_action_id, fixture.first_method_id, true, 1).await;
    insert_command(&pool, parallel_action_id, fixture.second_method_id, true, 2).await;

    let main_task_log = insert_main_task_log(&pool, &fixture, Status::Progress).await;
    let ids = TaskLog::bulk_create(
        &pool,
        main_task_log.s_id,
        &[(parallel_action_id, ctx.statuses.id(Status::Progress))],
    )
    .await
    .unwrap();
    let task_log_id = ids[0];

    let object_id = Uuid::new_v4();
    let message_id = Uuid::new_v4();
    let payload = serde_json::json!({
        "task_id": message_id,
        "msg_type": "task",
        "method_list": [
            fixture.first_method_name.clone(),
            fixture.second_method_name.clone(),
        ],
        "object_list": [object_id.to_string()],
    });
    Message::create_with_id(
        &pool,
        message_id,
        &NewMessage {
            sender_id: fixture.worker_module_id,
            recipient_id: ctx.module.s_id,
            msg_type: MsgType::Task,
            status: Some(SendStatus::Sent),
            task_log_id: Some(task_log_id),
            command_log_id: None,
            parent_msg_id: None,
            data: Some(payload),
        },
    )
    .await
    .unwrap();

    let message = Message::list_inbound_tasks(&pool, ctx.module.s_id)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.s_id == message_id)
        .unwrap();
    handlers::process_inbound(ctx, &message, || {
        handlers::expand_to_command_logs(ctx, &message)
    })
    .await
    .unwrap();

    // an all-parallel expansion starts every command at once
    let command_logs = CommandLog::list_for_task_log(&pool, task_log_id).await.unwrap();
    assert_eq!(command_logs.len(), 2);
    for command_log in &command_logs {
        assert_eq!(status_of(ctx, command_log.status_id), Status::Progress);
    }
}

#[tokio::test]
#[ignore]
async fn sequential_siblings_advance_in_order() {
    let pool = connect().await;
    let fixture = seed(&pool).await;
    let ctx = &fixture.ctx;

    let main_task_log = insert_main_task_log(&pool, &fixture, Status::Progress).await;
    handlers::generate_task_logs(ctx, &main_task_log).await.unwrap();
    let task_log_id = MainTaskLog::find_by_id(&pool, main_task_log.s_id)
        .await
        .unwrap()
        .unwrap()
        .current_task_id
        .unwrap();

    let first = CommandLog::create(
        &pool,
        task_log_id,
        None,
        fixture.first_command_id,
        ctx.statuses.id(Status::Finish),
    )
    .await
    .unwrap();
    let second = CommandLog::create(
        &pool,
        task_log_id,
        None,
        fixture.second_command_id,
        ctx.statuses.id(Status::Set),
    )
    .await
    .unwrap();

    handlers::advance_sequential_siblings(ctx, ChildScope::OfTaskLog(task_log_id))
        .await
        .unwrap();

    let second_log = CommandLog::find_by_id(&pool, second).await.unwrap().unwrap();
    assert_eq!(status_of(ctx, second_log.status_id), Status::Progress);
    let first_log = CommandLog::find_by_id(&pool, first).await.unwrap().unwrap();
    assert_eq!(status_of(ctx, first_log.status_id), Status::Finish);

    // once everything finishes, the task log aggregates to finish
    CommandLog::transition(
        &pool,
        second,
        ctx.statuses.id(Status::Progress),
        ctx.statuses.id(Status::Finish),
    )
    .await
    .unwrap();
    let task_log = TaskLog::find_by_id(&pool, task_log_id).await.unwrap().unwrap();
    handlers::aggregate_task_log(ctx, &task_log).await.unwrap();
    let task_log = TaskLog::find_by_id(&pool, task_log_id).await.unwrap().unwrap();
    assert_eq!(status_of(ctx, task_log.status_id), Status::Finish);
}

#[tokio::test]
#[ignore]
async fn cancellation_cascades_to_pending_descendants_only() {
    let pool = connect().await;
    let fixture = seed(&pool).await;
    let ctx = &fixture.ctx;

    let main_task_log = insert_main_task_log(&pool, &fixture, Status::Progress).await;
    handlers::generate_task_logs(ctx, &main_task_log).await.unwrap();
    let task_log_id = MainTaskLog::find_by_id(&pool, main_task_log.s_id)
        .await
        .unwrap()
        .unwrap()
        .current_task_id
        .unwrap();

    let running = CommandLog::create(
        &pool,
        task_log_id,
        None,
        fixture.first_command_id,
        ctx.statuses.id(Status::Progress),
    )
    .await
    .unwrap();
    let pending = CommandLog::create(
        &pool,
        task_log_id,
        None,
        fixture.second_command_id,
        ctx.statuses.id(Status::Set),
    )
    .await
    .unwrap();

    // cancel the main task log, then run the cascade the scans would run
    MainTaskLog::transition(
        &pool,
        main_task_log.s_id,
        ctx.statuses.id(Status::Progress),
        ctx.statuses.id(Status::Cancel),
    )
    .await
    .unwrap();
    let cancelling = MainTaskLog::list_awaiting_cancellation(&pool).await.unwrap();
    assert!(cancelling.iter().any(|m| m.s_id == main_task_log.s_id));
    handlers::cancel_task_logs(ctx, std::slice::from_ref(&main_task_log))
        .await
        .unwrap();
    TaskLog::transition(
        &pool,
        task_log_id,
        ctx.statuses.id(Status::Progress),
        ctx.statuses.id(Status::Cancel),
    )
    .await
    .unwrap();
    handlers::cancel_command_logs(ctx, ChildScope::OfTaskLog(task_log_id))
        .await
        .unwrap();

    let pending_log = CommandLog::find_by_id(&pool, pending).await.unwrap().unwrap();
    assert_eq!(status_of(ctx, pending_log.status_id), Status::Cancel);
    // in-flight work is not yanked; its module reports the outcome
    let running_log = CommandLog::find_by_id(&pool, running).await.unwrap().unwrap();
    assert_eq!(status_of(ctx, running_log.status_id), Status::Progress);
}

#[tokio::test]
#[ignore]
async fn reply_finalization_is_idempotent() {
    let pool = connect().await;
    let fixture = seed(&pool).await;
    let ctx = &fixture.ctx;

    let main_task_log = insert_main_task_log(&pool, &fixture, Status::Progress).await;
    handlers::generate_task_logs(ctx, &main_task_log).await.unwrap();
    let task_log_id = MainTaskLog::find_by_id(&pool, main_task_log.s_id)
        .await
        .unwrap()
        .unwrap()
        .current_task_id
        .unwrap();

    let message_id = Uuid::new_v4();
    let payload = MessagePayload {
        task_id: message_id,
        msg_type: MsgType::Success,
        method: None,
        method_list: None,
        object_list: None,
        message: None,
    };
    Message::create_with_id(
        &pool,
        message_id,
        &NewMessage {
            sender_id: fixture.worker_module_id,
            recipient_id: ctx.module.s_id,
            msg_type: MsgType::Success,
            status: Some(SendStatus::Sent),
            task_log_id: Some(task_log_id),
            command_log_id: None,
            parent_msg_id: None,
            data: Some(serde_json::to_value(&payload).unwrap()),
        },
    )
    .await
    .unwrap();

    let message = Message::list_task_log_finalizers(&pool, ctx.module.s_id)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.s_id == message_id)
        .unwrap();
    handlers::process_inbound(ctx, &message, || {
        handlers::finalize_from_reply(ctx, &message)
    })
    .await
    .unwrap();

    let task_log = TaskLog::find_by_id(&pool, task_log_id).await.unwrap().unwrap();
    assert_eq!(status_of(ctx, task_log.status_id), Status::Finish);

    // replaying the same reply is a no-op on both the log and the message
    handlers::process_inbound(ctx, &message, || {
        handlers::finalize_from_reply(ctx, &message)
    })
    .await
    .unwrap();
    let task_log = TaskLog::find_by_id(&pool, task_log_id).await.unwrap().unwrap();
    assert_eq!(status_of(ctx, task_log.status_id), Status::Finish);
    let status: (Option<String>,) =
        sqlx::query_as("SELECT status FROM manager.message WHERE s_id = $1")
            .bind(message_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status.0.as_deref(), Some("processed"));
}
