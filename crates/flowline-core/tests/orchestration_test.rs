//! End-to-end orchestration scenarios: Postgres State Store (via
//! `flowline-test-utils`'s shared container) plus an in-process fake Redis
//! Work Queue, driving the scheduler's three ticks directly rather than
//! waiting on their timers.

use std::time::Duration;

use flowline_core::dag::{validate_dag, TaskNode};
use flowline_core::scheduler::{run_completion_tick, run_retry_tick, run_scheduling_tick};
use flowline_core::WorkflowValidationError;
use flowline_db::models::{TaskStatus, WorkflowStatus};
use flowline_db::queries::tasks as task_db;
use flowline_db::queries::workflows::{self as workflow_db, NewTask, NewWorkflow};
use flowline_queue::{QueueConfig, RetryPolicy, WorkQueue};
use flowline_test_utils::{create_test_db, drop_test_db, start_fake_redis};
use uuid::Uuid;

fn new_task(name: &str, task_type: &str, max_retries: i32, deps: &[&str]) -> NewTask {
    NewTask {
        name: name.to_string(),
        task_type: task_type.to_string(),
        payload: serde_json::json!({}),
        max_retries,
        priority: 0,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
    }
}

async fn connect_queue(fake: &flowline_test_utils::FakeRedis) -> WorkQueue {
    WorkQueue::connect(&QueueConfig::new(fake.url()))
        .await
        .expect("failed to connect to fake redis")
}

#[test]
fn cycle_is_rejected_at_validation() {
    let a_deps = vec!["b".to_string()];
    let b_deps = vec!["a".to_string()];
    let nodes = vec![
        TaskNode {
            name: "a",
            depends_on: &a_deps,
        },
        TaskNode {
            name: "b",
            depends_on: &b_deps,
        },
    ];

    let err = validate_dag(&nodes).expect_err("a two-node cycle must be rejected");
    assert!(matches!(err, WorkflowValidationError::CycleDetected(_)));
}

#[tokio::test]
async fn linear_chain_runs_to_completion() {
    let (pool, db_name) = create_test_db().await;
    let fake = start_fake_redis().await;
    let queue = connect_queue(&fake).await;

    let workflow = workflow_db::create_workflow(
        &pool,
        &NewWorkflow {
            name: "linear-chain".to_string(),
            description: None,
            max_concurrency: None,
            timeout_seconds: None,
            retry_policy: None,
            tasks: vec![
                new_task("a", "step", 0, &[]),
                new_task("b", "step", 0, &["a"]),
            ],
        },
    )
    .await
    .expect("workflow creation should succeed");

    // Tick 1: only "a" has no unmet dependency.
    run_scheduling_tick(&pool, &queue).await.unwrap();
    let fetched = workflow_db::get_workflow(&pool, workflow.workflow.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.workflow.status, WorkflowStatus::Running);

    let task_a = queue
        .dequeue("step", Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap()
        .expect("task a should be enqueued");
    let a_id = fetched.tasks.iter().find(|t| t.name == "a").unwrap().id;
    assert_eq!(task_a.task_id, a_id);

    assert!(task_db::mark_task_running(&pool, a_id).await.unwrap());
    task_db::mark_task_completed(&pool, a_id, serde_json::json!({"ok": true}))
        .await
        .unwrap();
    queue.ack(&task_a).await.unwrap();

    // Tick 2: "b" is now unblocked.
    run_scheduling_tick(&pool, &queue).await.unwrap();
    let task_b = queue
        .dequeue("step", Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap()
        .expect("task b should be enqueued once a completes");
    let b_id = fetched.tasks.iter().find(|t| t.name == "b").unwrap().id;
    assert_eq!(task_b.task_id, b_id);

    assert!(task_db::mark_task_running(&pool, b_id).await.unwrap());
    task_db::mark_task_completed(&pool, b_id, serde_json::json!({"ok": true}))
        .await
        .unwrap();
    queue.ack(&task_b).await.unwrap();

    run_completion_tick(&pool, &queue).await.unwrap();
    let closed = workflow_db::get_workflow(&pool, workflow.workflow.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed.workflow.status, WorkflowStatus::Completed);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn parallel_fan_out_schedules_every_independent_task() {
    let (pool, db_name) = create_test_db().await;
    let fake = start_fake_redis().await;
    let queue = connect_queue(&fake).await;

    workflow_db::create_workflow(
        &pool,
        &NewWorkflow {
            name: "fan-out".to_string(),
            description: None,
            max_concurrency: None,
            timeout_seconds: None,
            retry_policy: None,
            tasks: vec![
                new_task("a", "fan", 0, &[]),
                new_task("b", "fan", 0, &[]),
                new_task("c", "fan", 0, &[]),
            ],
        },
    )
    .await
    .unwrap();

    run_scheduling_tick(&pool, &queue).await.unwrap();

    let stats = queue.get_queue_stats("fan").await.unwrap();
    assert_eq!(stats.ready, 3, "all three independent tasks should be enqueued in one tick");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_then_succeed_closes_workflow() {
    let (pool, db_name) = create_test_db().await;
    let fake = start_fake_redis().await;
    let queue = connect_queue(&fake).await;

    let workflow = workflow_db::create_workflow(
        &pool,
        &NewWorkflow {
            name: "retry-then-succeed".to_string(),
            description: None,
            max_concurrency: None,
            timeout_seconds: None,
            retry_policy: None,
            tasks: vec![new_task("flaky", "flaky", 1, &[])],
        },
    )
    .await
    .unwrap();
    let task_id = workflow.tasks[0].id;

    run_scheduling_tick(&pool, &queue).await.unwrap();
    let leased = queue
        .dequeue("flaky", Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    assert!(task_db::mark_task_running(&pool, task_id).await.unwrap());
    let status = task_db::record_task_failure(&pool, task_id, "boom").await.unwrap();
    assert_eq!(status, TaskStatus::Retrying);

    let fast_policy = RetryPolicy {
        initial_delay: Duration::from_millis(1),
        backoff_factor: 1.0,
        max_delay: Duration::from_secs(1),
    };
    queue.nack(&leased, &fast_policy).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    run_retry_tick(&pool, &queue).await.unwrap();

    let redelivered = queue
        .dequeue("flaky", Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap()
        .expect("retry should be promoted back onto the ready list");
    assert_eq!(redelivered.task_id, task_id);

    assert!(task_db::mark_task_running(&pool, task_id).await.unwrap());
    task_db::mark_task_completed(&pool, task_id, serde_json::json!({"ok": true}))
        .await
        .unwrap();
    queue.ack(&redelivered).await.unwrap();

    run_completion_tick(&pool, &queue).await.unwrap();
    let closed = workflow_db::get_workflow(&pool, workflow.workflow.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed.workflow.status, WorkflowStatus::Completed);

    let final_task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(final_task.retry_count, 1, "one retry should have been recorded, no more");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_exhaustion_fails_workflow() {
    let (pool, db_name) = create_test_db().await;
    let fake = start_fake_redis().await;
    let queue = connect_queue(&fake).await;

    let workflow = workflow_db::create_workflow(
        &pool,
        &NewWorkflow {
            name: "retry-exhaustion".to_string(),
            description: None,
            max_concurrency: None,
            timeout_seconds: None,
            retry_policy: None,
            tasks: vec![new_task("doomed", "doomed", 0, &[])],
        },
    )
    .await
    .unwrap();
    let task_id = workflow.tasks[0].id;

    run_scheduling_tick(&pool, &queue).await.unwrap();
    let leased = queue
        .dequeue("doomed", Uuid::new_v4(), Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    assert!(task_db::mark_task_running(&pool, task_id).await.unwrap());
    // max_retries = 0: the first failure is already terminal.
    let status = task_db::record_task_failure(&pool, task_id, "fatal").await.unwrap();
    assert_eq!(status, TaskStatus::Failed);
    queue.ack(&leased).await.unwrap();

    run_completion_tick(&pool, &queue).await.unwrap();
    let closed = workflow_db::get_workflow(&pool, workflow.workflow.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed.workflow.status, WorkflowStatus::Failed);

    let final_task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(final_task.retry_count, 0, "retry_count must not overshoot when already exhausted");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_crash_mid_task_is_reaped_back_to_ready() {
    let (pool, db_name) = create_test_db().await;
    let fake = start_fake_redis().await;
    let queue = connect_queue(&fake).await;

    workflow_db::create_workflow(
        &pool,
        &NewWorkflow {
            name: "crash-mid-task".to_string(),
            description: None,
            max_concurrency: None,
            timeout_seconds: None,
            retry_policy: None,
            tasks: vec![new_task("long_running", "reap_me", 3, &[])],
        },
    )
    .await
    .unwrap();

    run_scheduling_tick(&pool, &queue).await.unwrap();

    // A worker that dequeues but never registers (and so is never a known
    // active worker) models a crash mid-task.
    let crashed_worker = Uuid::new_v4();
    queue
        .dequeue("reap_me", crashed_worker, Duration::from_secs(1))
        .await
        .unwrap()
        .expect("task should be leased to the doomed worker");

    let before = queue.get_queue_stats("reap_me").await.unwrap();
    assert_eq!(before.processing, 1);

    run_completion_tick(&pool, &queue).await.unwrap();

    let after = queue.get_queue_stats("reap_me").await.unwrap();
    assert_eq!(after.processing, 0);
    assert_eq!(after.ready, 1, "the reaped task should be redelivered to the ready list");

    drop_test_db(&db_name).await;
}
