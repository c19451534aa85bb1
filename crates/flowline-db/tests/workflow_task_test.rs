//! Integration tests for workflow and task CRUD operations.

use flowline_db::models::{TaskStatus, WorkflowStatus};
use flowline_db::queries::tasks;
use flowline_db::queries::workflows::{self, NewTask, NewWorkflow};

use flowline_test_utils::{create_test_db, drop_test_db};

fn sample_workflow() -> NewWorkflow {
    NewWorkflow {
        name: "ingest-and-report".to_string(),
        description: Some("fetch, transform, report".to_string()),
        max_concurrency: Some(4),
        timeout_seconds: Some(3600),
        retry_policy: None,
        tasks: vec![
            NewTask {
                name: "fetch".to_string(),
                task_type: "http_fetch".to_string(),
                payload: serde_json::json!({"url": "https://example.com/data"}),
                max_retries: 3,
                priority: 0,
                dependencies: vec![],
            },
            NewTask {
                name: "transform".to_string(),
                task_type: "shell".to_string(),
                payload: serde_json::json!({"cmd": "transform.sh"}),
                max_retries: 1,
                priority: 0,
                dependencies: vec!["fetch".to_string()],
            },
            NewTask {
                name: "report".to_string(),
                task_type: "email".to_string(),
                payload: serde_json::json!({"to": "team@example.com"}),
                max_retries: 0,
                priority: 5,
                dependencies: vec!["transform".to_string()],
            },
        ],
    }
}

#[tokio::test]
async fn create_and_fetch_workflow_with_tasks() {
    let (pool, db_name) = create_test_db().await;

    let created = workflows::create_workflow(&pool, &sample_workflow())
        .await
        .expect("create workflow");

    assert_eq!(created.tasks.len(), 3);
    assert_eq!(created.workflow.status, WorkflowStatus::Pending);

    let fetched = workflows::get_workflow(&pool, created.workflow.id)
        .await
        .expect("get workflow")
        .expect("workflow should exist");

    assert_eq!(fetched.workflow.name, "ingest-and-report");
    assert_eq!(fetched.tasks.len(), 3);

    let report_task = fetched
        .tasks
        .iter()
        .find(|t| t.name == "report")
        .expect("report task present");
    let deps = tasks::get_task_dependencies(&pool, report_task.id)
        .await
        .expect("fetch deps");
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].depends_on_name, "transform");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_workflow_rejects_unknown_dependency() {
    let (pool, db_name) = create_test_db().await;

    let mut new = sample_workflow();
    new.tasks[1].dependencies = vec!["does-not-exist".to_string()];

    let result = workflows::create_workflow(&pool, &new).await;
    assert!(result.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_workflows_filters_by_status_and_paginates() {
    let (pool, db_name) = create_test_db().await;

    for i in 0..3 {
        let mut new = sample_workflow();
        new.name = format!("wf-{i}");
        workflows::create_workflow(&pool, &new)
            .await
            .expect("create workflow");
    }

    let page = workflows::list_workflows(&pool, None, 2, 0)
        .await
        .expect("list workflows");
    assert_eq!(page.workflows.len(), 2);
    assert_eq!(page.total, 3);

    let none = workflows::list_workflows(&pool, Some(WorkflowStatus::Completed), 10, 0)
        .await
        .expect("list completed workflows");
    assert_eq!(none.workflows.len(), 0);
    assert_eq!(none.total, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn update_workflow_status_sets_timestamps_once() {
    let (pool, db_name) = create_test_db().await;

    let created = workflows::create_workflow(&pool, &sample_workflow())
        .await
        .expect("create workflow");

    workflows::update_workflow_status(&pool, created.workflow.id, WorkflowStatus::Running)
        .await
        .expect("mark running");

    let running = workflows::get_workflow(&pool, created.workflow.id)
        .await
        .expect("get workflow")
        .expect("exists")
        .workflow;
    assert_eq!(running.status, WorkflowStatus::Running);
    let first_started_at = running.started_at.expect("started_at set");

    workflows::update_workflow_status(&pool, created.workflow.id, WorkflowStatus::Running)
        .await
        .expect("mark running again");

    let still_running = workflows::get_workflow(&pool, created.workflow.id)
        .await
        .expect("get workflow")
        .expect("exists")
        .workflow;
    assert_eq!(still_running.started_at, Some(first_started_at));

    workflows::update_workflow_status(&pool, created.workflow.id, WorkflowStatus::Completed)
        .await
        .expect("mark completed");

    let completed = workflows::get_workflow(&pool, created.workflow.id)
        .await
        .expect("get workflow")
        .expect("exists")
        .workflow;
    assert_eq!(completed.status, WorkflowStatus::Completed);
    assert!(completed.completed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_lifecycle_running_completed_and_failure_retry() {
    let (pool, db_name) = create_test_db().await;

    let created = workflows::create_workflow(&pool, &sample_workflow())
        .await
        .expect("create workflow");
    let fetch_task = created
        .tasks
        .iter()
        .find(|t| t.name == "fetch")
        .expect("fetch task present");

    let claimed = tasks::mark_task_running(&pool, fetch_task.id)
        .await
        .expect("mark running");
    assert!(claimed);

    // A second claim attempt should fail: the task is no longer schedulable.
    let claimed_again = tasks::mark_task_running(&pool, fetch_task.id)
        .await
        .expect("second claim attempt");
    assert!(!claimed_again);

    let status = tasks::record_task_failure(&pool, fetch_task.id, "connection refused")
        .await
        .expect("record failure");
    assert_eq!(status, TaskStatus::Retrying);

    let reclaimed = tasks::mark_task_running(&pool, fetch_task.id)
        .await
        .expect("reclaim after retry");
    assert!(reclaimed);

    tasks::mark_task_completed(&pool, fetch_task.id, serde_json::json!({"bytes": 1024}))
        .await
        .expect("mark completed");

    let completed = tasks::get_task(&pool, fetch_task.id)
        .await
        .expect("get task")
        .expect("exists");
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.retry_count, 1);
    assert_eq!(completed.result.unwrap()["bytes"], 1024);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_failure_exhausts_retries_to_terminal_failed() {
    let (pool, db_name) = create_test_db().await;

    let mut new = sample_workflow();
    new.tasks[2].max_retries = 0;
    let created = workflows::create_workflow(&pool, &new)
        .await
        .expect("create workflow");
    let report_task = created
        .tasks
        .iter()
        .find(|t| t.name == "report")
        .expect("report task present");

    tasks::mark_task_running(&pool, report_task.id)
        .await
        .expect("mark running");

    let status = tasks::record_task_failure(&pool, report_task.id, "smtp timeout")
        .await
        .expect("record failure");
    assert_eq!(status, TaskStatus::Failed);

    let failed = tasks::get_task(&pool, report_task.id)
        .await
        .expect("get task")
        .expect("exists");
    assert!(failed.completed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_count_does_not_overshoot_max_retries_on_terminal_failure() {
    let (pool, db_name) = create_test_db().await;

    let mut new = sample_workflow();
    new.tasks[2].max_retries = 1;
    let created = workflows::create_workflow(&pool, &new)
        .await
        .expect("create workflow");
    let report_task = created
        .tasks
        .iter()
        .find(|t| t.name == "report")
        .expect("report task present");

    tasks::mark_task_running(&pool, report_task.id)
        .await
        .expect("mark running");
    let first = tasks::record_task_failure(&pool, report_task.id, "smtp timeout")
        .await
        .expect("record first failure");
    assert_eq!(first, TaskStatus::Retrying);

    let after_first = tasks::get_task(&pool, report_task.id)
        .await
        .expect("get task")
        .expect("exists");
    assert_eq!(after_first.retry_count, 1);

    tasks::mark_task_running(&pool, report_task.id)
        .await
        .expect("reclaim after retry");
    let second = tasks::record_task_failure(&pool, report_task.id, "smtp timeout again")
        .await
        .expect("record second failure");
    assert_eq!(second, TaskStatus::Failed);

    let after_second = tasks::get_task(&pool, report_task.id)
        .await
        .expect("get task")
        .expect("exists");
    assert_eq!(after_second.retry_count, 1);
    assert!(after_second.completed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_workflow_tasks_leaves_terminal_tasks_untouched() {
    let (pool, db_name) = create_test_db().await;

    let created = workflows::create_workflow(&pool, &sample_workflow())
        .await
        .expect("create workflow");
    let fetch_task = created
        .tasks
        .iter()
        .find(|t| t.name == "fetch")
        .expect("fetch task present");

    tasks::mark_task_running(&pool, fetch_task.id)
        .await
        .expect("mark running");
    tasks::mark_task_completed(&pool, fetch_task.id, serde_json::json!({}))
        .await
        .expect("mark completed");

    let cancelled_count = tasks::cancel_tasks_for_workflow(&pool, created.workflow.id)
        .await
        .expect("cancel tasks");
    assert_eq!(cancelled_count, 2);

    let fetched = workflows::get_workflow(&pool, created.workflow.id)
        .await
        .expect("get workflow")
        .expect("exists");
    let fetch = fetched.tasks.iter().find(|t| t.name == "fetch").unwrap();
    let transform = fetched
        .tasks
        .iter()
        .find(|t| t.name == "transform")
        .unwrap();
    assert_eq!(fetch.status, TaskStatus::Completed);
    assert_eq!(transform.status, TaskStatus::Cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn check_workflow_completion_reports_failure_and_terminal_state() {
    let (pool, db_name) = create_test_db().await;

    let mut new = sample_workflow();
    new.tasks[0].max_retries = 0;
    let created = workflows::create_workflow(&pool, &new)
        .await
        .expect("create workflow");
    let fetch_task = &created.tasks[0];
    let transform_task = &created.tasks[1];
    let report_task = &created.tasks[2];

    let mid = tasks::check_workflow_completion(&pool, created.workflow.id)
        .await
        .expect("check completion");
    assert!(!mid.all_terminal);

    tasks::mark_task_running(&pool, fetch_task.id)
        .await
        .expect("mark running");
    tasks::record_task_failure(&pool, fetch_task.id, "fatal")
        .await
        .expect("fail fetch");
    tasks::mark_task_cancelled(&pool, transform_task.id)
        .await
        .expect("cancel transform");
    tasks::mark_task_cancelled(&pool, report_task.id)
        .await
        .expect("cancel report");

    let done = tasks::check_workflow_completion(&pool, created.workflow.id)
        .await
        .expect("check completion");
    assert!(done.all_terminal);
    assert!(done.any_failed);
    assert!(done.any_cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn zero_task_workflow_is_immediately_terminal() {
    let (pool, db_name) = create_test_db().await;

    let new = NewWorkflow {
        name: "empty".to_string(),
        description: None,
        max_concurrency: None,
        timeout_seconds: None,
        retry_policy: None,
        tasks: vec![],
    };
    let created = workflows::create_workflow(&pool, &new)
        .await
        .expect("create empty workflow");
    assert!(created.tasks.is_empty());

    let completion = tasks::check_workflow_completion(&pool, created.workflow.id)
        .await
        .expect("check completion");
    assert!(completion.all_terminal);
    assert!(!completion.any_failed);
    assert!(!completion.any_cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_pending_tasks_orders_by_priority_then_age() {
    let (pool, db_name) = create_test_db().await;

    let created = workflows::create_workflow(&pool, &sample_workflow())
        .await
        .expect("create workflow");

    let pending = tasks::get_pending_tasks(&pool, 10)
        .await
        .expect("get pending tasks");

    // "report" has priority 5, the others priority 0 -- it must sort first
    // among this workflow's pending tasks despite being created last.
    let names: Vec<&str> = pending.iter().map(|t| t.name.as_str()).collect();
    let report_pos = names.iter().position(|n| *n == "report").unwrap();
    let fetch_pos = names.iter().position(|n| *n == "fetch").unwrap();
    assert!(report_pos < fetch_pos);

    assert_eq!(pending.len(), created.tasks.len());

    pool.close().await;
    drop_test_db(&db_name).await;
}
