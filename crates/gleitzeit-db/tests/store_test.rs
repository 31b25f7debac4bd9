//! Store-contract tests for the PostgreSQL backend.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use gleitzeit_core::error::{ErrorCode, TaskError};
use gleitzeit_core::model::{
    qualified_task_id, FailureStrategy, Priority, Task, TaskResult, TaskStatus, Workflow,
    WorkflowStatus,
};
use gleitzeit_core::retry::RetryPolicy;
use gleitzeit_core::store::{Store, StoreError, TaskStatusUpdate};
use gleitzeit_db::PgStore;
use gleitzeit_test_utils::{create_test_db, drop_test_db};

fn workflow(id: Uuid, task_ids: Vec<String>) -> Workflow {
    Workflow {
        id,
        name: "pg-test".to_owned(),
        description: Some("store contract".to_owned()),
        total: task_ids.len() as u32,
        tasks: task_ids,
        status: WorkflowStatus::Running,
        failure_strategy: FailureStrategy::FailFast,
        completed: 0,
        failed: 0,
        created_at: Utc::now(),
        completed_at: None,
    }
}

fn task(workflow_id: Uuid, local_id: &str, deps: &[&str]) -> Task {
    Task {
        id: qualified_task_id(&workflow_id, local_id),
        workflow_id: Some(workflow_id),
        local_id: local_id.to_owned(),
        name: None,
        protocol: "llm/v1".to_owned(),
        method: "chat".to_owned(),
        params: json!({"prompt": "hello ${dep.response}"}),
        dependencies: deps
            .iter()
            .map(|d| qualified_task_id(&workflow_id, d))
            .collect(),
        priority: Priority::Normal,
        timeout_secs: Some(120),
        retry: RetryPolicy::default(),
        status: TaskStatus::Queued,
        attempt: 0,
        error: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

#[tokio::test]
async fn workflow_and_task_roundtrip() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let wf_id = Uuid::new_v4();
    let t1 = task(wf_id, "t1", &[]);
    let t2 = task(wf_id, "t2", &["t1"]);
    let wf = workflow(wf_id, vec![t1.id.clone(), t2.id.clone()]);

    store.put_workflow(&wf).await.unwrap();
    store.put_task(&t1).await.unwrap();
    store.put_task(&t2).await.unwrap();

    let loaded = store.get_workflow(wf_id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "pg-test");
    assert_eq!(loaded.tasks.len(), 2);
    assert_eq!(loaded.status, WorkflowStatus::Running);

    let loaded_t2 = store.get_task(&t2.id).await.unwrap().unwrap();
    assert_eq!(loaded_t2.local_id, "t2");
    assert_eq!(loaded_t2.dependencies, vec![t1.id.clone()]);
    assert_eq!(loaded_t2.priority, Priority::Normal);
    assert_eq!(loaded_t2.retry.max_attempts, 3);
    assert_eq!(loaded_t2.params["prompt"], json!("hello ${dep.response}"));

    let members = store.list_tasks_by_workflow(wf_id).await.unwrap();
    assert_eq!(members.len(), 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn status_update_merges_metadata() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let wf_id = Uuid::new_v4();
    let t = task(wf_id, "t1", &[]);
    store.put_task(&t).await.unwrap();

    let started = Utc::now();
    store
        .update_task_status(
            &t.id,
            TaskStatus::Running,
            TaskStatusUpdate {
                attempt: Some(1),
                started_at: Some(started),
                ..TaskStatusUpdate::default()
            },
        )
        .await
        .unwrap();

    // A later update without started_at must keep the earlier value.
    store
        .update_task_status(
            &t.id,
            TaskStatus::Failed,
            TaskStatusUpdate {
                completed_at: Some(Utc::now()),
                error: Some(TaskError::new(ErrorCode::TaskTimeout, "deadline")),
                ..TaskStatusUpdate::default()
            },
        )
        .await
        .unwrap();

    let loaded = store.get_task(&t.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Failed);
    assert_eq!(loaded.attempt, 1);
    assert!(loaded.started_at.is_some());
    assert!(loaded.completed_at.is_some());
    assert_eq!(loaded.error.unwrap().code, ErrorCode::TaskTimeout);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn updating_missing_task_is_not_found() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let err = store
        .update_task_status("ghost", TaskStatus::Ready, TaskStatusUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_by_status_respects_limit() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let wf_id = Uuid::new_v4();
    for i in 0..5 {
        store
            .put_task(&task(wf_id, &format!("t{i}"), &[]))
            .await
            .unwrap();
    }

    let queued = store
        .list_tasks_by_status(TaskStatus::Queued, Some(3))
        .await
        .unwrap();
    assert_eq!(queued.len(), 3);
    let all = store
        .list_tasks_by_status(TaskStatus::Queued, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 5);
    assert!(store
        .list_tasks_by_status(TaskStatus::Running, None)
        .await
        .unwrap()
        .is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn results_roundtrip_and_overwrite() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let wf_id = Uuid::new_v4();
    let task_id = qualified_task_id(&wf_id, "t1");
    let result = TaskResult {
        task_id: task_id.clone(),
        workflow_id: Some(wf_id),
        status: TaskStatus::Completed,
        result: Some(json!({"response": "HELLO", "items": [1, 2, 3]})),
        error: None,
        duration_ms: Some(42),
        provider_id: Some("p1".to_owned()),
        created_at: Utc::now(),
    };
    store.put_result(&result).await.unwrap();

    let loaded = store.get_result(&task_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Completed);
    assert_eq!(loaded.result.as_ref().unwrap()["items"], json!([1, 2, 3]));
    assert_eq!(loaded.provider_id.as_deref(), Some("p1"));

    assert!(store.get_result("missing").await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retries_pop_only_due_entries() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let now = Utc::now();
    store
        .upsert_retry("due-1", now - chrono::Duration::seconds(10), 1)
        .await
        .unwrap();
    store
        .upsert_retry("due-2", now - chrono::Duration::seconds(5), 2)
        .await
        .unwrap();
    store
        .upsert_retry("future", now + chrono::Duration::seconds(600), 1)
        .await
        .unwrap();

    let due = store.pop_due_retries(now).await.unwrap();
    assert_eq!(due.len(), 2);
    assert_eq!(due[0].task_id, "due-1");
    assert_eq!(due[1].task_id, "due-2");

    // Popped entries are gone; the future entry persists.
    assert!(store.pop_due_retries(now).await.unwrap().is_empty());

    // Upsert replaces fire_at and attempt.
    store
        .upsert_retry("future", now + chrono::Duration::seconds(1200), 3)
        .await
        .unwrap();
    let pending = store.enumerate_pending_on_startup().await.unwrap().retries;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt, 3);

    store.delete_retry("future").await.unwrap();
    assert!(store
        .enumerate_pending_on_startup()
        .await
        .unwrap()
        .retries
        .is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn enumerate_pending_scopes_to_running_workflows() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let live_id = Uuid::new_v4();
    let live_task = task(live_id, "t1", &[]);
    let live = workflow(live_id, vec![live_task.id.clone()]);
    store.put_workflow(&live).await.unwrap();
    store.put_task(&live_task).await.unwrap();

    let done_id = Uuid::new_v4();
    let done_task = task(done_id, "t1", &[]);
    let mut done = workflow(done_id, vec![done_task.id.clone()]);
    done.status = WorkflowStatus::Completed;
    done.completed_at = Some(Utc::now());
    store.put_workflow(&done).await.unwrap();
    store.put_task(&done_task).await.unwrap();

    let pending = store.enumerate_pending_on_startup().await.unwrap();
    assert_eq!(pending.workflows.len(), 1);
    assert_eq!(pending.workflows[0].id, live_id);
    assert_eq!(pending.tasks.len(), 1);
    assert_eq!(pending.tasks[0].workflow_id, Some(live_id));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn aggregate_update_bumps_counts_and_status() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let wf_id = Uuid::new_v4();
    store
        .put_workflow(&workflow(wf_id, vec![]))
        .await
        .unwrap();

    let finished = Utc::now();
    store
        .update_workflow_aggregate(wf_id, WorkflowStatus::Completed, 3, 0, Some(finished))
        .await
        .unwrap();

    let loaded = store.get_workflow(wf_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, WorkflowStatus::Completed);
    assert_eq!(loaded.completed, 3);
    assert!(loaded.completed_at.is_some());

    let err = store
        .update_workflow_aggregate(Uuid::new_v4(), WorkflowStatus::Failed, 0, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    pool.close().await;
    drop_test_db(&db_name).await;
}
