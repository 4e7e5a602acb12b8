use std::time::Duration;

use tempfile::TempDir;

use model::OrchestrationStatus;

use super::*;

async fn client() -> (TempDir, Client) {
    let dir = TempDir::new().unwrap();
    let executor = task_executor::Executor::new();
    let store = Store::new(dir.path(), 16 * 1024 * 1024, 16, executor).unwrap();
    let sessions = Sessions::new(store.clone()).unwrap();
    let instance_store = InstanceStore::new(store.clone()).unwrap();
    (dir, Client::new(store, sessions, instance_store))
}

#[tokio::test]
async fn create_instance_writes_a_pending_state_and_a_start_message() {
    let (_dir, client) = client().await;
    let handle = client
        .create_instance("Greet".to_string(), "1".to_string(), None, Some(serde_json::json!("world")), None)
        .await
        .unwrap();

    let state = client
        .get_state_for_execution(&handle.instance, &handle.execution)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, OrchestrationStatus::Pending);
    assert_eq!(state.input, Some(serde_json::json!("world")));

    let session = client
        .sessions
        .accept_session(Duration::from_millis(200), &async_latch::AsyncLatch::new())
        .await
        .unwrap();
    assert_eq!(session.messages().len(), 1);
    assert!(matches!(
        session.messages()[0].event.kind,
        model::HistoryEventKind::ExecutionStarted { .. }
    ));
}

#[tokio::test]
async fn create_instance_honors_a_caller_supplied_instance_id() {
    let (_dir, client) = client().await;
    let chosen = InstanceId::new("my-instance");
    let handle = client
        .create_instance("Greet".to_string(), "1".to_string(), Some(chosen.clone()), None, None)
        .await
        .unwrap();
    assert_eq!(handle.instance, chosen);
}

#[tokio::test]
async fn raise_event_and_terminate_instance_enqueue_messages_without_touching_state() {
    let (_dir, client) = client().await;
    let handle = client
        .create_instance("Greet".to_string(), "1".to_string(), None, None, None)
        .await
        .unwrap();

    client.raise_event(handle.instance.clone(), "approve".to_string(), None).await.unwrap();
    client.terminate_instance(handle.instance.clone(), "operator request".to_string()).await.unwrap();

    let session = client
        .sessions
        .accept_session(Duration::from_millis(200), &async_latch::AsyncLatch::new())
        .await
        .unwrap();
    // ExecutionStarted, EventRaised, ExecutionTerminated, in append order.
    assert_eq!(session.messages().len(), 3);
    assert!(matches!(session.messages()[1].event.kind, model::HistoryEventKind::EventRaised { .. }));
    assert!(matches!(session.messages()[2].event.kind, model::HistoryEventKind::ExecutionTerminated { .. }));
}

#[tokio::test]
async fn get_state_returns_none_for_an_instance_that_was_never_started() {
    let (_dir, client) = client().await;
    let state = client.get_state(&InstanceId::new("never-started")).await.unwrap();
    assert!(state.is_none());
}

#[tokio::test]
async fn wait_for_instance_returns_once_the_instance_store_reports_a_terminal_state() {
    let (_dir, client) = client().await;
    let handle = client
        .create_instance("Greet".to_string(), "1".to_string(), None, None, None)
        .await
        .unwrap();

    // Simulate the orchestration dispatcher committing a terminal state directly, rather than
    // spinning up a full dispatcher cycle here: this test is about the façade's polling, not the
    // dispatcher's commit path (see `dispatcher`'s own tests for that).
    let mut completed = client.get_state_for_execution(&handle.instance, &handle.execution).await.unwrap().unwrap();
    completed.status = OrchestrationStatus::Completed;
    completed.output = Some(serde_json::json!("done"));
    client.instance_store.write_entities(vec![completed]).await.unwrap();

    let observed = client
        .wait_for_instance(&handle.instance, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed.status, OrchestrationStatus::Completed);
}

#[tokio::test]
async fn wait_for_instance_times_out_while_still_running() {
    let (_dir, client) = client().await;
    let handle = client
        .create_instance("Greet".to_string(), "1".to_string(), None, None, None)
        .await
        .unwrap();

    let observed = client
        .wait_for_instance(&handle.instance, Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed.status, OrchestrationStatus::Pending);
}
