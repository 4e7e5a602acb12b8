use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use async_trait::async_trait;
use tempfile::TempDir;

use activities::Activities;
use instance_store::InstanceStore;
use model::{
    ActivityFailure, ActivityRegistry, ExecutionId, HistoryEvent, HistoryEventKind, InstanceId,
    OrchestrationExecutor, OrchestrationState, OrchestrationStatus, TaskMessage, Transition, WorkItem,
};
use sessions::Sessions;
use store::Store;
use timers::Timers;

use super::*;

struct Harness {
    _dir: TempDir,
    store: Store,
    sessions: Sessions,
    activities: Activities,
    timers: Timers,
    instance_store: InstanceStore,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let executor = task_executor::Executor::new();
    let store = Store::new(dir.path(), 16 * 1024 * 1024, 16, executor).unwrap();
    Harness {
        sessions: Sessions::new(store.clone()).unwrap(),
        activities: Activities::new(store.clone()).await.unwrap(),
        timers: Timers::new(store.clone()).unwrap(),
        instance_store: InstanceStore::new(store.clone()).unwrap(),
        store,
        _dir: dir,
    }
}

fn started(instance: &InstanceId) -> OrchestrationState {
    OrchestrationState::pending(
        instance.clone(),
        ExecutionId::new("e1"),
        "Greet".to_string(),
        "1".to_string(),
        None,
        BTreeMap::new(),
        chrono::Utc::now(),
    )
}

/// An executor stubbed to return one fixed `Transition` regardless of input, optionally failing
/// or requesting `ContinueAsNew`.
struct ScriptedExecutor {
    result: std::sync::Mutex<Option<Result<Transition, String>>>,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn once(result: Result<Transition, String>) -> Arc<ScriptedExecutor> {
        Arc::new(ScriptedExecutor { result: std::sync::Mutex::new(Some(result)), calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl OrchestrationExecutor for ScriptedExecutor {
    async fn execute(&self, _work_item: WorkItem) -> Result<Transition, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err("ScriptedExecutor invoked more than once".to_string()))
    }
}

struct EmptyRegistry;

#[async_trait]
impl ActivityRegistry for EmptyRegistry {
    async fn run(&self, _name: &str, _version: &str, _input: Option<serde_json::Value>) -> Option<Result<Option<serde_json::Value>, ActivityFailure>> {
        None
    }
}

fn raise_event(instance: &InstanceId, id: u64) -> TaskMessage {
    TaskMessage::new(
        instance.clone(),
        HistoryEvent::new(id, HistoryEventKind::EventRaised { name: "start".into(), input: None }),
    )
}

#[tokio::test]
async fn successful_cycle_commits_all_four_updates_atomically() {
    let h = harness().await;
    let instance = InstanceId::new("i1");
    h.instance_store.write_entities(vec![started(&instance)]).await.unwrap();
    h.sessions.append_message(raise_event(&instance, 0)).await.unwrap();

    let mut final_state = started(&instance);
    final_state.status = OrchestrationStatus::Completed;
    final_state.output = Some(serde_json::json!("done"));

    let executor = ScriptedExecutor::once(Ok(Transition {
        new_runtime_state: vec![HistoryEvent::new(0, HistoryEventKind::ExecutionCompleted { output: final_state.output.clone() })],
        outbound_activity_msgs: vec![],
        orchestrator_msgs: vec![],
        timer_msgs: vec![],
        continue_as_new: false,
        final_state: Some(final_state.clone()),
    }));

    let dispatcher = OrchestrationDispatcher::new(
        h.store.clone(),
        h.sessions.clone(),
        h.activities.clone(),
        h.timers.clone(),
        h.instance_store.clone(),
        executor,
        Duration::from_millis(200),
    );
    let cancel = AsyncLatch::new();
    let processed = dispatcher.run_cycle(&cancel).await.unwrap();
    assert!(processed);

    let read = h
        .instance_store
        .get_state_for_execution(&instance, &ExecutionId::new("e1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.status, OrchestrationStatus::Completed);

    // Terminal sessions are released (removed) once the commit lands.
    let reclaimed = h.sessions.accept_session(Duration::from_millis(150), &cancel).await;
    assert!(reclaimed.is_none());
}

#[tokio::test]
async fn executor_error_abandons_the_claim_for_immediate_retry() {
    let h = harness().await;
    let instance = InstanceId::new("i1");
    h.instance_store.write_entities(vec![started(&instance)]).await.unwrap();
    h.sessions.append_message(raise_event(&instance, 0)).await.unwrap();

    let executor = ScriptedExecutor::once(Err("replay bug".to_string()));
    let dispatcher = OrchestrationDispatcher::new(
        h.store.clone(),
        h.sessions.clone(),
        h.activities.clone(),
        h.timers.clone(),
        h.instance_store.clone(),
        executor,
        Duration::from_millis(200),
    );
    let cancel = AsyncLatch::new();
    let result = dispatcher.run_cycle(&cancel).await;
    assert!(matches!(result, Err(DispatchError::Fatal(_))));
    assert_eq!(result.unwrap_err().backoff(), Duration::ZERO);

    // The session must be reclaimable again, not stuck locked.
    let reclaimed = h.sessions.accept_session(Duration::from_millis(200), &cancel).await;
    assert!(reclaimed.is_some());
}

#[tokio::test]
async fn continue_as_new_is_unsupported_and_leaves_the_session_locked() {
    let h = harness().await;
    let instance = InstanceId::new("i1");
    h.instance_store.write_entities(vec![started(&instance)]).await.unwrap();
    h.sessions.append_message(raise_event(&instance, 0)).await.unwrap();

    let executor = ScriptedExecutor::once(Ok(Transition { continue_as_new: true, ..Transition::default() }));
    let dispatcher = OrchestrationDispatcher::new(
        h.store.clone(),
        h.sessions.clone(),
        h.activities.clone(),
        h.timers.clone(),
        h.instance_store.clone(),
        executor,
        Duration::from_millis(200),
    );
    let cancel = AsyncLatch::new();
    let result = dispatcher.run_cycle(&cancel).await;
    assert!(matches!(result, Err(DispatchError::Unsupported("ContinueAsNew"))));

    // Left locked: a fresh accept_session must not reclaim it without a boot sweep.
    let reclaimed = h.sessions.accept_session(Duration::from_millis(200), &cancel).await;
    assert!(reclaimed.is_none());
}

#[tokio::test]
async fn missing_activity_type_synthesizes_a_task_failed_response() {
    let h = harness().await;
    let target = InstanceId::new("i1");
    let scheduled = TaskMessage::new(
        target.clone(),
        HistoryEvent::new(0, HistoryEventKind::TaskScheduled {
            name: "UnknownTask".to_string(),
            version: "1".to_string(),
            input: None,
        }),
    );
    h.activities.append_batch(vec![scheduled]).await.unwrap();

    let dispatcher = ActivityDispatcher::new(
        h.store.clone(),
        h.activities.clone(),
        h.sessions.clone(),
        Arc::new(EmptyRegistry),
        Duration::from_millis(200),
    );
    let processed = dispatcher.run_cycle().await.unwrap();
    assert!(processed);

    let cancel = AsyncLatch::new();
    let session = h.sessions.accept_session(Duration::from_millis(200), &cancel).await.unwrap();
    assert_eq!(session.messages().len(), 1);
    match &session.messages()[0].event.kind {
        HistoryEventKind::TaskFailed { reason, .. } => assert_eq!(reason, "TypeMissing"),
        other => panic!("expected TaskFailed, got {other:?}"),
    }
}
