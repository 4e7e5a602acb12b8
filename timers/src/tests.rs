use chrono::Duration as ChronoDuration;
use tempfile::TempDir;

use model::{HistoryEvent, HistoryEventKind, InstanceId, TaskMessage};

use super::*;

fn timer(instance: &str, event_id: u64, fire_at: DateTime<Utc>) -> TimerEntry {
    TimerEntry::new(
        fire_at,
        TaskMessage::new(
            InstanceId::new(instance),
            HistoryEvent::new(event_id, HistoryEventKind::TimerFired { fire_at }),
        ),
    )
}

fn setup() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let executor = task_executor::Executor::new();
    let store = Store::new(dir.path(), 16 * 1024 * 1024, 8, executor).unwrap();
    (dir, store)
}

#[tokio::test]
async fn wake_delay_is_none_when_empty() {
    let (_dir, store) = setup();
    let timers = Timers::new(store).unwrap();
    assert_eq!(timers.wake_delay(Utc::now()).await.unwrap(), None);
}

#[tokio::test]
async fn wake_delay_is_zero_for_an_already_due_entry() {
    let (_dir, store) = setup();
    let timers = Timers::new(store).unwrap();
    let past = Utc::now() - ChronoDuration::seconds(5);
    timers.schedule(vec![timer("i1", 0, past)]).await.unwrap();
    assert_eq!(timers.wake_delay(Utc::now()).await.unwrap(), Some(Duration::ZERO));
}

#[tokio::test]
async fn pop_fired_only_returns_due_entries_in_fire_order() {
    let (_dir, store) = setup();
    let timers = Timers::new(store.clone()).unwrap();
    let now = Utc::now();
    let earlier = timer("b", 0, now - ChronoDuration::seconds(2));
    let later_due = timer("a", 0, now - ChronoDuration::seconds(1));
    let not_due = timer("a", 1, now + ChronoDuration::seconds(60));
    timers
        .schedule(vec![not_due.clone(), later_due.clone(), earlier.clone()])
        .await
        .unwrap();

    let timers2 = timers.clone();
    let fired = store
        .transact(move |txn| timers2.pop_fired_in_txn(txn, Utc::now(), 10))
        .await
        .unwrap();

    assert_eq!(fired.len(), 2);
    assert_eq!(fired[0].target.target_instance, InstanceId::new("b"));
    assert_eq!(fired[1].target.target_instance, InstanceId::new("a"));
    assert_eq!(timers.pending_count().await, 1);
}

#[tokio::test]
async fn fire_due_entries_injects_into_the_target_session() {
    let (_dir, store) = setup();
    let timers = Timers::new(store.clone()).unwrap();
    let sessions = Sessions::new(store).unwrap();

    let due = timer("i1", 0, Utc::now() - ChronoDuration::milliseconds(10));
    timers.schedule(vec![due]).await.unwrap();

    let cancel = AsyncLatch::new();
    let session = sessions.accept_session(Duration::from_secs(1), &cancel).await;
    assert!(session.is_none(), "nothing delivered to the session yet");

    let fired = timers.fire_due_entries(&sessions).await.unwrap();
    assert_eq!(fired, 1);

    let session = sessions
        .accept_session(Duration::from_secs(1), &cancel)
        .await
        .expect("the fired timer should now be a pending message");
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn run_loop_exits_promptly_on_cancellation() {
    let (_dir, store) = setup();
    let timers = Timers::new(store.clone()).unwrap();
    let sessions = Sessions::new(store).unwrap();
    let cancel = AsyncLatch::new();
    cancel.trigger();

    let started = std::time::Instant::now();
    timers.run_loop(&sessions, &cancel, Duration::from_secs(10)).await;
    assert!(started.elapsed() < Duration::from_secs(1));
}
