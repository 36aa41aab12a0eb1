use minidur::providers::fs::FsStore;
use minidur::providers::in_memory::InMemoryStore;
use minidur::providers::{InstanceStore, QueueKind, WorkItem};
use minidur::{run_turn, run_turn_with, Action, Event};

fn started(name: &str, input: &str) -> Event {
    Event::OrchestrationStarted {
        name: name.to_string(),
        input: input.to_string(),
    }
}

#[test]
fn fan_out_schedules_everything_in_one_turn() {
    let history = vec![started("FanOut", "")];
    let (hist_after, actions, _logs, out, nondet): minidur::TurnResult<Result<String, String>> =
        run_turn(history, |ctx| async move {
            let calls = vec![
                ctx.schedule_activity("Work", "a"),
                ctx.schedule_activity("Work", "b"),
                ctx.schedule_activity("Work", "c"),
            ];
            let results = ctx.join(calls).await;
            Ok(results.into_iter().map(|r| r.unwrap()).collect::<String>())
        });

    assert!(out.is_none(), "no completions yet, must suspend");
    assert!(nondet.is_none());
    // All three schedules land in this single turn, ids in call order.
    assert_eq!(
        actions,
        vec![
            Action::CallActivity { id: 1, name: "Work".into(), input: "a".into() },
            Action::CallActivity { id: 2, name: "Work".into(), input: "b".into() },
            Action::CallActivity { id: 3, name: "Work".into(), input: "c".into() },
        ]
    );
    let scheduled: Vec<&Event> = hist_after
        .iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { .. }))
        .collect();
    assert_eq!(scheduled.len(), 3);
}

#[test]
fn recorded_completion_resolves_without_new_actions() {
    let history = vec![
        started("Single", ""),
        Event::ActivityScheduled { id: 1, name: "Work".into(), input: "x".into() },
        Event::ActivityCompleted { id: 1, result: "done".into() },
    ];
    let (hist_after, actions, _logs, out, nondet): minidur::TurnResult<Result<String, String>> =
        run_turn_with(history.clone(), 1, |ctx| async move {
            let r = ctx.schedule_activity("Work", "x").await?;
            Ok(r)
        });

    assert_eq!(out, Some(Ok("done".to_string())));
    assert!(actions.is_empty(), "replayed call must not re-dispatch");
    assert!(nondet.is_none());
    assert_eq!(hist_after, history, "pure replay leaves history untouched");
}

#[test]
fn correlation_ids_continue_past_history() {
    // One schedule already recorded and completed; the next call gets id 2.
    let history = vec![
        started("Seq", ""),
        Event::ActivityScheduled { id: 1, name: "Work".into(), input: "x".into() },
        Event::ActivityCompleted { id: 1, result: "one".into() },
    ];
    let (_hist, actions, _logs, out, _nondet): minidur::TurnResult<Result<String, String>> =
        run_turn(history, |ctx| async move {
            let first = ctx.schedule_activity("Work", "x").await?;
            let second = ctx.schedule_activity("Work", "y").await?;
            Ok(format!("{first}{second}"))
        });

    assert!(out.is_none());
    assert_eq!(
        actions,
        vec![Action::CallActivity { id: 2, name: "Work".into(), input: "y".into() }]
    );
}

#[test]
fn activity_failure_surfaces_as_err() {
    let history = vec![
        started("Failing", ""),
        Event::ActivityScheduled { id: 1, name: "Work".into(), input: "x".into() },
        Event::ActivityFailed { id: 1, error: "boom".into() },
    ];
    let (_hist, _actions, _logs, out, _nondet): minidur::TurnResult<Result<String, String>> =
        run_turn(history, |ctx| async move {
            ctx.schedule_activity("Work", "x").await
        });
    assert_eq!(out, Some(Err("boom".to_string())));
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CountPayload {
    n: u32,
}

#[test]
fn typed_scheduling_encodes_json_payloads() {
    let history = vec![started("Typed", "")];
    let (_hist, actions, _logs, out, _nondet): minidur::TurnResult<Result<String, String>> =
        run_turn(history, |ctx| async move {
            ctx.schedule_activity_typed("Work", &CountPayload { n: 7 }).await
        });
    assert!(out.is_none());
    assert_eq!(
        actions,
        vec![Action::CallActivity { id: 1, name: "Work".into(), input: r#"{"n":7}"#.into() }]
    );
}

#[test]
fn typed_continue_as_new_encodes_input() {
    let history = vec![started("Typed", "")];
    let (_hist, actions, _logs, _out, _nondet): minidur::TurnResult<Result<String, String>> =
        run_turn(history, |ctx| async move {
            ctx.continue_as_new_typed(&CountPayload { n: 2 });
            Ok(String::new())
        });
    assert_eq!(actions, vec![Action::ContinueAsNew { input: r#"{"n":2}"#.into() }]);
}

#[test]
fn continue_as_new_records_action() {
    let history = vec![started("Loop", "0")];
    let (_hist, actions, _logs, _out, _nondet): minidur::TurnResult<Result<String, String>> =
        run_turn(history, |ctx| async move {
            ctx.continue_as_new("1");
            Ok(String::new())
        });
    assert_eq!(actions, vec![Action::ContinueAsNew { input: "1".into() }]);
}

#[tokio::test]
async fn in_memory_store_contract() {
    let store = InMemoryStore::new();
    store.create_instance("i1").await.unwrap();
    assert!(store.create_instance("i1").await.is_err(), "create is the uniqueness gate");

    store.append("i1", vec![started("O", "in")]).await.unwrap();
    store
        .append("i1", vec![Event::ActivityScheduled { id: 1, name: "A".into(), input: "x".into() }])
        .await
        .unwrap();

    // Duplicate completions for the same id collapse to one.
    store
        .append("i1", vec![Event::ActivityCompleted { id: 1, result: "r".into() }])
        .await
        .unwrap();
    store
        .append("i1", vec![Event::ActivityCompleted { id: 1, result: "stale".into() }])
        .await
        .unwrap();
    let hist = store.read("i1").await;
    let completions = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
    assert!(hist.contains(&Event::ActivityCompleted { id: 1, result: "r".into() }));

    assert_eq!(store.latest_execution_id("i1").await, Some(1));
    let eid = store.create_new_execution("i1", "O", "in2").await.unwrap();
    assert_eq!(eid, 2);
    assert_eq!(store.read("i1").await, vec![started("O", "in2")]);
    // Prior execution stays queryable and immutable.
    assert_eq!(store.read_with_execution("i1", 1).await, hist);

    assert!(store.append("missing", vec![started("O", "")]).await.is_err());
    assert_eq!(store.latest_execution_id("missing").await, None);
}

#[test]
fn progress_turns_carry_logs_but_replay_turns_stay_silent() {
    // First (live) turn records a decision, so the buffered log survives.
    let history = vec![started("Logged", "")];
    let (hist_after, _actions, logs, _out, _nondet): minidur::TurnResult<Result<String, String>> =
        run_turn(history, |ctx| async move {
            ctx.trace_info("scheduling work");
            ctx.schedule_activity("Work", "x").await
        });
    assert_eq!(logs.len(), 1);

    // Replaying the same suspended state makes no new decisions, so the same
    // buffered message is dropped instead of being re-emitted.
    let (_hist, _actions, logs, _out, _nondet): minidur::TurnResult<Result<String, String>> =
        run_turn(hist_after, |ctx| async move {
            ctx.trace_info("scheduling work");
            ctx.schedule_activity("Work", "x").await
        });
    assert!(logs.is_empty());
}

#[tokio::test]
async fn remove_and_reset_clear_instances() {
    let store = InMemoryStore::new();
    store.create_instance("i1").await.unwrap();
    store.create_instance("i2").await.unwrap();

    store.remove_instance("i1").await.unwrap();
    assert!(store.remove_instance("i1").await.is_err());
    assert_eq!(store.latest_execution_id("i1").await, None);

    store.append("i2", vec![started("O", "")]).await.unwrap();
    assert!(store.dump_all_pretty().await.contains("instance=i2"));

    store.reset().await;
    assert!(store.list_instances().await.is_empty());
}

#[tokio::test]
async fn in_memory_queue_peek_lock_semantics() {
    let store = InMemoryStore::new();
    let item = WorkItem::ActivityExecute {
        instance: "i1".into(),
        id: 1,
        name: "A".into(),
        input: "x".into(),
    };
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();
    // Idempotent enqueue: identical pending item is not doubled.
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();

    let (got, token) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(got, item);
    assert!(
        store.dequeue_peek_lock(QueueKind::Worker).await.is_none(),
        "locked item must be invisible"
    );

    // Abandon redelivers the same item.
    store.abandon(QueueKind::Worker, &token).await.unwrap();
    let (again, token2) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(again, item);

    store.ack(QueueKind::Worker, &token2).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());
}

#[tokio::test]
async fn fs_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path(), true);

    store.create_instance("i1").await.unwrap();
    assert!(store.create_instance("i1").await.is_err());

    store.append("i1", vec![started("O", "in")]).await.unwrap();
    store
        .append("i1", vec![Event::ActivityScheduled { id: 1, name: "A".into(), input: "x".into() }])
        .await
        .unwrap();
    store
        .append("i1", vec![Event::ActivityCompleted { id: 1, result: "r".into() }])
        .await
        .unwrap();

    // A second store over the same root sees the same history.
    let reopened = FsStore::new(dir.path(), false);
    let hist = reopened.read("i1").await;
    assert_eq!(hist.len(), 3);
    assert_eq!(hist[0], started("O", "in"));

    assert_eq!(reopened.list_instances().await, vec!["i1".to_string()]);
    let eid = reopened.create_new_execution("i1", "O", "in2").await.unwrap();
    assert_eq!(eid, 2);
    assert_eq!(reopened.read("i1").await, vec![started("O", "in2")]);
}

#[tokio::test]
async fn fs_store_history_cap_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new_with_cap(dir.path(), true, 2);
    store.create_instance("i1").await.unwrap();
    store.append("i1", vec![started("O", "")]).await.unwrap();
    store
        .append("i1", vec![Event::ActivityScheduled { id: 1, name: "A".into(), input: "x".into() }])
        .await
        .unwrap();
    let err = store
        .append("i1", vec![Event::ActivityCompleted { id: 1, result: "r".into() }])
        .await
        .unwrap_err();
    assert!(err.contains("history cap exceeded"), "got: {err}");
}

#[tokio::test]
async fn fs_enqueue_dedups_against_in_flight_items() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path(), true);
    let item = WorkItem::ActivityExecute {
        instance: "i1".into(),
        id: 1,
        name: "A".into(),
        input: "x".into(),
    };
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();
    let (_got, token) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();

    // While the item is peek-locked, an identical enqueue must not double it.
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());

    store.ack(QueueKind::Worker, &token).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());
}

#[tokio::test]
async fn fs_expired_locks_are_swept_back_onto_the_queue_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let item = WorkItem::ActivityExecute {
        instance: "i1".into(),
        id: 1,
        name: "A".into(),
        input: "x".into(),
    };
    {
        // Dequeue and never ack, as a crashed process would.
        let store = FsStore::new(dir.path(), true);
        store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();
        let (_got, _token) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    }

    // Default expiry keeps a fresh lock alive.
    let untouched = FsStore::new(dir.path(), false);
    assert!(untouched.dequeue_peek_lock(QueueKind::Worker).await.is_none());

    // Zero expiry treats every sidecar as abandoned and requeues it.
    let swept =
        FsStore::new_with_lock_expiry(dir.path(), false, std::time::Duration::ZERO);
    let (got, token) = swept.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(got, item);
    swept.ack(QueueKind::Worker, &token).await.unwrap();
    assert!(swept.dequeue_peek_lock(QueueKind::Worker).await.is_none());
}

#[tokio::test]
async fn fs_queue_survives_reopen_and_redelivers_unacked() {
    let dir = tempfile::tempdir().unwrap();
    let item = WorkItem::ActivityCompleted {
        instance: "i1".into(),
        id: 1,
        result: "r".into(),
    };
    {
        let store = FsStore::new(dir.path(), true);
        store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
        let (_got, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        // Simulate a crash before ack: abandon via a fresh handle.
        let other = FsStore::new(dir.path(), false);
        other.abandon(QueueKind::Orchestrator, &token).await.unwrap();
    }
    let reopened = FsStore::new(dir.path(), false);
    let (got, token) = reopened.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(got, item);
    reopened.ack(QueueKind::Orchestrator, &token).await.unwrap();
}
