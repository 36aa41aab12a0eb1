//! Fan-out/fan-in behavior under the full runtime: completion order must not
//! leak into outputs, and each scheduled activity executes exactly once.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minidur::providers::in_memory::InMemoryStore;
use minidur::providers::InstanceStore;
use minidur::runtime::{ActivityRegistry, OrchestrationRegistry, Runtime};
use minidur::{Event, OrchestrationStatus};

#[tokio::test]
async fn fan_in_order_is_schedule_order_not_completion_order() {
    // Earlier inputs sleep longer, so completions arrive in reverse.
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Sleepy", |_ctx, input: String| async move {
                let delay = match input.as_str() {
                    "a" => 90,
                    "b" => 45,
                    _ => 5,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(format!("r-{input}"))
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("Fan", |ctx, _input| async move {
            let calls = vec![
                ctx.schedule_activity("Sleepy", "a"),
                ctx.schedule_activity("Sleepy", "b"),
                ctx.schedule_activity("Sleepy", "c"),
            ];
            let results = ctx.join(calls).await;
            let mut parts = Vec::new();
            for r in results {
                parts.push(r?);
            }
            Ok(parts.join(","))
        })
        .build();

    let rt = Runtime::start(activities, orchestrations).await;
    rt.start_orchestration("fan-1", "Fan", "").await.unwrap();
    let status = rt
        .wait_for_orchestration("fan-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "r-a,r-b,r-c".to_string()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn each_scheduled_activity_executes_exactly_once() {
    let counts: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let counts_for_activity = counts.clone();
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Count", move |_ctx, input: String| {
                let counts = counts_for_activity.clone();
                async move {
                    *counts.lock().unwrap().entry(input.clone()).or_insert(0) += 1;
                    Ok(input)
                }
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("Fan", |ctx, _input| async move {
            let calls = (0..5)
                .map(|i| ctx.schedule_activity("Count", i.to_string()))
                .collect();
            let results = ctx.join(calls).await;
            let mut parts = Vec::new();
            for r in results {
                parts.push(r?);
            }
            Ok(parts.join(","))
        })
        .build();

    let rt = Runtime::start(activities, orchestrations).await;
    rt.start_orchestration("fan-once", "Fan", "").await.unwrap();
    let status = rt
        .wait_for_orchestration("fan-once", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "0,1,2,3,4".to_string()
        }
    );
    let counts = counts.lock().unwrap();
    for i in 0..5 {
        assert_eq!(counts.get(&i.to_string()), Some(&1), "input {i} re-executed");
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn one_failed_branch_fails_the_whole_fan_in() {
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Picky", |_ctx, input: String| async move {
                if input == "bad" {
                    Err("refused".to_string())
                } else {
                    Ok(input)
                }
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("Fan", |ctx, _input| async move {
            let calls = vec![
                ctx.schedule_activity("Picky", "ok"),
                ctx.schedule_activity("Picky", "bad"),
            ];
            let results = ctx.join(calls).await;
            let mut parts = Vec::new();
            for r in results {
                parts.push(r?);
            }
            Ok(parts.join(","))
        })
        .build();

    let rt = Runtime::start(activities, orchestrations).await;
    rt.start_orchestration("fan-fail", "Fan", "").await.unwrap();
    let status = rt
        .wait_for_orchestration("fan-fail", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Failed {
            error: "refused".to_string()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn stray_and_duplicate_completions_leave_history_intact() {
    let store = Arc::new(InMemoryStore::new());
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Slowish", |_ctx, input: String| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(input)
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("One", |ctx, _input| async move {
            ctx.schedule_activity("Slowish", "real").await
        })
        .build();

    let rt = Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    rt.start_orchestration("stray-1", "One", "").await.unwrap();

    // Completion for a sequence number that was never scheduled.
    tokio::time::sleep(Duration::from_millis(30)).await;
    rt.raise_activity_completion("stray-1", 99, Ok("stray".into()))
        .await
        .unwrap();

    let status = rt
        .wait_for_orchestration("stray-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "real".to_string()
        }
    );

    // Late duplicate for the already-recorded id is dropped idempotently.
    rt.raise_activity_completion("stray-1", 1, Ok("late".into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let hist = store.read("stray-1").await;
    let completions: Vec<&Event> = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(hist.contains(&Event::ActivityCompleted { id: 1, result: "real".into() }));
    assert!(!hist.iter().any(|e| matches!(e, Event::ActivityCompleted { id: 99, .. })));
    rt.shutdown().await;
}
