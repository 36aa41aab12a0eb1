//! Durable persistence contract for orchestration instances and work queues.
//!
//! The store is the only shared mutable resource in the system. Mutations for
//! a given instance are serialized (single writer per key); reads may run
//! concurrently and return a consistent snapshot. Work queues use peek-lock
//! delivery: a dequeued item stays invisible until acked, and an abandon puts
//! it back at the front for redelivery, giving at-least-once semantics.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Event;

pub mod fs;
pub mod in_memory;

/// Which queue a work item travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Completions routed back to orchestration instances.
    Orchestrator,
    /// Activity executions dispatched to workers.
    Worker,
}

/// Durable unit of work exchanged between the scheduler and its dispatchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Execute a scheduled activity for an instance.
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    /// An activity completed; deliver the result to the instance.
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    /// An activity failed; deliver the error to the instance.
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
}

/// Durable record of orchestration instances keyed by instance id.
///
/// `create_instance` is the uniqueness gate for single-instance semantics:
/// check-then-create must be atomic with respect to concurrent creates on the
/// same id. `append` is idempotent for completion-like and terminal events so
/// redelivered completions never corrupt history.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Atomically create a new instance (execution #1, empty history).
    /// Fails if the instance already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;

    /// Remove an instance and all of its executions.
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;

    /// Consistent snapshot of the latest execution's history.
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Append events to the latest execution. Serialized per instance;
    /// duplicate completions for an already-recorded id are dropped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;

    /// All known instance ids.
    async fn list_instances(&self) -> Vec<String>;

    /// Highest execution id for the instance, `None` when unknown.
    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    /// Snapshot of one specific execution's history.
    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;

    /// Start a fresh execution (ContinueAsNew or restart of a terminal
    /// instance), seeded with an `OrchestrationStarted` event. Returns the
    /// new execution id. Prior executions stay immutable.
    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<u64, String>;

    /// Durably enqueue a work item. Idempotent: an identical pending item is
    /// not enqueued twice.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;

    /// Pop the next item under a peek-lock. The item is invisible until
    /// `ack` (done) or `abandon` (redeliver) is called with the token.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Complete a peek-locked item.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Return a peek-locked item to the front of its queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Drop all stored data.
    async fn reset(&self);

    /// Human-readable dump of every stored history, for diagnostics.
    async fn dump_all_pretty(&self) -> String;
}

/// Idempotency key for completion-like events: duplicates of these are
/// silently dropped on append. Schedule events always append.
fn dedup_key(ev: &Event) -> Option<(u64, &'static str)> {
    match ev {
        Event::ActivityCompleted { id, .. } => Some((*id, "ac")),
        Event::ActivityFailed { id, .. } => Some((*id, "af")),
        // Synthetic id 0 slots dedupe terminal events to at most one each.
        Event::OrchestrationCompleted { .. } => Some((0, "oc")),
        Event::OrchestrationFailed { .. } => Some((0, "of")),
        Event::OrchestrationContinuedAsNew { .. } => Some((0, "ocan")),
        _ => None,
    }
}

/// Filter `new_events` down to the ones `existing` does not already contain,
/// per the completion idempotency rule. Shared by store implementations.
pub(crate) fn filter_new_events(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut seen: std::collections::HashSet<(u64, &'static str)> =
        existing.iter().filter_map(dedup_key).collect();
    let mut out = Vec::with_capacity(new_events.len());
    for ev in new_events {
        match dedup_key(&ev) {
            Some(key) => {
                if seen.insert(key) {
                    out.push(ev);
                }
            }
            None => out.push(ev),
        }
    }
    out
}
