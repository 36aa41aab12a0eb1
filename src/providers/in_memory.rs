//! In-memory store, the default for tests and single-process runs.
//!
//! Per-instance state sits behind its own lock so history mutations are
//! serialized per key without a store-wide writer lock; the outer map lock is
//! only held to resolve or create entries.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{filter_new_events, InstanceStore, QueueKind, WorkItem};
use crate::Event;

// Executions are 1-based: executions[0] is execution id 1.
type Executions = Vec<Vec<Event>>;

#[derive(Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    locked: HashMap<String, WorkItem>,
    next_token: u64,
}

#[derive(Default)]
pub struct InMemoryStore {
    instances: RwLock<HashMap<String, Arc<Mutex<Executions>>>>,
    orchestrator_queue: Mutex<QueueState>,
    worker_queue: Mutex<QueueState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn instance_entry(&self, instance: &str) -> Option<Arc<Mutex<Executions>>> {
        self.instances.read().await.get(instance).cloned()
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<QueueState> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_queue,
            QueueKind::Worker => &self.worker_queue,
        }
    }
}

#[async_trait]
impl InstanceStore for InMemoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut map = self.instances.write().await;
        if map.contains_key(instance) {
            return Err(format!("instance already exists: {instance}"));
        }
        map.insert(instance.to_string(), Arc::new(Mutex::new(vec![Vec::new()])));
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let mut map = self.instances.write().await;
        match map.remove(instance) {
            Some(_) => Ok(()),
            None => Err(format!("instance not found: {instance}")),
        }
    }

    async fn read(&self, instance: &str) -> Vec<Event> {
        match self.instance_entry(instance).await {
            Some(entry) => entry.lock().await.last().cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let entry = self
            .instance_entry(instance)
            .await
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        let mut execs = entry.lock().await;
        let latest = execs
            .last_mut()
            .ok_or_else(|| format!("instance has no execution: {instance}"))?;
        let accepted = filter_new_events(latest, new_events);
        latest.extend(accepted);
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let entry = self.instance_entry(instance).await?;
        let n = entry.lock().await.len() as u64;
        if n == 0 {
            None
        } else {
            Some(n)
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        match self.instance_entry(instance).await {
            Some(entry) => entry
                .lock()
                .await
                .get(execution_id.saturating_sub(1) as usize)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<u64, String> {
        let entry = self
            .instance_entry(instance)
            .await
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        let mut execs = entry.lock().await;
        execs.push(vec![Event::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
        }]);
        Ok(execs.len() as u64)
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut q = self.queue(kind).lock().await;
        // Idempotent: identical pending or in-flight items are not doubled.
        if q.items.contains(&item) || q.locked.values().any(|it| it == &item) {
            return Ok(());
        }
        q.items.push_back(item);
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut q = self.queue(kind).lock().await;
        let item = q.items.pop_front()?;
        q.next_token += 1;
        let token = format!("t{}", q.next_token);
        q.locked.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut q = self.queue(kind).lock().await;
        q.locked.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut q = self.queue(kind).lock().await;
        if let Some(item) = q.locked.remove(token) {
            q.items.push_front(item);
        }
        Ok(())
    }

    async fn reset(&self) {
        self.instances.write().await.clear();
        for kind in [QueueKind::Orchestrator, QueueKind::Worker] {
            let mut q = self.queue(kind).lock().await;
            q.items.clear();
            q.locked.clear();
        }
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        let map = self.instances.read().await;
        for (inst, entry) in map.iter() {
            out.push_str(&format!("instance={inst}\n"));
            let execs = entry.lock().await;
            for (i, hist) in execs.iter().enumerate() {
                for ev in hist {
                    out.push_str(&format!("  exec#{} {ev:#?}\n", i + 1));
                }
            }
        }
        out
    }
}
