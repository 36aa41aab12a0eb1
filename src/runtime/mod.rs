//! In-process scheduler: drives orchestration instances through replay turns,
//! checkpoints scheduled work, dispatches activities, and routes completions.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::providers::in_memory::InMemoryStore;
use crate::providers::{InstanceStore, QueueKind, WorkItem};
use crate::runtime::replay::{DefaultReplayEngine, ReplayEngine};
use crate::{Action, Event, OrchestrationContext};

pub mod registry;
pub mod replay;

pub use registry::{
    ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry,
    OrchestrationRegistryBuilder,
};

/// High-level orchestration status derived from the latest execution's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Instance record exists but no start event has been appended yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    /// Latest execution ended with ContinueAsNew and has not rolled over yet.
    ContinuedAsNew,
}

impl OrchestrationStatus {
    /// Statuses that make a same-id start a conflict.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Pending
                | OrchestrationStatus::Running
                | OrchestrationStatus::ContinuedAsNew
        )
    }

    /// Wire name used by the HTTP gateway.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::NotFound => "NotFound",
            OrchestrationStatus::Pending => "Pending",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed { .. } => "Completed",
            OrchestrationStatus::Failed { .. } => "Failed",
            OrchestrationStatus::ContinuedAsNew => "ContinuedAsNew",
        }
    }
}

/// Error returned by `start_orchestration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// An instance with this id is already Pending/Running/ContinuedAsNew.
    Conflict { instance: String },
    /// The store rejected the operation.
    Store(String),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Conflict { instance } => {
                write!(f, "an orchestration with id '{instance}' is already running")
            }
            StartError::Store(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for StartError {}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Identity handed to an activity invocation.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Id of the orchestration instance this activity runs for.
    pub instance: String,
}

/// Runs a single named unit of work. Stateless per invocation; failures in
/// the activity body (including panics) are captured as errors, never
/// propagated into the scheduler.
#[derive(Clone)]
pub struct ActivityExecutor {
    registry: Arc<ActivityRegistry>,
}

impl ActivityExecutor {
    pub fn new(registry: Arc<ActivityRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, name: &str, input: String, instance: &str) -> Result<String, String> {
        let handler = match self.registry.get(name) {
            Some(h) => h,
            None => return Err(format!("unregistered:{name}")),
        };
        let ctx = ActivityContext {
            instance: instance.to_string(),
        };
        // Contain panicking activity bodies inside their own task.
        let join = tokio::spawn(async move { handler.invoke(ctx, input).await });
        match join.await {
            Ok(res) => res,
            Err(e) => Err(format!("activity panicked: {e}")),
        }
    }
}

/// Completion delivered to an instance worker's inbox.
#[derive(Debug)]
struct Completion {
    id: u64,
    outcome: Result<String, String>,
    ack_token: Option<String>,
}

/// In-process runtime that executes activities and persists history via an
/// `InstanceStore`. One logical worker per active instance (single writer);
/// activities run concurrently across instances and within a fan-out.
pub struct Runtime {
    store: Arc<dyn InstanceStore>,
    executor: ActivityExecutor,
    orchestrations: OrchestrationRegistry,
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<Completion>>>,
    active_instances: Mutex<HashSet<String>>,
    // Serializes the check-then-create/restart decision across concurrent starts.
    start_gate: Mutex<()>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const ENQUEUE_RETRY_LIMIT: u32 = 5;
    const ENQUEUE_RETRY_BACKOFF_MS: u64 = 20;
    const WAIT_BACKOFF_START_MS: u64 = 5;
    const WAIT_BACKOFF_CAP_MS: u64 = 100;

    /// Start a new runtime using the in-memory store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let store: Arc<dyn InstanceStore> = Arc::new(InMemoryStore::new());
        Self::start_with_store(store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `InstanceStore` implementation.
    pub async fn start_with_store(
        store: Arc<dyn InstanceStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let runtime = Arc::new(Self {
            store,
            executor: ActivityExecutor::new(activity_registry),
            orchestrations: orchestration_registry,
            inboxes: Mutex::new(HashMap::new()),
            active_instances: Mutex::new(HashSet::new()),
            start_gate: Mutex::new(()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
        });

        let orch_handle = runtime.clone().start_orchestrator_dispatcher();
        let work_handle = runtime.clone().start_worker_dispatcher();
        let mut joins = runtime.joins.lock().await;
        joins.push(orch_handle);
        joins.push(work_handle);
        drop(joins);

        runtime
    }

    /// Start an orchestration under the given instance id. Fails with
    /// `StartError::Conflict` while an instance with that id is active; a
    /// terminal instance is restarted as a fresh execution (prior history
    /// stays queryable).
    pub async fn start_orchestration(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<String, StartError> {
        let input: String = input.into();
        let _gate = self.start_gate.lock().await;
        match self.store.create_instance(instance).await {
            Ok(()) => {
                self.store
                    .append(
                        instance,
                        vec![Event::OrchestrationStarted {
                            name: orchestration_name.to_string(),
                            input,
                        }],
                    )
                    .await
                    .map_err(StartError::Store)?;
            }
            Err(_exists) => {
                let status = self.get_orchestration_status(instance).await;
                if status.is_active() {
                    debug!(instance, "start rejected: instance already active");
                    return Err(StartError::Conflict {
                        instance: instance.to_string(),
                    });
                }
                // Terminal instance: roll into a fresh execution.
                self.store
                    .create_new_execution(instance, orchestration_name, &input)
                    .await
                    .map_err(StartError::Store)?;
            }
        }
        info!(instance, orchestration = orchestration_name, "orchestration started");
        self.ensure_instance_active(instance).await;
        Ok(instance.to_string())
    }

    /// Start an orchestration under a freshly generated instance id.
    pub async fn start_orchestration_generated(
        self: &Arc<Self>,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<String, StartError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration(&instance, orchestration_name, input).await
    }

    /// Deliver an activity completion (or failure) for a scheduled sequence
    /// number. Duplicate or unknown completions are ignored idempotently once
    /// they reach the instance history.
    pub async fn raise_activity_completion(
        &self,
        instance: &str,
        id: u64,
        outcome: Result<String, String>,
    ) -> Result<(), String> {
        let item = match outcome {
            Ok(result) => WorkItem::ActivityCompleted {
                instance: instance.to_string(),
                id,
                result,
            },
            Err(error) => WorkItem::ActivityFailed {
                instance: instance.to_string(),
                id,
                error,
            },
        };
        self.store.enqueue_work(QueueKind::Orchestrator, item).await
    }

    /// Derive the current status from the latest execution's history.
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        if self.store.latest_execution_id(instance).await.is_none() {
            return OrchestrationStatus::NotFound;
        }
        let history = self.store.read(instance).await;
        if history.is_empty() {
            return OrchestrationStatus::Pending;
        }
        match history.iter().rev().find(|e| e.is_terminal()) {
            Some(Event::OrchestrationCompleted { output }) => OrchestrationStatus::Completed {
                output: output.clone(),
            },
            Some(Event::OrchestrationFailed { error }) => OrchestrationStatus::Failed {
                error: error.clone(),
            },
            Some(Event::OrchestrationContinuedAsNew { .. }) => OrchestrationStatus::ContinuedAsNew,
            _ => OrchestrationStatus::Running,
        }
    }

    /// Wait until the orchestration reaches a terminal state or the deadline
    /// elapses. Polls with exponential backoff; never unbounded.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut delay_ms = Self::WAIT_BACKOFF_START_MS;
        loop {
            match self.get_orchestration_status(instance).await {
                OrchestrationStatus::Completed { output } => {
                    return Ok(OrchestrationStatus::Completed { output })
                }
                OrchestrationStatus::Failed { error } => {
                    return Ok(OrchestrationStatus::Failed { error })
                }
                _ => {}
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(Self::WAIT_BACKOFF_CAP_MS);
        }
    }

    /// Typed variant: `Ok(Ok(v))` on Completed with decoded output,
    /// `Ok(Err(e))` on Failed.
    pub async fn wait_for_orchestration_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        use crate::_typed_codec::Codec;
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => {
                match crate::_typed_codec::Json::decode::<Out>(&output) {
                    Ok(v) => Ok(Ok(v)),
                    Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
                }
            }
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            _ => unreachable!("wait_for_orchestration returns only terminal or timeout"),
        }
    }

    /// Abort background dispatchers. Instance workers finish on channel close.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    /// Await completion of all outstanding instance workers.
    pub async fn drain_instances(self: Arc<Self>) {
        let mut joins = self.instance_joins.lock().await;
        while let Some(j) = joins.pop() {
            let _ = j.await;
        }
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str) {
        if !self.active_instances.lock().await.insert(instance.to_string()) {
            return;
        }
        let rt = self.clone();
        let inst = instance.to_string();
        let handle = tokio::spawn(async move {
            rt.run_instance_to_completion(&inst).await;
        });
        self.instance_joins.lock().await.push(handle);
    }

    /// Routes completion work items to active instance inboxes, rehydrating
    /// instances that are not resident (e.g. after a process restart).
    fn start_orchestrator_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    Some((item, token)) => {
                        let (instance, id, outcome) = match item {
                            WorkItem::ActivityCompleted { instance, id, result } => {
                                (instance, id, Ok(result))
                            }
                            WorkItem::ActivityFailed { instance, id, error } => {
                                (instance, id, Err(error))
                            }
                            other => {
                                error!(?other, "unexpected work item on orchestrator queue");
                                let _ = self.store.ack(QueueKind::Orchestrator, &token).await;
                                continue;
                            }
                        };
                        self.deliver_or_rehydrate(&instance, id, outcome, token).await;
                    }
                    None => {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            Self::POLLER_IDLE_SLEEP_MS,
                        ))
                        .await;
                    }
                }
            }
        })
    }

    async fn deliver_or_rehydrate(
        self: &Arc<Self>,
        instance: &str,
        id: u64,
        outcome: Result<String, String>,
        token: String,
    ) {
        // Late completion for a terminal or unknown instance: drop idempotently.
        let status = self.get_orchestration_status(instance).await;
        match status {
            OrchestrationStatus::NotFound
            | OrchestrationStatus::Completed { .. }
            | OrchestrationStatus::Failed { .. } => {
                debug!(instance, id, "dropping completion for non-running instance");
                let _ = self.store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
            _ => {}
        }

        let sent = {
            let inboxes = self.inboxes.lock().await;
            match inboxes.get(instance) {
                Some(tx) => tx
                    .send(Completion {
                        id,
                        outcome: outcome.clone(),
                        ack_token: Some(token.clone()),
                    })
                    .is_ok(),
                None => false,
            }
        };
        if !sent {
            // Not resident: reactivate the worker and put the item back.
            self.ensure_instance_active(instance).await;
            let _ = self.store.abandon(QueueKind::Orchestrator, &token).await;
            tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
        }
    }

    /// Executes activities from the worker queue. Each item runs in its own
    /// task so a fan-out proceeds concurrently; an item already completed in
    /// history is acked without re-execution (dedup after redelivery).
    fn start_worker_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.store.dequeue_peek_lock(QueueKind::Worker).await {
                    Some((item, token)) => match item {
                        WorkItem::ActivityExecute {
                            instance,
                            id,
                            name,
                            input,
                        } => {
                            let rt = self.clone();
                            tokio::spawn(async move {
                                rt.execute_activity_item(instance, id, name, input, token).await;
                            });
                        }
                        other => {
                            error!(?other, "unexpected work item on worker queue");
                            let _ = self.store.ack(QueueKind::Worker, &token).await;
                        }
                    },
                    None => {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            Self::POLLER_IDLE_SLEEP_MS,
                        ))
                        .await;
                    }
                }
            }
        })
    }

    async fn execute_activity_item(
        self: Arc<Self>,
        instance: String,
        id: u64,
        name: String,
        input: String,
        token: String,
    ) {
        let history = self.store.read(&instance).await;
        let already_completed = history.iter().any(|e| {
            matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id)
        });
        if already_completed {
            debug!(instance, id, activity = %name, "skipping redelivered activity, completion recorded");
            let _ = self.store.ack(QueueKind::Worker, &token).await;
            return;
        }

        debug!(instance, id, activity = %name, "executing activity");
        let outcome = self.executor.execute(&name, input, &instance).await;
        let completion = match outcome {
            Ok(result) => WorkItem::ActivityCompleted {
                instance: instance.clone(),
                id,
                result,
            },
            Err(error) => {
                warn!(instance, id, activity = %name, error = %error, "activity failed");
                WorkItem::ActivityFailed {
                    instance: instance.clone(),
                    id,
                    error,
                }
            }
        };

        // The completion must be durably enqueued before the execute item is
        // acked, otherwise a crash here would lose the result. Transient
        // enqueue failures are retried with backoff; after that the item is
        // abandoned for redelivery.
        let mut attempt = 0u32;
        loop {
            match self
                .store
                .enqueue_work(QueueKind::Orchestrator, completion.clone())
                .await
            {
                Ok(()) => {
                    let _ = self.store.ack(QueueKind::Worker, &token).await;
                    return;
                }
                Err(e) if attempt < Self::ENQUEUE_RETRY_LIMIT => {
                    attempt += 1;
                    warn!(instance, id, attempt, error = %e, "completion enqueue failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        Self::ENQUEUE_RETRY_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => {
                    error!(instance, id, error = %e, "completion enqueue failed; abandoning for redelivery");
                    let _ = self.store.abandon(QueueKind::Worker, &token).await;
                    return;
                }
            }
        }
    }

    /// Single-writer worker for one instance: replay a turn, checkpoint new
    /// schedule events, dispatch activity calls, absorb completions, repeat
    /// until the orchestrator body returns. ContinueAsNew rolls the instance
    /// into a fresh execution and keeps going.
    async fn run_instance_to_completion(self: Arc<Self>, instance: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        self.inboxes.lock().await.insert(instance.to_string(), tx);

        'executions: loop {
            let mut history = self.store.read(instance).await;
            // The new execution's input is re-read from its OrchestrationStarted
            // event on rollover, so this derivation covers ContinueAsNew too.
            let (orchestration_name, current_input) = match history.iter().rev().find_map(|e| {
                match e {
                    Event::OrchestrationStarted { name, input } => {
                        Some((name.clone(), input.clone()))
                    }
                    _ => None,
                }
            }) {
                Some(pair) => pair,
                None => {
                    error!(instance, "no OrchestrationStarted in history; cannot run");
                    break 'executions;
                }
            };

            let handler = match self.orchestrations.get(&orchestration_name) {
                Some(h) => h,
                None => {
                    let err = format!("unregistered:{orchestration_name}");
                    warn!(instance, orchestration = %orchestration_name, "orchestration not registered");
                    let _ = self
                        .store
                        .append(instance, vec![Event::OrchestrationFailed { error: err }])
                        .await;
                    break 'executions;
                }
            };

            // Rehydrate: re-enqueue scheduled activities with no completion
            // (idempotent; covers work lost before a restart).
            for e in &history {
                if let Event::ActivityScheduled { id, name, input } = e {
                    let done = history.iter().any(|c| {
                        matches!(c, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if cid == id)
                    });
                    if !done {
                        let _ = self
                            .store
                            .enqueue_work(
                                QueueKind::Worker,
                                WorkItem::ActivityExecute {
                                    instance: instance.to_string(),
                                    id: *id,
                                    name: name.clone(),
                                    input: input.clone(),
                                },
                            )
                            .await;
                    }
                }
            }

            let engine = DefaultReplayEngine::new();
            let mut turn_index: u64 = 0;
            loop {
                let baseline_len = history.len();
                let (hist_after, decisions, logs, out_opt, nondet) = engine.replay(
                    history,
                    turn_index,
                    handler.clone(),
                    current_input.clone(),
                );
                history = hist_after;
                crate::logging::flush_turn_logs(instance, turn_index, logs);

                if let Some(err) = nondet {
                    error!(instance, error = %err, "replay detected nondeterminism");
                    if self
                        .store
                        .append(instance, vec![Event::OrchestrationFailed { error: err }])
                        .await
                        .is_err()
                    {
                        error!(instance, "failed to persist nondeterminism failure");
                    }
                    break 'executions;
                }

                // Durability checkpoint: new schedule events must be persisted
                // before any activity is handed to the executor.
                let mut persisted_len = baseline_len;
                if history.len() > persisted_len {
                    let deltas = history[persisted_len..].to_vec();
                    if let Err(e) = self.store.append(instance, deltas).await {
                        error!(instance, turn_index, error = %e, "failed to append scheduled events");
                        break 'executions;
                    }
                    persisted_len = history.len();
                }

                // ContinueAsNew is terminal for this execution.
                if let Some(new_input) = decisions.iter().find_map(|d| match d {
                    Action::ContinueAsNew { input } => Some(input.clone()),
                    _ => None,
                }) {
                    if let Err(e) = self
                        .store
                        .append(
                            instance,
                            vec![Event::OrchestrationContinuedAsNew {
                                input: new_input.clone(),
                            }],
                        )
                        .await
                    {
                        error!(instance, error = %e, "failed to append ContinuedAsNew");
                        break 'executions;
                    }
                    if let Err(e) = self
                        .store
                        .create_new_execution(instance, &orchestration_name, &new_input)
                        .await
                    {
                        error!(instance, error = %e, "failed to create new execution");
                        break 'executions;
                    }
                    info!(instance, orchestration = %orchestration_name, "continued as new");
                    continue 'executions;
                }

                if let Some(out) = out_opt {
                    let term = match &out {
                        Ok(output) => Event::OrchestrationCompleted {
                            output: output.clone(),
                        },
                        Err(error) => Event::OrchestrationFailed {
                            error: error.clone(),
                        },
                    };
                    if let Err(e) = self.store.append(instance, vec![term]).await {
                        error!(instance, turn_index, error = %e, "failed to append terminal event");
                    }
                    match &out {
                        Ok(_) => info!(instance, turn_index, "orchestration completed"),
                        Err(error) => warn!(instance, turn_index, error = %error, "orchestration failed"),
                    }
                    break 'executions;
                }

                // Hand new activity calls to the executor (at-least-once; the
                // enqueue is idempotent, the peek-lock keeps one in flight).
                for d in &decisions {
                    if let Action::CallActivity { id, name, input } = d {
                        let _ = self
                            .store
                            .enqueue_work(
                                QueueKind::Worker,
                                WorkItem::ActivityExecute {
                                    instance: instance.to_string(),
                                    id: *id,
                                    name: name.clone(),
                                    input: input.clone(),
                                },
                            )
                            .await;
                    }
                }

                // Suspended: wait for at least one completion, then drain
                // whatever else already arrived before replaying again.
                let first = match rx.recv().await {
                    Some(msg) => msg,
                    None => break 'executions,
                };
                let mut ack_after_persist: Vec<String> = Vec::new();
                let mut ack_immediate: Vec<String> = Vec::new();
                Self::absorb_completion(&mut history, first, &mut ack_after_persist, &mut ack_immediate);
                while let Ok(msg) = rx.try_recv() {
                    Self::absorb_completion(&mut history, msg, &mut ack_after_persist, &mut ack_immediate);
                }
                for t in ack_immediate {
                    let _ = self.store.ack(QueueKind::Orchestrator, &t).await;
                }
                if history.len() > persisted_len {
                    let deltas = history[persisted_len..].to_vec();
                    if let Err(e) = self.store.append(instance, deltas).await {
                        error!(instance, turn_index, error = %e, "failed to append completions");
                        break 'executions;
                    }
                }
                for t in ack_after_persist {
                    let _ = self.store.ack(QueueKind::Orchestrator, &t).await;
                }

                turn_index = turn_index.saturating_add(1);
            }
        }

        self.inboxes.lock().await.remove(instance);
        self.active_instances.lock().await.remove(instance);
    }

    /// Append a delivered completion to local history unless its sequence
    /// number is unknown or already completed (idempotent ignore).
    fn absorb_completion(
        history: &mut Vec<Event>,
        msg: Completion,
        ack_after_persist: &mut Vec<String>,
        ack_immediate: &mut Vec<String>,
    ) {
        let scheduled = history
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { id, .. } if *id == msg.id));
        let completed = history.iter().any(|e| {
            matches!(e, Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } if *id == msg.id)
        });
        if !scheduled || completed {
            debug!(id = msg.id, scheduled, completed, "ignoring duplicate or unmatched completion");
            if let Some(t) = msg.ack_token {
                ack_immediate.push(t);
            }
            return;
        }
        let event = match msg.outcome {
            Ok(result) => Event::ActivityCompleted { id: msg.id, result },
            Err(error) => Event::ActivityFailed { id: msg.id, error },
        };
        history.push(event);
        if let Some(t) = msg.ack_token {
            ack_after_persist.push(t);
        }
    }
}
