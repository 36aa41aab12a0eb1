//! Minimal self-hosted durable orchestration core.
//!
//! This crate records append-only `Event`s per orchestration instance and
//! replays them to make orchestration logic deterministic across
//! suspensions and process restarts. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn` / `run_turn_with`
//! - An `OrchestrationContext` with futures to schedule activities and
//!   fan out / fan in over them using correlation ids
//! - A `Runtime` that persists history via an `InstanceStore`, dispatches
//!   activities, and exposes start/status/wait operations
//! - An axum HTTP gateway over start and status
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod futures;
pub mod gateway;
pub mod hello;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use crate::futures::{ActivityFuture, JoinFuture};
pub use crate::logging::LogLevel;
pub use runtime::{
    ActivityContext, ActivityExecutor, OrchestrationHandler, OrchestrationRegistry,
    OrchestrationRegistryBuilder, OrchestrationStatus, StartError, WaitError,
};

use serde::{Deserialize, Serialize};

use crate::_typed_codec::Codec;

// Internal codec utilities for typed I/O (kept private; public API stays string-based)
mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // If the value is a JSON string, return the raw content so string
            // payloads round-trip unquoted through history.
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat a raw string as a JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by an `InstanceStore`
/// and consumed during replay. Activity variants carry a correlation id that
/// pairs a schedule with its completion; ids allocate in call order, so the
/// Nth activity call of a deterministic orchestrator always carries id N.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Orchestration instance was created and started by name with input.
    OrchestrationStarted { name: String, input: String },
    /// Activity was scheduled with a unique correlation id and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string.
    ActivityFailed { id: u64, error: String },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String },
    /// Orchestration continued as new with fresh input (terminal for this execution).
    OrchestrationContinuedAsNew { input: String },
}

impl Event {
    /// True for events that terminate an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationContinuedAsNew { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The scheduler is
/// responsible for materializing these into dispatched work and, eventually,
/// corresponding completion `Event`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Continue the current orchestration as a new execution with new input.
    ContinueAsNew { input: String },
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,

    // Next correlation id; seeded past the max id in history so new schedules
    // never collide with recorded ones.
    next_correlation_id: u64,

    // Schedule events already adopted by a future during this poll. Replay
    // consumes schedule events strictly in history order; a claim that does
    // not match the orchestrator's next call is nondeterminism.
    claimed_schedule_ids: std::collections::HashSet<u64>,
    nondeterminism: Option<String>,

    // Turn metadata and per-turn buffered logs
    turn_index: u64,
    logging_enabled_this_poll: bool,
    log_buffer: Vec<(LogLevel, String)>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let mut max_id = 0u64;
        for ev in &history {
            match ev {
                Event::ActivityScheduled { id, .. }
                | Event::ActivityCompleted { id, .. }
                | Event::ActivityFailed { id, .. } => max_id = max_id.max(*id),
                _ => {}
            }
        }
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            claimed_schedule_ids: Default::default(),
            nondeterminism: None,
            turn_index: 0,
            logging_enabled_this_poll: false,
            log_buffer: Vec::new(),
        }
    }

    fn record_action(&mut self, a: Action) {
        // Recording a new decision means this poll is making progress
        self.logging_enabled_this_poll = true;
        self.actions.push(a);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    fn take_nondeterminism(&self) -> Option<String> {
        self.inner.lock().unwrap().nondeterminism.take()
    }

    /// The zero-based turn counter assigned by the scheduler for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    /// Indicates whether logging is enabled for the current poll. Flipped on
    /// when a decision is recorded so replayed turns stay silent.
    pub fn is_logging_enabled(&self) -> bool {
        self.inner.lock().unwrap().logging_enabled_this_poll
    }
    /// Drain the buffered log messages accumulated during the last turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.inner.lock().unwrap().log_buffer)
    }
    /// Buffer a structured log message for the current turn.
    pub fn push_log(&self, level: LogLevel, msg: impl Into<String>) {
        self.inner.lock().unwrap().log_buffer.push((level, msg.into()));
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.push_log(LogLevel::Info, message);
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.push_log(LogLevel::Warn, message);
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.push_log(LogLevel::Error, message);
    }

    /// Schedule an activity and return a future correlated to it. The call
    /// is matched against history by position: the next unclaimed
    /// `ActivityScheduled` event must agree on name and input, otherwise the
    /// turn is poisoned as nondeterministic.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> ActivityFuture {
        ActivityFuture::new(self.clone(), name.into(), input.into())
    }

    /// Typed helper that serializes the input; pair with
    /// [`ActivityFuture::into_typed`] for decoding the output.
    pub fn schedule_activity_typed<In: serde::Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> ActivityFuture {
        let payload = crate::_typed_codec::Json::encode(input).expect("encode");
        self.schedule_activity(name, payload)
    }

    /// Fan-in barrier over N activity futures: schedules all of them within
    /// one replay pass and resolves only when every completion is present,
    /// yielding results in schedule order regardless of completion order.
    pub fn join(&self, futures: Vec<ActivityFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// Request that the current execution terminate and restart with new input.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.record_action(Action::ContinueAsNew { input: input.into() });
    }

    /// Typed variant of [`Self::continue_as_new`].
    pub fn continue_as_new_typed<In: serde::Serialize>(&self, input: &In) {
        let payload = crate::_typed_codec::Json::encode(input).expect("encode");
        self.continue_as_new(payload);
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    let mut pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.as_mut().poll(&mut cx)
}

/// Tuple returned by `run_turn` and `run_turn_with`: updated history, actions
/// to execute, per-turn logs, an optional output, and an optional
/// nondeterminism error detected while matching calls against history.
pub type TurnResult<O> = (
    Vec<Event>,
    Vec<Action>,
    Vec<(LogLevel, String)>,
    Option<O>,
    Option<String>,
);

/// Poll the orchestrator once against the provided history. Every suspension
/// point consults the history: recorded completions resolve immediately, a
/// schedule without completion leaves the future pending, and a call with no
/// recorded event appends a fresh schedule event plus a matching `Action`.
pub fn run_turn<O, F>(
    history: Vec<Event>,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a caller-supplied turn
/// index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let mut fut = orchestrator(ctx.clone());
    match poll_once(&mut fut) {
        Poll::Ready(out) => {
            ctx.inner.lock().unwrap().logging_enabled_this_poll = true;
            let logs = ctx.take_log_buffer();
            let actions = ctx.take_actions();
            let nondet = ctx.take_nondeterminism();
            let hist_after = ctx.inner.lock().unwrap().history.clone();
            (hist_after, actions, logs, Some(out), nondet)
        }
        Poll::Pending => {
            let actions = ctx.take_actions();
            let nondet = ctx.take_nondeterminism();
            let hist_after = ctx.inner.lock().unwrap().history.clone();
            let logs = if ctx.is_logging_enabled() {
                ctx.take_log_buffer()
            } else {
                // Pure replay turn: drop buffered logs so resumed instances
                // do not re-emit messages from already-logged turns.
                let _ = ctx.take_log_buffer();
                Vec::new()
            };
            (hist_after, actions, logs, None, nondet)
        }
    }
}
