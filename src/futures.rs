//! Activity futures driven purely by recorded history.
//!
//! Polling never performs I/O: a future first claims the next unclaimed
//! `ActivityScheduled` event in history order (or appends a fresh one plus a
//! `CallActivity` action on first execution), then resolves iff a completion
//! for its correlation id is recorded. Anything else leaves it pending, which
//! suspends the orchestrator body cooperatively.
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

/// A single scheduled activity call, correlated to history by id.
pub struct ActivityFuture {
    name: String,
    input: String,
    claimed_id: Cell<Option<u64>>,
    ctx: OrchestrationContext,
}

impl ActivityFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self {
            name,
            input,
            claimed_id: Cell::new(None),
            ctx,
        }
    }

    /// Decode the activity result to a typed value once awaited.
    pub fn into_typed<Out: serde::de::DeserializeOwned>(
        self,
    ) -> impl Future<Output = Result<Out, String>> {
        use crate::_typed_codec::{Codec, Json};
        async move {
            let s = self.await?;
            Json::decode::<Out>(&s)
        }
    }

    /// Claim the schedule event for this call, appending a new one on first
    /// execution. Returns `None` when the claim detects nondeterminism.
    fn claim(&self) -> Option<u64> {
        if let Some(id) = self.claimed_id.get() {
            return Some(id);
        }
        let mut inner = self.ctx.inner.lock().unwrap();
        // Next unclaimed schedule event in history order must be ours.
        let next_scheduled = inner.history.iter().find_map(|e| match e {
            Event::ActivityScheduled { id, name, input }
                if !inner.claimed_schedule_ids.contains(id) =>
            {
                Some((*id, name.clone(), input.clone()))
            }
            _ => None,
        });
        let id = match next_scheduled {
            Some((id, name, input)) => {
                if name != self.name || input != self.input {
                    inner.nondeterminism = Some(format!(
                        "nondeterministic: schedule order mismatch: history has \
                         ActivityScheduled('{name}','{input}') but orchestrator called \
                         ActivityScheduled('{}','{}')",
                        self.name, self.input
                    ));
                    return None;
                }
                id
            }
            None => {
                // First time this call is reached: record schedule + decision.
                let id = inner.next_id();
                inner.history.push(Event::ActivityScheduled {
                    id,
                    name: self.name.clone(),
                    input: self.input.clone(),
                });
                inner.record_action(Action::CallActivity {
                    id,
                    name: self.name.clone(),
                    input: self.input.clone(),
                });
                id
            }
        };
        inner.claimed_schedule_ids.insert(id);
        self.claimed_id.set(Some(id));
        Some(id)
    }

    fn find_completion(&self, id: u64) -> Option<Result<String, String>> {
        let inner = self.ctx.inner.lock().unwrap();
        inner.history.iter().find_map(|e| match e {
            Event::ActivityCompleted { id: cid, result } if *cid == id => {
                Some(Ok(result.clone()))
            }
            Event::ActivityFailed { id: cid, error } if *cid == id => Some(Err(error.clone())),
            _ => None,
        })
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = match this.claim() {
            Some(id) => id,
            None => return Poll::Pending,
        };
        match this.find_completion(id) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Barrier over N activity futures. Every child is polled on every pass, so
/// all N schedule events (ids in input order) land in a single replay turn;
/// the join resolves only once every child has a recorded completion, and the
/// output order is the schedule order, never the completion order.
pub struct JoinFuture {
    children: Vec<ActivityFuture>,
    results: Vec<Option<Result<String, String>>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<ActivityFuture>) -> Self {
        let n = children.len();
        Self {
            children,
            results: vec![None; n],
        }
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, String>>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;
        for (i, child) in this.children.iter_mut().enumerate() {
            if this.results[i].is_some() {
                continue;
            }
            match Pin::new(child).poll(cx) {
                Poll::Ready(out) => this.results[i] = Some(out),
                Poll::Pending => all_done = false,
            }
        }
        if all_done {
            Poll::Ready(this.results.iter_mut().map(|r| r.take().unwrap()).collect())
        } else {
            Poll::Pending
        }
    }
}
