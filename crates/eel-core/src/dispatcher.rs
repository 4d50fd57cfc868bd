//! Outbound call bookkeeping: matches inbound Responses to the calls that
//! issued them.
//!
//! Every call id handed out by [`PendingCalls::reserve`] stays "in flight"
//! until its Response is consumed, either by the registered callback or by
//! a poller. Responses for ids that are not in flight (announcement acks,
//! late answers to timed-out polls, duplicates) are dropped, so each
//! Response reaches its caller at most once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::errors::{EelError, Result};
use crate::ids::CallId;
use crate::message::{Response, ADD_SERVER_FUNCTION};

/// Callback invoked with the eventual Response of a call.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send + 'static>;

#[derive(Default)]
struct PendingState {
    in_flight: HashSet<CallId>,
    callbacks: HashMap<CallId, ResponseCallback>,
    results: HashMap<CallId, Response>,
}

/// Pending-callback and pending-results maps behind a single lock.
#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<PendingState>,
    arrived: Notify,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a call id for `function` that is not already in flight.
    pub fn reserve(&self, function: &str) -> CallId {
        let mut state = self.state.lock();
        loop {
            let id = CallId::generate(function);
            if state.in_flight.insert(id.clone()) {
                return id;
            }
            warn!(call_id = %id, "call id collision, regenerating");
        }
    }

    /// Forget a call whose Command never made it onto the wire, or whose
    /// handle was dropped unclaimed.
    pub fn release(&self, id: &CallId) {
        let mut state = self.state.lock();
        let _ = state.in_flight.remove(id);
        let _ = state.callbacks.remove(id);
        let _ = state.results.remove(id);
    }

    /// Attach a callback to an in-flight call.
    ///
    /// If the Response already arrived the callback runs right away on the
    /// caller's stack.
    pub fn register_callback(&self, id: CallId, callback: ResponseCallback) {
        let response = {
            let mut state = self.state.lock();
            let Some(response) = state.results.remove(&id) else {
                let _ = state.callbacks.insert(id, callback);
                return;
            };
            let _ = state.in_flight.remove(&id);
            response
        };
        callback(response);
    }

    /// Route an inbound Response to its callback, or park it for a poller.
    pub fn on_response(&self, response: Response) {
        let mut state = self.state.lock();
        if !state.in_flight.contains(&response.id) {
            drop(state);
            if response.id.function() == ADD_SERVER_FUNCTION {
                trace!(call_id = %response.id, "discarding announcement ack");
            } else {
                warn!(call_id = %response.id, "response for unknown call, dropping");
            }
            return;
        }

        if let Some(callback) = state.callbacks.remove(&response.id) {
            let _ = state.in_flight.remove(&response.id);
            drop(state);
            debug!(call_id = %response.id, "invoking response callback");
            callback(response);
            return;
        }

        debug!(call_id = %response.id, "storing response for poller");
        let _ = state.results.insert(response.id.clone(), response);
        drop(state);
        self.arrived.notify_waiters();
    }

    /// Claim a parked Response, if it has arrived.
    pub fn take(&self, id: &CallId) -> Option<Response> {
        let mut state = self.state.lock();
        let response = state.results.remove(id)?;
        let _ = state.in_flight.remove(id);
        Some(response)
    }

    /// Poll for the Response to `id`, checking up to `attempts` times and
    /// waiting at most `interval` between checks.
    ///
    /// Wake-ups from [`on_response`](Self::on_response) trigger an early
    /// check. Only waits that run the full `interval` use up an attempt, so
    /// Responses for other calls never shorten the budget.
    pub async fn wait(&self, id: &CallId, attempts: u32, interval: Duration) -> Result<Response> {
        let mut expired = 0;
        while expired < attempts {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            if let Some(response) = self.take(id) {
                return Ok(response);
            }
            if tokio::time::timeout(interval, notified).await.is_err() {
                expired += 1;
            }
        }

        let mut state = self.state.lock();
        if let Some(response) = state.results.remove(id) {
            let _ = state.in_flight.remove(id);
            return Ok(response);
        }
        let _ = state.in_flight.remove(id);
        Err(EelError::CallTimeout {
            function: id.function().to_owned(),
            attempts,
        })
    }

    /// Number of calls still awaiting their Response.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Number of Responses parked for pollers.
    pub fn parked(&self) -> usize {
        self.state.lock().results.len()
    }
}

/// Handle to one outbound call.
///
/// Resolve it exactly one way: [`on_response`](Self::on_response) for the
/// callback style, [`wait`](Self::wait) / [`wait_response`](Self::wait_response)
/// for the polling style. Dropping it unresolved forgets the call.
pub struct PendingCall {
    id: CallId,
    function: String,
    pending: Arc<PendingCalls>,
    attempts: u32,
    interval: Duration,
    armed: bool,
}

impl PendingCall {
    pub(crate) fn new(
        id: CallId,
        function: String,
        pending: Arc<PendingCalls>,
        attempts: u32,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            function,
            pending,
            attempts,
            interval,
            armed: true,
        }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Deliver the Response to `callback` whenever it arrives. Returns
    /// immediately.
    pub fn on_response<F>(mut self, callback: F)
    where
        F: FnOnce(Response) + Send + 'static,
    {
        self.armed = false;
        self.pending
            .register_callback(self.id.clone(), Box::new(callback));
    }

    /// Poll for the raw Response.
    pub async fn wait_response(mut self) -> Result<Response> {
        let result = self
            .pending
            .wait(&self.id, self.attempts, self.interval)
            .await;
        self.armed = false;
        result
    }

    /// Poll for the result value. An error Response becomes
    /// [`EelError::Remote`].
    pub async fn wait(self) -> Result<Value> {
        let function = self.function.clone();
        let response = self.wait_response().await?;
        if response.error {
            return Err(EelError::Remote {
                function,
                message: response.error_message,
            });
        }
        Ok(response.value)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.armed {
            self.pending.release(&self.id);
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("function", &self.function)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TICK: Duration = Duration::from_millis(1);

    fn handle(pending: &Arc<PendingCalls>, function: &str) -> PendingCall {
        let id = pending.reserve(function);
        PendingCall::new(id, function.into(), Arc::clone(pending), 100, TICK)
    }

    #[test]
    fn callback_fires_once() {
        let pending = Arc::new(PendingCalls::new());
        let id = pending.reserve("f");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        pending.register_callback(
            id.clone(),
            Box::new(move |resp| {
                assert_eq!(resp.value, json!(7));
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        pending.on_response(Response::success(id.clone(), json!(7)));
        pending.on_response(Response::success(id, json!(8)));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pending.in_flight(), 0);
        assert_eq!(pending.parked(), 0);
    }

    #[test]
    fn late_callback_gets_parked_response() {
        let pending = Arc::new(PendingCalls::new());
        let id = pending.reserve("f");
        pending.on_response(Response::success(id.clone(), json!("early")));
        assert_eq!(pending.parked(), 1);

        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        pending.register_callback(id, Box::new(move |resp| *slot.lock() = Some(resp.value)));

        assert_eq!(*got.lock(), Some(json!("early")));
        assert_eq!(pending.parked(), 0);
        assert_eq!(pending.in_flight(), 0);
    }

    #[test]
    fn unknown_response_is_dropped() {
        let pending = PendingCalls::new();
        pending.on_response(Response::success(CallId::from_raw("ghost|0.1"), json!(1)));
        pending.on_response(Response::success(CallId::generate(ADD_SERVER_FUNCTION), json!(null)));
        assert_eq!(pending.parked(), 0);
    }

    #[tokio::test]
    async fn wait_returns_parked_value() {
        let pending = Arc::new(PendingCalls::new());
        let call = handle(&pending, "greet");
        pending.on_response(Response::success(call.id().clone(), json!("hi Ann")));

        assert_eq!(call.wait().await.unwrap(), json!("hi Ann"));
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn wait_wakes_on_arrival() {
        let pending = Arc::new(PendingCalls::new());
        let call = PendingCall::new(
            pending.reserve("slow"),
            "slow".into(),
            Arc::clone(&pending),
            3,
            Duration::from_secs(60),
        );
        let id = call.id().clone();
        let responder = Arc::clone(&pending);
        let _task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            responder.on_response(Response::success(id, json!(42)));
        });

        let value = tokio::time::timeout(Duration::from_secs(5), call.wait())
            .await
            .expect("poller should wake before its interval elapses")
            .unwrap();
        assert_eq!(value, json!(42));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_after_budget() {
        let pending = Arc::new(PendingCalls::new());
        let call = PendingCall::new(
            pending.reserve("never"),
            "never".into(),
            Arc::clone(&pending),
            10_000,
            TICK,
        );
        let id = call.id().clone();

        let err = call.wait().await.unwrap_err();
        assert!(
            matches!(err, EelError::CallTimeout { ref function, attempts: 10_000 } if function == "never"),
            "got {err:?}"
        );
        assert_eq!(pending.in_flight(), 0);

        // A straggler after the timeout is not parked forever.
        pending.on_response(Response::success(id, json!(1)));
        assert_eq!(pending.parked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn other_arrivals_do_not_use_up_attempts() {
        let pending = Arc::new(PendingCalls::new());
        let call = PendingCall::new(
            pending.reserve("mine"),
            "mine".into(),
            Arc::clone(&pending),
            3,
            TICK,
        );
        let id = call.id().clone();
        let poller = tokio::spawn(call.wait());
        tokio::task::yield_now().await;

        // Paused clock does not advance while this task keeps yielding.
        for _ in 0..20 {
            let other = pending.reserve("other");
            pending.on_response(Response::success(other, json!(null)));
            tokio::task::yield_now().await;
        }
        assert!(!poller.is_finished());

        pending.on_response(Response::success(id, json!("mine")));
        assert_eq!(poller.await.unwrap().unwrap(), json!("mine"));
    }

    #[tokio::test]
    async fn error_response_becomes_remote_error() {
        let pending = Arc::new(PendingCalls::new());
        let call = handle(&pending, "explode");
        pending.on_response(Response::failure(call.id().clone(), "kaboom"));

        let err = call.wait().await.unwrap_err();
        assert!(matches!(err, EelError::Remote { ref message, .. } if message == "kaboom"));
    }

    #[tokio::test]
    async fn wait_response_exposes_error_fields() {
        let pending = Arc::new(PendingCalls::new());
        let call = handle(&pending, "explode");
        pending.on_response(Response::failure(call.id().clone(), "kaboom"));

        let resp = call.wait_response().await.unwrap();
        assert!(resp.error);
        assert_eq!(resp.error_message, "kaboom");
    }

    #[test]
    fn dropped_handle_forgets_call() {
        let pending = Arc::new(PendingCalls::new());
        let call = handle(&pending, "f");
        let id = call.id().clone();
        assert_eq!(pending.in_flight(), 1);
        drop(call);
        assert_eq!(pending.in_flight(), 0);

        pending.on_response(Response::success(id, json!(1)));
        assert_eq!(pending.parked(), 0);
    }

    #[test]
    fn reserved_ids_are_distinct() {
        let pending = PendingCalls::new();
        let ids: HashSet<CallId> = (0..1_000).map(|_| pending.reserve("same")).collect();
        assert_eq!(ids.len(), 1_000);
        assert_eq!(pending.in_flight(), 1_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callbacks_fire_exactly_once() {
        const CALLS: usize = 500;
        let pending = Arc::new(PendingCalls::new());
        let fired: Arc<Vec<AtomicUsize>> = Arc::new((0..CALLS).map(|_| AtomicUsize::new(0)).collect());

        let mut ids = Vec::with_capacity(CALLS);
        for i in 0..CALLS {
            let id = pending.reserve("stress");
            let fired = Arc::clone(&fired);
            pending.register_callback(
                id.clone(),
                Box::new(move |_| {
                    let _ = fired[i].fetch_add(1, Ordering::SeqCst);
                }),
            );
            ids.push(id);
        }

        let mut tasks = Vec::new();
        for id in ids {
            for _ in 0..2 {
                let pending = Arc::clone(&pending);
                let id = id.clone();
                tasks.push(tokio::spawn(async move {
                    pending.on_response(Response::success(id, json!(null)));
                }));
            }
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert!(fired.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(pending.in_flight(), 0);
        assert_eq!(pending.parked(), 0);
    }
}
