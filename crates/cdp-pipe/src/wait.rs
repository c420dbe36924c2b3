use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{BrowserOptions, WaitStrategy};
use crate::dispatcher::{CdpEvent, Dispatcher, ListenerGuard};
use crate::error::CdpError;
use crate::events::{NetworkEvent, NETWORK_EVENTS};

/// Requests still allowed in flight while the network counts as idle.
pub const MAX_IDLE_REQUESTS: usize = 2;
/// How long the request count must stay at or under the limit.
pub const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);

const READY_STATE_EXPRESSION: &str = "document.readyState";

#[derive(Debug)]
struct IdleState {
    in_flight: HashSet<String>,
    last_busy: Instant,
}

/// Counts in-flight requests for one session from network events.
#[derive(Clone, Debug)]
pub struct NetworkIdleTracker {
    session_id: Option<String>,
    state: Arc<Mutex<IdleState>>,
}

impl NetworkIdleTracker {
    pub fn new(session_id: Option<&str>) -> Self {
        Self::starting_at(session_id, Instant::now())
    }

    fn starting_at(session_id: Option<&str>, now: Instant) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            state: Arc::new(Mutex::new(IdleState {
                in_flight: HashSet::new(),
                last_busy: now,
            })),
        }
    }

    /// Feeds one raw event; events from other sessions are ignored.
    pub fn observe(&self, event: &CdpEvent) {
        if self.session_id.is_some() && event.session_id != self.session_id {
            return;
        }
        if let Some(network) = NetworkEvent::from_event(event) {
            self.apply(network);
        }
    }

    pub fn apply(&self, event: NetworkEvent) {
        let mut state = self.state.lock();
        match event {
            NetworkEvent::RequestWillBeSent { request_id } => {
                state.in_flight.insert(request_id);
                if state.in_flight.len() > MAX_IDLE_REQUESTS {
                    state.last_busy = state.last_busy.max(Instant::now());
                }
            }
            NetworkEvent::LoadingFinished { request_id }
            | NetworkEvent::LoadingFailed { request_id } => {
                if state.in_flight.len() > MAX_IDLE_REQUESTS {
                    state.last_busy = state.last_busy.max(Instant::now());
                }
                state.in_flight.remove(&request_id);
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// True once the in-flight count has stayed within the limit for the whole idle window.
    pub fn is_idle_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.in_flight.len() > MAX_IDLE_REQUESTS {
            state.last_busy = now;
            return false;
        }
        now.saturating_duration_since(state.last_busy) >= NETWORK_IDLE_WINDOW
    }

    /// Registers the tracker for every network event it consumes. Dropping the guards
    /// unregisters them.
    pub fn attach(&self, dispatcher: &Dispatcher) -> Vec<ListenerGuard> {
        NETWORK_EVENTS
            .iter()
            .map(|method| {
                let tracker = self.clone();
                dispatcher.subscribe(method, move |event| tracker.observe(event))
            })
            .collect()
    }
}

/// How a wait loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// No strategy was configured.
    Skipped,
    Satisfied(WaitStrategy),
    /// The deadline passed first; the page is used as-is.
    TimedOut,
}

/// `true`/`false`/number/string comparison used by the JS variable strategy.
pub fn matches_expected(value: &Value, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    match value {
        Value::String(text) => text == expected,
        Value::Bool(true) => expected == "true",
        Value::Bool(false) => expected == "false",
        Value::Number(number) => number.to_string() == expected,
        _ => false,
    }
}

/// The set of readiness checks evaluated on each poll for one page session.
///
/// Network listeners live as long as this value, so every exit path of a wait unregisters them.
pub struct WaitConditions<'a> {
    dispatcher: &'a Dispatcher,
    session_id: &'a str,
    strategy: WaitStrategy,
    variable: Option<&'a str>,
    expected: Option<&'a str>,
    tracker: Option<NetworkIdleTracker>,
    _listeners: Vec<ListenerGuard>,
}

impl<'a> WaitConditions<'a> {
    pub fn new(dispatcher: &'a Dispatcher, session_id: &'a str, options: &'a BrowserOptions) -> Self {
        let strategy = options.wait_strategy;
        let (tracker, listeners) = if strategy.contains(WaitStrategy::NETWORK_IDLE) {
            let tracker = NetworkIdleTracker::new(Some(session_id));
            let listeners = tracker.attach(dispatcher);
            (Some(tracker), listeners)
        } else {
            (None, Vec::new())
        };

        Self {
            dispatcher,
            session_id,
            strategy,
            variable: options
                .wait_variable
                .as_deref()
                .filter(|expr| !expr.is_empty()),
            expected: options.wait_variable_value.as_deref(),
            tracker,
            _listeners: listeners,
        }
    }

    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Runs every enabled check once and reports the first satisfied one.
    pub async fn poll_once(&self) -> Result<Option<WaitStrategy>, CdpError> {
        if self.strategy.contains(WaitStrategy::LOAD) {
            let value = self.evaluate(READY_STATE_EXPRESSION).await?;
            if value.as_str() == Some("complete") {
                return Ok(Some(WaitStrategy::LOAD));
            }
        }

        if let Some(tracker) = &self.tracker {
            if tracker.is_idle_at(Instant::now()) {
                return Ok(Some(WaitStrategy::NETWORK_IDLE));
            }
        }

        if self.strategy.contains(WaitStrategy::JAVASCRIPT_VARIABLE) {
            if let Some(expression) = self.variable {
                let value = self.evaluate(expression).await?;
                if matches_expected(&value, self.expected) {
                    return Ok(Some(WaitStrategy::JAVASCRIPT_VARIABLE));
                }
            }
        }

        Ok(None)
    }

    /// Polls until a check passes, the timeout elapses or `cancel` fires.
    pub async fn wait(
        self,
        timeout: Option<Duration>,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, CdpError> {
        if self.strategy.is_empty() {
            return Ok(WaitOutcome::Skipped);
        }

        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);
        loop {
            if cancel.is_cancelled() {
                return Err(CdpError::Cancelled);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!(
                    target: "cdp-pipe",
                    session = self.session_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "wait timed out; continuing with current page state"
                );
                return Ok(WaitOutcome::TimedOut);
            }

            let polled = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // A poll cut short by the deadline drops only its response slot; its frame
                    // is already queued whole on the writer task.
                    match tokio::time::timeout(remaining, self.poll_once()).await {
                        Ok(polled) => polled?,
                        Err(_) => continue,
                    }
                }
                None => self.poll_once().await?,
            };
            if let Some(satisfied) = polled {
                trace!(
                    target: "cdp-pipe",
                    session = self.session_id,
                    strategy = ?satisfied,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "page ready"
                );
                return Ok(WaitOutcome::Satisfied(satisfied));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CdpError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let response = self
            .dispatcher
            .send(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
                Some(self.session_id),
            )
            .await?;
        Ok(response
            .get("result")
            .and_then(|result| result.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }
}
