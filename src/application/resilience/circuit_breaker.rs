//! Circuit breaker guarding calls to an unreliable remote dependency.
//!
//! State lives behind a `parking_lot::Mutex` that is never held across an
//! `.await`; the guarded action runs with the lock released. Each state
//! transition bumps a generation counter so that results from calls admitted
//! under an older state cannot flip the current one.

use super::{CallMeta, FailureClass};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive dependency failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting probes.
    pub timeout: Duration,
    /// Probes allowed in flight while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

/// Local rejection: the guarded action was not attempted.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("circuit '{circuit}' is {state}, request rejected")]
pub struct CircuitOpenError {
    pub circuit: String,
    pub state: CircuitState,
    /// Time left in the open window, when known.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct StateChange {
    pub prev: CircuitState,
    pub meta: CallMeta,
}

/// Observability hooks. Implementations must return quickly; a panic inside
/// a hook is caught and logged.
pub trait BreakerObserver: Send + Sync {
    fn on_state_change(&self, _state: CircuitState, _change: &StateChange) {}
    fn on_event(&self, _name: &str, _meta: &CallMeta) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_probes: u32,
    pub open_until: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_probes: u32,
    open_until: Option<Instant>,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
enum Admission {
    Normal { generation: u64 },
    Probe { generation: u64 },
}

/// Settles an admission. Dropped unfinished, it releases a held half-open slot.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
    meta: &'a CallMeta,
}

impl InFlight<'_> {
    fn finish(mut self, healthy: bool) {
        if let Some(admission) = self.admission.take() {
            self.breaker.record(admission, healthy, self.meta);
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(Admission::Probe { generation }) = self.admission.take() {
            self.breaker.release_half_open_slot(generation, self.meta);
        }
    }
}

enum Notice {
    Transition(CircuitState, CircuitState),
    Event(&'static str),
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    observers: Vec<Arc<dyn BreakerObserver>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_probes: 0,
                open_until: None,
                generation: 0,
            }),
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_probes: inner.half_open_probes,
            open_until: inner.open_until,
        }
    }

    /// Runs `action` if the circuit admits it.
    ///
    /// Only errors that count as dependency failures move the circuit towards
    /// OPEN; a rejection never invokes `action` and is never counted.
    pub async fn call<T, E, F, Fut>(&self, meta: &CallMeta, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError> + FailureClass,
    {
        let admission = match self.admit(meta) {
            Ok(admission) => admission,
            Err(rejection) => return Err(E::from(rejection)),
        };
        let in_flight = InFlight {
            breaker: self,
            admission: Some(admission),
            meta,
        };

        let result = action().await;
        let healthy = match &result {
            Ok(_) => true,
            Err(e) => !e.counts_as_dependency_failure(),
        };
        in_flight.finish(healthy);
        result
    }

    /// Forces the circuit open for a full timeout window.
    pub fn open(&self) {
        let notices = {
            let mut inner = self.inner.lock();
            let prev = inner.state;
            self.enter_open(&mut inner);
            vec![Notice::Transition(prev, CircuitState::Open)]
        };
        warn!(circuit = %self.name, "Circuit force-opened");
        self.notify(notices, &CallMeta::default());
    }

    /// Forces the circuit closed and clears every counter.
    pub fn close(&self) {
        let notices = {
            let mut inner = self.inner.lock();
            let prev = inner.state;
            Self::enter_closed(&mut inner);
            vec![Notice::Transition(prev, CircuitState::Closed)]
        };
        info!(circuit = %self.name, "Circuit force-closed");
        self.notify(notices, &CallMeta::default());
    }

    fn admit(&self, meta: &CallMeta) -> Result<Admission, CircuitOpenError> {
        let mut notices = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            self.try_admit(&mut inner, &mut notices)
        };

        if let Some(Notice::Transition(..)) = notices.first() {
            info!(circuit = %self.name, "Circuit transitioned to HALF_OPEN");
        }
        self.notify(notices, meta);
        outcome
    }

    fn try_admit(
        &self,
        inner: &mut Inner,
        notices: &mut Vec<Notice>,
    ) -> Result<Admission, CircuitOpenError> {
        let now = Instant::now();

        if inner.state == CircuitState::Open {
            if let Some(until) = inner.open_until
                && now < until
            {
                notices.push(Notice::Event("rejected"));
                return Err(CircuitOpenError {
                    circuit: self.name.clone(),
                    state: CircuitState::Open,
                    retry_after: Some(until - now),
                });
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_probes = 0;
            inner.success_count = 0;
            inner.generation += 1;
            notices.push(Notice::Transition(
                CircuitState::Open,
                CircuitState::HalfOpen,
            ));
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_probes >= self.config.half_open_max_requests {
                notices.push(Notice::Event("rejected"));
                return Err(CircuitOpenError {
                    circuit: self.name.clone(),
                    state: CircuitState::HalfOpen,
                    retry_after: None,
                });
            }
            inner.half_open_probes += 1;
            notices.push(Notice::Event("probe"));
            return Ok(Admission::Probe {
                generation: inner.generation,
            });
        }

        Ok(Admission::Normal {
            generation: inner.generation,
        })
    }

    fn record(&self, admission: Admission, healthy: bool, meta: &CallMeta) {
        let mut notices = Vec::new();
        {
            let mut inner = self.inner.lock();
            match admission {
                Admission::Probe { generation } => {
                    if generation != inner.generation {
                        return;
                    }
                    inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
                    if healthy {
                        Self::enter_closed(&mut inner);
                        info!(circuit = %self.name, "Circuit closed after successful probe");
                        notices.push(Notice::Transition(
                            CircuitState::HalfOpen,
                            CircuitState::Closed,
                        ));
                    } else {
                        self.enter_open(&mut inner);
                        error!(circuit = %self.name, "Probe failed, circuit reopened");
                        notices.push(Notice::Transition(
                            CircuitState::HalfOpen,
                            CircuitState::Open,
                        ));
                    }
                }
                Admission::Normal { generation } => {
                    if generation != inner.generation || inner.state != CircuitState::Closed {
                        return;
                    }
                    if healthy {
                        inner.failure_count = 0;
                        inner.success_count = inner.success_count.saturating_add(1);
                        notices.push(Notice::Event("success"));
                    } else {
                        inner.failure_count += 1;
                        inner.success_count = 0;
                        notices.push(Notice::Event("failure"));
                        if inner.failure_count >= self.config.failure_threshold {
                            let failure_count = inner.failure_count;
                            self.enter_open(&mut inner);
                            error!(circuit = %self.name, failure_count, "Circuit opened");
                            notices.push(Notice::Transition(
                                CircuitState::Closed,
                                CircuitState::Open,
                            ));
                        }
                    }
                }
            }
        }
        self.notify(notices, meta);
    }

    /// Gives back the half-open slot of a call whose caller went away before it
    /// produced a result. The outcome is unknown, so the state is left alone.
    fn release_half_open_slot(&self, generation: u64, meta: &CallMeta) {
        {
            let mut inner = self.inner.lock();
            if generation != inner.generation || inner.state != CircuitState::HalfOpen {
                return;
            }
            inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
        }
        warn!(circuit = %self.name, "Half-open call cancelled before completing, slot released");
        self.notify(vec![Notice::Event("cancelled")], meta);
    }

    fn enter_open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + self.config.timeout);
        inner.half_open_probes = 0;
        inner.success_count = 0;
        inner.generation += 1;
    }

    fn enter_closed(inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.open_until = None;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_probes = 0;
        inner.generation += 1;
    }

    fn notify(&self, notices: Vec<Notice>, meta: &CallMeta) {
        if self.observers.is_empty() {
            return;
        }
        for notice in notices {
            for observer in &self.observers {
                let delivered = catch_unwind(AssertUnwindSafe(|| match &notice {
                    Notice::Transition(prev, next) => observer.on_state_change(
                        *next,
                        &StateChange {
                            prev: *prev,
                            meta: meta.clone(),
                        },
                    ),
                    Notice::Event(name) => observer.on_event(name, meta),
                }));
                if delivered.is_err() {
                    warn!(circuit = %self.name, "Breaker observer panicked, ignoring");
                }
            }
        }
    }
}
