//! Resilience policies for calls to remote dependencies.
//!
//! Every policy implements [`Policy::invoke`], so policies compose by
//! construction: `RetryPolicy::default().wrap(breaker)` retries calls that go
//! through the breaker, and each circuit-open rejection consumes an attempt.

pub mod circuit_breaker;
pub mod retry;

use crate::error::{PaymentError, Result};
use circuit_breaker::CircuitBreaker;
use retry::RetryPolicy;
use std::future::Future;
use std::sync::Arc;

/// Context attached to a guarded call, passed through to observers and logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallMeta {
    pub operation: Option<String>,
    pub idempotency_key: Option<String>,
}

impl CallMeta {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// How a failure should be treated by retry and breaker policies.
pub trait FailureClass {
    fn is_retryable(&self) -> bool;
    fn counts_as_dependency_failure(&self) -> bool;
}

impl FailureClass for PaymentError {
    fn is_retryable(&self) -> bool {
        PaymentError::is_retryable(self)
    }

    fn counts_as_dependency_failure(&self) -> bool {
        PaymentError::counts_as_dependency_failure(self)
    }
}

/// A call wrapper. `action` may be invoked any number of times, including zero.
pub trait Policy: Send + Sync {
    fn invoke<T, F, Fut>(
        &self,
        meta: &CallMeta,
        action: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send;

    /// Makes `self` the outer layer around `inner`.
    fn wrap<I: Policy>(self, inner: I) -> Chain<Self, I>
    where
        Self: Sized,
    {
        Chain { outer: self, inner }
    }
}

impl Policy for RetryPolicy {
    fn invoke<T, F, Fut>(
        &self,
        _meta: &CallMeta,
        action: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        async move { self.retry(&action).await }
    }
}

impl Policy for CircuitBreaker {
    fn invoke<T, F, Fut>(
        &self,
        meta: &CallMeta,
        action: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        async move { self.call(meta, action).await }
    }
}

impl<P: Policy> Policy for Arc<P> {
    fn invoke<T, F, Fut>(
        &self,
        meta: &CallMeta,
        action: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.as_ref().invoke(meta, action)
    }
}

/// Two policies applied outer-first.
#[derive(Debug, Clone)]
pub struct Chain<O, I> {
    outer: O,
    inner: I,
}

impl<O, I> Chain<O, I> {
    pub fn outer(&self) -> &O {
        &self.outer
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

impl<O: Policy, I: Policy> Policy for Chain<O, I> {
    fn invoke<T, F, Fut>(
        &self,
        meta: &CallMeta,
        action: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let inner = &self.inner;
        async move {
            let action = &action;
            self.outer
                .invoke(meta, move || inner.invoke(meta, action))
                .await
        }
    }
}

/// Retry around a shared circuit breaker, the stack used for gateway calls.
pub type GatewayPolicy = Chain<RetryPolicy, Arc<CircuitBreaker>>;

pub fn gateway_policy(retry: RetryPolicy, breaker: Arc<CircuitBreaker>) -> GatewayPolicy {
    retry.wrap(breaker)
}
