//! Process configuration, assembled once at startup and passed to
//! constructors.

use crate::application::broker::BrokerConfig;
use crate::application::dlq::DlqConfig;
use crate::application::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::application::resilience::retry::RetryPolicy;
use crate::application::resilience::{GatewayPolicy, gateway_policy};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_AUDIT_LOG: &str = "dlq-audit.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Destructive admin actions need an interactive confirmation here.
    pub fn requires_interactive_confirmation(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditConfig {
    /// Append-only JSON-lines file.
    pub path: PathBuf,
    pub operator: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_AUDIT_LOG),
            operator: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub environment: Environment,
    pub broker: BrokerConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub dlq: DlqConfig,
    pub audit: AuditConfig,
}

impl Config {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            ..Default::default()
        }
    }

    /// Replaces the broker endpoints. An empty list keeps the defaults.
    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        if !endpoints.is_empty() {
            self.broker.endpoints = endpoints;
        }
        self
    }

    pub fn with_audit(mut self, audit: AuditConfig) -> Self {
        self.audit = audit;
        self
    }

    /// Retry around a fresh breaker named `circuit`, for one remote dependency.
    pub fn gateway_policy(&self, circuit: &str) -> GatewayPolicy {
        let breaker = CircuitBreaker::with_config(circuit, self.breaker.clone());
        gateway_policy(self.retry, Arc::new(breaker))
    }
}
