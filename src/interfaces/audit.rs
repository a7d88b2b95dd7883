use crate::config::{AuditConfig, Environment};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One line of the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub action: &'a str,
    pub operator: &'a str,
    pub environment: Environment,
    pub parameters: Value,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<Value>,
}

/// Append-only JSON-lines log of administrative actions.
pub struct AuditLog {
    path: PathBuf,
    operator: String,
    environment: Environment,
}

impl AuditLog {
    pub fn new(config: &AuditConfig, environment: Environment) -> Self {
        Self {
            path: config.path.clone(),
            operator: config.operator.clone(),
            environment,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(
        &self,
        action: &str,
        parameters: Value,
        result: Value,
        outcomes: Option<Value>,
    ) -> Result<()> {
        let record = AuditRecord {
            timestamp: Utc::now(),
            action,
            operator: &self.operator,
            environment: self.environment,
            parameters,
            result,
            outcomes,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
