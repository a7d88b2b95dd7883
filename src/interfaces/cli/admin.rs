use super::{Command, HourWindow, RedriveArgs, payload_filter};
use crate::application::dlq::{DlqManager, MessageValidation, ReprocessOptions};
use crate::config::{Config, Environment};
use crate::error::{PaymentError, Result};
use crate::interfaces::audit::AuditLog;
use crate::interfaces::csv::validation_report::ValidationReportWriter;
use chrono::{Timelike, Utc};
use serde_json::{Value, json};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Asks the operator to approve a destructive action.
pub trait Confirmation: Send + Sync {
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Prompts on stderr and reads the answer from stdin. Only `yes` approves.
pub struct StdinConfirmation;

impl Confirmation for StdinConfirmation {
    fn confirm(&self, question: &str) -> Result<bool> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{question} Type 'yes' to continue: ")?;
        stderr.flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        Ok(answer.trim().eq_ignore_ascii_case("yes"))
    }
}

/// What a command printed and what the audit log records about it.
struct Completed {
    output: Value,
    result: Value,
    outcomes: Option<Value>,
}

impl Completed {
    fn new(output: Value, result: Value) -> Self {
        Self {
            output,
            result,
            outcomes: None,
        }
    }
}

/// Runs administrative commands against the DLQ and audits each one.
pub struct AdminRunner {
    dlq: Arc<DlqManager>,
    environment: Environment,
    audit: AuditLog,
    confirmation: Box<dyn Confirmation>,
}

impl AdminRunner {
    pub fn new(dlq: Arc<DlqManager>, config: &Config, confirmation: Box<dyn Confirmation>) -> Self {
        Self {
            dlq,
            environment: config.environment,
            audit: AuditLog::new(&config.audit, config.environment),
            confirmation,
        }
    }

    /// Executes `command` and appends its audit line, whether it succeeded
    /// or not. Returns the JSON to print.
    pub async fn run(&self, command: &Command) -> Result<Value> {
        let executed = self.execute(command).await;
        let (result, outcomes) = match &executed {
            Ok(done) => (done.result.clone(), done.outcomes.clone()),
            Err(e) => (json!({ "status": "error", "error": e.envelope() }), None),
        };

        let audited = self
            .audit
            .record(command.name(), parameters(command), result, outcomes)
            .await;
        match (executed, audited) {
            (Ok(done), Ok(())) => Ok(done.output),
            (Ok(_), Err(e)) => {
                error!(path = %self.audit.path().display(), error = %e, "Audit log write failed");
                Err(e)
            }
            (Err(e), audited) => {
                if let Err(audit_error) = audited {
                    error!(path = %self.audit.path().display(), error = %audit_error, "Audit log write failed");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, command: &Command) -> Result<Completed> {
        match command {
            Command::Peek { limit, output } => self.peek(*limit, output.as_deref()).await,
            Command::Stats => {
                let stats = self.dlq.get_stats().await?;
                let result = json!({ "status": "ok", "message_count": stats.message_count });
                Ok(Completed::new(serde_json::to_value(&stats)?, result))
            }
            Command::Redrive(args) => self.redrive(args).await,
            Command::Validate { limit, report } => self.validate(*limit, report.as_deref()).await,
            Command::Purge { confirm } => self.purge(*confirm).await,
        }
    }

    async fn peek(&self, limit: usize, output: Option<&Path>) -> Result<Completed> {
        let entries = self.dlq.peek_messages(limit).await?;
        let result = json!({ "status": "ok", "count": entries.len() });
        let Some(path) = output else {
            return Ok(Completed::new(serde_json::to_value(&entries)?, result));
        };
        tokio::fs::write(path, serde_json::to_vec_pretty(&entries)?).await?;
        let summary = json!({ "peeked": entries.len(), "output": path.display().to_string() });
        Ok(Completed::new(summary, result))
    }

    async fn redrive(&self, args: &RedriveArgs) -> Result<Completed> {
        let filter = args.filter.as_deref().map(payload_filter).transpose()?;
        if let Some(hours) = &args.restrict_hours {
            let window = HourWindow::parse(hours)?;
            let hour = Utc::now().hour();
            if !window.allows(hour) && !args.force {
                return Err(PaymentError::ValidationError(format!(
                    "redrive is restricted to UTC hours {hours} and it is hour {hour}; pass --force to override"
                )));
            }
        }

        let max_messages = args.max_messages();
        if self.environment.requires_interactive_confirmation() && !args.dry_run && !args.force {
            let question = format!(
                "Redrive up to {max_messages} messages from {} in {}?",
                self.dlq.queue(),
                self.environment
            );
            if !self.confirmation.confirm(&question)? {
                return Err(PaymentError::ConfirmationRequired(
                    "redrive declined by operator".to_string(),
                ));
            }
        }

        let report = self
            .dlq
            .reprocess_messages(ReprocessOptions {
                max_messages,
                filter,
                target_exchange: args.target_exchange.clone(),
                dry_run: args.dry_run,
            })
            .await?;
        info!(
            processed = report.processed,
            failed = report.failed,
            dry_run = args.dry_run,
            "Redrive finished"
        );

        let result = json!({
            "status": "ok",
            "dry_run": args.dry_run,
            "processed": report.processed,
            "requeued": report.requeued,
            "failed": report.failed,
            "skipped": report.skipped,
        });
        Ok(Completed {
            output: serde_json::to_value(&report)?,
            result,
            outcomes: Some(serde_json::to_value(&report.outcomes)?),
        })
    }

    async fn validate(&self, limit: usize, report: Option<&Path>) -> Result<Completed> {
        let results = self.dlq.validate_messages(limit).await?;
        let invalid = results.iter().filter(|r| !r.valid).count();
        let result = json!({ "status": "ok", "checked": results.len(), "invalid": invalid });
        let Some(path) = report else {
            return Ok(Completed::new(serde_json::to_value(&results)?, result));
        };
        write_report(path, &results)?;
        let summary = json!({
            "checked": results.len(),
            "invalid": invalid,
            "report": path.display().to_string(),
        });
        Ok(Completed::new(summary, result))
    }

    async fn purge(&self, confirm: bool) -> Result<Completed> {
        if !confirm {
            return Err(PaymentError::ConfirmationRequired(
                "purge requires --confirm".to_string(),
            ));
        }
        let depth = self.dlq.get_message_count().await?;
        if self.environment.requires_interactive_confirmation() {
            let question = format!(
                "Permanently delete {depth} messages from {} in {}?",
                self.dlq.queue(),
                self.environment
            );
            if !self.confirmation.confirm(&question)? {
                return Err(PaymentError::ConfirmationRequired(
                    "purge declined by operator".to_string(),
                ));
            }
        }

        let doomed: Vec<Value> = self
            .dlq
            .peek_messages(depth as usize)
            .await?
            .into_iter()
            .map(|entry| {
                json!({
                    "message_id": entry.message.id,
                    "original_routing_key": entry.message.headers.original_routing_key,
                    "action": "purged",
                })
            })
            .collect();
        let purged = self.dlq.purge_queue(true).await?;

        Ok(Completed {
            output: json!({ "purged": purged }),
            result: json!({ "status": "ok", "purged": purged }),
            outcomes: Some(Value::Array(doomed)),
        })
    }
}

fn write_report(path: &Path, results: &[MessageValidation]) -> Result<()> {
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    let file = std::fs::File::create(path)?;
    if is_csv {
        ValidationReportWriter::new(file).write_results(results)
    } else {
        serde_json::to_writer_pretty(file, results)?;
        Ok(())
    }
}

fn parameters(command: &Command) -> Value {
    match command {
        Command::Peek { limit, output } => json!({ "limit": limit, "output": output }),
        Command::Stats => json!({}),
        Command::Redrive(args) => json!({
            "limit": args.limit,
            "max_messages": args.max_messages(),
            "dry_run": args.dry_run,
            "filter": args.filter,
            "target_exchange": args.target_exchange,
            "restrict_hours": args.restrict_hours,
            "force": args.force,
        }),
        Command::Validate { limit, report } => json!({ "limit": limit, "report": report }),
        Command::Purge { confirm } => json!({ "confirm": confirm }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::broker::{BrokerConfig, MessageBroker, PublishOptions};
    use crate::application::dlq::DlqConfig;
    use crate::config::AuditConfig;
    use crate::domain::message::{Nack, PAYMENT_FAILED, queue_name};
    use crate::infrastructure::in_memory_broker::InMemoryConnector;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Scripted {
        answer: bool,
        asked: Arc<AtomicU32>,
    }

    impl Confirmation for Scripted {
        fn confirm(&self, _question: &str) -> Result<bool> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    struct Harness {
        runner: AdminRunner,
        broker: Arc<MessageBroker>,
        asked: Arc<AtomicU32>,
        dir: TempDir,
    }

    async fn harness(name: &str, environment: Environment, answer: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(environment).with_audit(AuditConfig {
            path: dir.path().join("audit.log"),
            operator: "tester".to_string(),
        });
        config.broker = BrokerConfig {
            endpoints: vec![format!("memory://{name}")],
            ..Default::default()
        };
        let broker = Arc::new(MessageBroker::new(
            config.broker.clone(),
            Arc::new(InMemoryConnector::new()),
        ));
        let dlq = Arc::new(DlqManager::new(broker.clone(), DlqConfig::default()));
        dlq.initialize().await.unwrap();
        let asked = Arc::new(AtomicU32::new(0));
        let runner = AdminRunner::new(
            dlq,
            &config,
            Box::new(Scripted {
                answer,
                asked: asked.clone(),
            }),
        );
        Harness {
            runner,
            broker,
            asked,
            dir,
        }
    }

    async fn dead_letter(broker: &MessageBroker, payload: Value) {
        broker
            .publish(PAYMENT_FAILED, &payload, PublishOptions::default())
            .await
            .unwrap();
        let channel = broker.channel().unwrap();
        let delivery = channel
            .get(&queue_name(PAYMENT_FAILED))
            .await
            .unwrap()
            .unwrap();
        channel.nack(delivery.tag, Nack::dead_letter()).await.unwrap();
    }

    fn audit_lines(harness: &Harness) -> Vec<Value> {
        std::fs::read_to_string(harness.dir.path().join("audit.log"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_purge_in_production_asks_and_audits_outcomes() {
        let harness = harness("prod-purge", Environment::Production, true).await;
        dead_letter(&harness.broker, json!({ "payment_id": "p1" })).await;
        dead_letter(&harness.broker, json!({ "payment_id": "p2" })).await;

        let output = harness
            .runner
            .run(&Command::Purge { confirm: true })
            .await
            .unwrap();
        assert_eq!(output["purged"], 2);
        assert_eq!(harness.asked.load(Ordering::SeqCst), 1);

        let lines = audit_lines(&harness);
        assert_eq!(lines[0]["action"], "purge");
        assert_eq!(lines[0]["environment"], "production");
        assert_eq!(lines[0]["outcomes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_declined_redrive_is_audited_as_error() {
        let harness = harness("prod-redrive", Environment::Production, false).await;
        dead_letter(&harness.broker, json!({ "payment_id": "p1" })).await;

        let err = harness
            .runner
            .run(&Command::Redrive(RedriveArgs {
                limit: 100,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::ConfirmationRequired(_)));

        let lines = audit_lines(&harness);
        assert_eq!(lines[0]["result"]["status"], "error");
        assert_eq!(lines[0]["result"]["error"]["code"], "CONFIRMATION_REQUIRED");
        let depth = harness
            .broker
            .queue_info(&harness.broker.config().dead_letter_queue)
            .await
            .unwrap()
            .message_count;
        assert_eq!(depth, 1);
    }

    #[tokio::test]
    async fn test_dry_run_skips_production_prompt() {
        let harness = harness("prod-dry", Environment::Production, false).await;
        dead_letter(&harness.broker, json!({ "payment_id": "p1" })).await;

        let output = harness
            .runner
            .run(&Command::Redrive(RedriveArgs {
                limit: 100,
                dry_run: true,
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(output["processed"], 1);
        assert_eq!(harness.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restricted_hours_block_unless_forced() {
        let harness = harness("hours", Environment::Development, true).await;
        dead_letter(&harness.broker, json!({ "payment_id": "p1" })).await;
        let closed_hour = (Utc::now().hour() + 12) % 24;

        let args = RedriveArgs {
            limit: 100,
            restrict_hours: Some(closed_hour.to_string()),
            ..Default::default()
        };
        let err = harness
            .runner
            .run(&Command::Redrive(args.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::ValidationError(_)));

        let output = harness
            .runner
            .run(&Command::Redrive(RedriveArgs { force: true, ..args }))
            .await
            .unwrap();
        assert_eq!(output["processed"], 1);
    }

    #[tokio::test]
    async fn test_validate_writes_csv_report() {
        let harness = harness("validate", Environment::Development, true).await;
        dead_letter(&harness.broker, json!({ "payment_id": "p1" })).await;
        dead_letter(&harness.broker, json!("not an object")).await;
        let report = harness.dir.path().join("report.csv");

        let output = harness
            .runner
            .run(&Command::Validate {
                limit: 10,
                report: Some(report.clone()),
            })
            .await
            .unwrap();
        assert_eq!(output["checked"], 2);
        assert_eq!(output["invalid"], 1);

        let csv = std::fs::read_to_string(report).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.contains("payload is not a JSON object"));
    }
}
