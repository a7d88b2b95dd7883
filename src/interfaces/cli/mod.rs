//! Administrative command line for the dead-letter queue.

mod admin;

pub use admin::{AdminRunner, Confirmation, StdinConfirmation};

use crate::application::dlq::MessageFilter;
use crate::config::{AuditConfig, Config, DEFAULT_AUDIT_LOG, Environment};
use crate::domain::message::DlqEntry;
use crate::error::{PaymentError, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dead-letter queue administration for payflow", long_about = None)]
pub struct Cli {
    /// Broker endpoints, tried in order (nats://HOST:PORT, memory://NAME or file://PATH)
    #[arg(
        long = "broker-url",
        env = "PAYFLOW_BROKER_URLS",
        value_delimiter = ',',
        global = true
    )]
    pub broker_urls: Vec<String>,

    #[arg(
        long,
        value_enum,
        env = "PAYFLOW_ENVIRONMENT",
        default_value_t = Environment::Development,
        global = true
    )]
    pub environment: Environment,

    /// Append-only audit log of administrative actions
    #[arg(long, env = "PAYFLOW_AUDIT_LOG", default_value = DEFAULT_AUDIT_LOG, global = true)]
    pub audit_log: PathBuf,

    /// Name recorded in the audit log
    #[arg(long, env = "PAYFLOW_OPERATOR", default_value = "unknown", global = true)]
    pub operator: String,

    #[command(flatten)]
    pub tuning: TuningArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn config(&self) -> Config {
        let config = Config::new(self.environment)
            .with_endpoints(self.broker_urls.clone())
            .with_audit(AuditConfig {
                path: self.audit_log.clone(),
                operator: self.operator.clone(),
            });
        self.tuning.apply(config)
    }
}

/// Overrides for the defaults in [`Config`]. Unset flags keep the default.
///
/// Shared by every process reading `PAYFLOW_*`, so services embedding the
/// orchestrator can flatten it into their own parser.
#[derive(Args, Debug, Clone, Default, PartialEq)]
#[command(next_help_heading = "Tuning")]
pub struct TuningArgs {
    /// Unacknowledged deliveries per consumer
    #[arg(long, env = "PAYFLOW_PREFETCH", global = true)]
    pub prefetch: Option<u16>,

    /// Requeues a failing delivery gets before it is dead-lettered
    #[arg(long, env = "PAYFLOW_MAX_RETRIES", global = true)]
    pub max_retries: Option<u32>,

    /// Connection rounds over the endpoint list before giving up
    #[arg(long, env = "PAYFLOW_CONNECT_RETRIES", global = true)]
    pub connect_retries: Option<u32>,

    #[arg(long, env = "PAYFLOW_CONNECT_DELAY_MS", global = true)]
    pub connect_delay_ms: Option<u64>,

    /// Topic queue TTL; 0 disables expiry
    #[arg(long, env = "PAYFLOW_MESSAGE_TTL_SECS", global = true)]
    pub message_ttl_secs: Option<u64>,

    #[arg(long, env = "PAYFLOW_MAX_QUEUE_LENGTH", global = true)]
    pub max_queue_length: Option<usize>,

    /// Consecutive gateway failures that open the circuit
    #[arg(long, env = "PAYFLOW_BREAKER_THRESHOLD", global = true)]
    pub breaker_threshold: Option<u32>,

    #[arg(long, env = "PAYFLOW_BREAKER_TIMEOUT_SECS", global = true)]
    pub breaker_timeout_secs: Option<u64>,

    #[arg(long, env = "PAYFLOW_RETRY_ATTEMPTS", global = true)]
    pub retry_attempts: Option<u32>,

    #[arg(long, env = "PAYFLOW_RETRY_BASE_DELAY_MS", global = true)]
    pub retry_base_delay_ms: Option<u64>,

    #[arg(long, env = "PAYFLOW_PEEK_TIMEOUT_SECS", global = true)]
    pub peek_timeout_secs: Option<u64>,

    #[arg(long, env = "PAYFLOW_REPROCESS_TIMEOUT_SECS", global = true)]
    pub reprocess_timeout_secs: Option<u64>,

    /// DLQ depth that raises a monitoring alert
    #[arg(long, env = "PAYFLOW_ALERT_THRESHOLD", global = true)]
    pub alert_threshold: Option<u32>,
}

impl TuningArgs {
    pub fn apply(&self, mut config: Config) -> Config {
        let broker = &mut config.broker;
        if let Some(prefetch) = self.prefetch {
            broker.prefetch = prefetch;
        }
        if let Some(max_retries) = self.max_retries {
            broker.max_retries = max_retries;
        }
        if let Some(retries) = self.connect_retries {
            broker.connect_retries = retries;
        }
        if let Some(ms) = self.connect_delay_ms {
            broker.connect_base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.message_ttl_secs {
            broker.message_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(length) = self.max_queue_length {
            broker.max_queue_length = Some(length);
        }

        if let Some(threshold) = self.breaker_threshold {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(secs) = self.breaker_timeout_secs {
            config.breaker.timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = self.retry_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = self.retry_base_delay_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }

        if let Some(secs) = self.peek_timeout_secs {
            config.dlq.peek_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reprocess_timeout_secs {
            config.dlq.reprocess_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = self.alert_threshold {
            config.dlq.alert_threshold = threshold;
        }
        config
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print dead-lettered messages without removing them
    Peek {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Write the messages to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print DLQ depth and consumer count
    Stats,
    /// Republish dead-lettered messages to their original routing keys
    Redrive(RedriveArgs),
    /// Check dead-lettered messages can be redriven
    Validate {
        #[arg(long, default_value_t = 100)]
        limit: usize,
        /// Report file; CSV when it ends in .csv, JSON otherwise
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Delete every message in the DLQ
    Purge {
        #[arg(long)]
        confirm: bool,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Peek { .. } => "peek",
            Command::Stats => "stats",
            Command::Redrive(_) => "redrive",
            Command::Validate { .. } => "validate",
            Command::Purge { .. } => "purge",
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RedriveArgs {
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
    #[arg(long)]
    pub dry_run: bool,
    /// JSON object; every field must equal the payload's top-level field
    #[arg(long)]
    pub filter: Option<String>,
    #[arg(long)]
    pub target_exchange: Option<String>,
    /// Overrides --limit
    #[arg(long)]
    pub max_messages: Option<usize>,
    /// UTC hours redrive may run in, e.g. 0-6,22-23
    #[arg(long)]
    pub restrict_hours: Option<String>,
    /// Skip the hour restriction and the production prompt
    #[arg(long)]
    pub force: bool,
}

impl RedriveArgs {
    pub fn max_messages(&self) -> usize {
        self.max_messages.unwrap_or(self.limit)
    }
}

/// UTC hours of the day an action is allowed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourWindow {
    allowed: [bool; 24],
}

impl HourWindow {
    /// Parses comma-separated hours and inclusive ranges, e.g. `0-6,22-23`.
    pub fn parse(hours: &str) -> Result<Self> {
        let mut allowed = [false; 24];
        for part in hours.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => (parse_hour(start)?, parse_hour(end)?),
                None => {
                    let hour = parse_hour(part)?;
                    (hour, hour)
                }
            };
            if start > end {
                return Err(PaymentError::ValidationError(format!(
                    "hour range {part} runs backwards"
                )));
            }
            for slot in &mut allowed[start..=end] {
                *slot = true;
            }
        }
        if !allowed.contains(&true) {
            return Err(PaymentError::ValidationError(
                "restrict-hours names no hours".to_string(),
            ));
        }
        Ok(Self { allowed })
    }

    pub fn allows(&self, hour: u32) -> bool {
        self.allowed.get(hour as usize).copied().unwrap_or(false)
    }
}

fn parse_hour(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(hour) if hour < 24 => Ok(hour),
        _ => Err(PaymentError::ValidationError(format!(
            "invalid hour '{raw}', expected 0-23"
        ))),
    }
}

/// Builds a filter matching payloads whose top-level fields equal those of
/// the JSON object in `raw`.
pub fn payload_filter(raw: &str) -> Result<MessageFilter> {
    let expected: Map<String, Value> = match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => map,
        _ => {
            return Err(PaymentError::ValidationError(
                "filter must be a JSON object".to_string(),
            ));
        }
    };
    Ok(Arc::new(move |entry: &DlqEntry| {
        expected
            .iter()
            .all(|(field, value)| entry.message.payload.get(field) == Some(value))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dlq::DlqConfig;
    use crate::domain::message::{Message, MessageHeaders};
    use chrono::Utc;
    use serde_json::json;

    fn entry(payload: Value) -> DlqEntry {
        DlqEntry {
            message: Message {
                id: "m1".to_string(),
                topic: "dead_letter".to_string(),
                payload,
                headers: MessageHeaders::default(),
                persistent: true,
                redelivered: false,
                published_at: Utc::now(),
            },
            original_queue: None,
            dead_letter_reason: None,
            death_count: 1,
            dead_lettered_at: None,
        }
    }

    #[test]
    fn test_hour_window_ranges() {
        let window = HourWindow::parse("0-6, 22-23").unwrap();
        assert!(window.allows(0));
        assert!(window.allows(6));
        assert!(!window.allows(7));
        assert!(window.allows(23));
        assert!(!window.allows(24));

        assert!(HourWindow::parse("9").unwrap().allows(9));
        assert!(HourWindow::parse("6-2").is_err());
        assert!(HourWindow::parse("25").is_err());
        assert!(HourWindow::parse(",").is_err());
    }

    #[test]
    fn test_payload_filter_matches_top_level_fields() {
        let filter = payload_filter(r#"{"tenant":"a","amount":10}"#).unwrap();
        assert!(filter(&entry(json!({ "tenant": "a", "amount": 10, "extra": true }))));
        assert!(!filter(&entry(json!({ "tenant": "a", "amount": 11 }))));
        assert!(!filter(&entry(json!({ "nested": { "tenant": "a" } }))));

        assert!(payload_filter("[1]").is_err());
        assert!(payload_filter("not json").is_err());
    }

    #[test]
    fn test_max_messages_overrides_limit() {
        let args = RedriveArgs {
            limit: 5,
            max_messages: Some(2),
            ..Default::default()
        };
        assert_eq!(args.max_messages(), 2);
        let args = RedriveArgs {
            limit: 5,
            ..Default::default()
        };
        assert_eq!(args.max_messages(), 5);
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "payflow",
            "redrive",
            "--dry-run",
            "--max-messages",
            "3",
            "--broker-url",
            "memory://a,memory://b",
            "--environment",
            "production",
        ])
        .unwrap();
        assert_eq!(cli.broker_urls, vec!["memory://a", "memory://b"]);
        assert_eq!(cli.environment, Environment::Production);
        let Command::Redrive(args) = &cli.command else {
            panic!("expected redrive");
        };
        assert!(args.dry_run);
        assert_eq!(args.max_messages(), 3);
        assert_eq!(cli.config().broker.endpoints.len(), 2);
    }

    #[test]
    fn test_tuning_flags_reach_config() {
        let cli = Cli::try_parse_from([
            "payflow",
            "stats",
            "--prefetch",
            "25",
            "--max-retries",
            "7",
            "--message-ttl-secs",
            "0",
            "--breaker-threshold",
            "2",
            "--breaker-timeout-secs",
            "90",
            "--retry-attempts",
            "5",
            "--retry-base-delay-ms",
            "50",
            "--reprocess-timeout-secs",
            "120",
        ])
        .unwrap();
        let config = cli.config();

        assert_eq!(config.broker.prefetch, 25);
        assert_eq!(config.broker.max_retries, 7);
        assert_eq!(config.broker.message_ttl, None);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.timeout, Duration::from_secs(90));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.dlq.reprocess_timeout, Duration::from_secs(120));
        assert_eq!(config.dlq.peek_timeout, DlqConfig::default().peek_timeout);
    }

    #[test]
    fn test_unset_tuning_keeps_defaults() {
        let config = TuningArgs::default().apply(Config::default());
        assert_eq!(config.broker, Config::default().broker);
        assert_eq!(config.dlq, DlqConfig::default());
        assert_eq!(config.retry, Config::default().retry);
    }
}
