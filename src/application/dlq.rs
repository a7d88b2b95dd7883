//! Dead-letter queue administration.
//!
//! Inspection, redrive, purge and depth monitoring for the queue the broker
//! dead-letters into. Every pass over the queue is bounded by a wall-clock
//! budget, and messages that must stay are returned only once the pass ends
//! so a single pass never sees the same message twice.

use crate::application::broker::MessageBroker;
use crate::domain::message::{Delivery, DlqEntry, Envelope, Nack, now_ms};
use crate::domain::ports::BrokerChannel;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DlqConfig {
    pub peek_timeout: Duration,
    pub reprocess_timeout: Duration,
    pub monitor_interval: Duration,
    /// Depth at which monitoring raises an alert.
    pub alert_threshold: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            peek_timeout: Duration::from_secs(5),
            reprocess_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(60),
            alert_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqStats {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqAlert {
    pub queue: String,
    pub depth: u32,
    pub threshold: u32,
    pub raised_at: DateTime<Utc>,
}

/// Receives monitoring output. All hooks default to no-ops.
pub trait DlqObserver: Send + Sync {
    fn on_stats(&self, _stats: &DlqStats) {}
    fn on_alert(&self, _alert: &DlqAlert) {}
    fn on_error(&self, _error: &PaymentError) {}
}

/// Logs monitoring output through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDlqObserver;

impl DlqObserver for TracingDlqObserver {
    fn on_stats(&self, stats: &DlqStats) {
        info!(queue = %stats.queue, depth = stats.message_count, "DLQ stats");
    }

    fn on_alert(&self, alert: &DlqAlert) {
        warn!(
            queue = %alert.queue,
            depth = alert.depth,
            threshold = alert.threshold,
            "DLQ depth over threshold"
        );
    }

    fn on_error(&self, error: &PaymentError) {
        error!(error = %error, "DLQ monitoring failed");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DlqEvent {
    Stats(DlqStats),
    Alert(DlqAlert),
    Error { code: String, message: String },
}

/// Forwards monitoring output into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDlqObserver {
    sender: mpsc::UnboundedSender<DlqEvent>,
}

impl ChannelDlqObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DlqEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl DlqObserver for ChannelDlqObserver {
    fn on_stats(&self, stats: &DlqStats) {
        let _ = self.sender.send(DlqEvent::Stats(stats.clone()));
    }

    fn on_alert(&self, alert: &DlqAlert) {
        let _ = self.sender.send(DlqEvent::Alert(alert.clone()));
    }

    fn on_error(&self, error: &PaymentError) {
        let _ = self.sender.send(DlqEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }
}

pub type MessageFilter = Arc<dyn Fn(&DlqEntry) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ReprocessOptions {
    pub max_messages: usize,
    /// Messages it rejects are skipped. Outside dry runs they are also acked.
    pub filter: Option<MessageFilter>,
    /// Defaults to the events exchange.
    pub target_exchange: Option<String>,
    pub dry_run: bool,
}

impl Default for ReprocessOptions {
    fn default() -> Self {
        Self {
            max_messages: 100,
            filter: None,
            target_exchange: None,
            dry_run: false,
        }
    }
}

impl fmt::Debug for ReprocessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReprocessOptions")
            .field("max_messages", &self.max_messages)
            .field("filter", &self.filter.is_some())
            .field("target_exchange", &self.target_exchange)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedriveAction {
    Republished,
    DryRun,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageOutcome {
    pub message_id: String,
    pub routing_key: Option<String>,
    pub action: RedriveAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReprocessReport {
    pub processed: u32,
    /// Failed messages returned to the DLQ.
    pub requeued: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
    pub outcomes: Vec<MessageOutcome>,
    /// The channel was lost before the pass finished.
    pub interrupted: bool,
}

struct Monitor {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Result of checking one DLQ message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageValidation {
    pub message_id: String,
    pub original_routing_key: Option<String>,
    pub dead_letter_reason: Option<String>,
    pub valid: bool,
    pub issues: Vec<String>,
}

impl MessageValidation {
    fn check(entry: &DlqEntry, topics: &[String]) -> Self {
        let routing_key = entry.message.headers.original_routing_key.clone();
        let mut issues = Vec::new();
        match routing_key.as_deref() {
            None => issues.push("missing original routing key".to_string()),
            Some(key) if !topics.iter().any(|t| t == key) => {
                issues.push(format!("unknown routing key {key}"))
            }
            Some(_) => {}
        }
        if !entry.message.payload.is_object() {
            issues.push("payload is not a JSON object".to_string());
        }
        if entry.dead_letter_reason.is_none() {
            issues.push("missing dead-letter reason".to_string());
        }
        Self {
            message_id: entry.message.id.clone(),
            original_routing_key: routing_key,
            dead_letter_reason: entry.dead_letter_reason.clone(),
            valid: issues.is_empty(),
            issues,
        }
    }
}

pub struct DlqManager {
    broker: Arc<MessageBroker>,
    config: DlqConfig,
    observer: Arc<dyn DlqObserver>,
    monitor: Mutex<Option<Monitor>>,
}

impl DlqManager {
    pub fn new(broker: Arc<MessageBroker>, config: DlqConfig) -> Self {
        Self {
            broker,
            config,
            observer: Arc::new(TracingDlqObserver),
            monitor: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DlqObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn queue(&self) -> &str {
        &self.broker.config().dead_letter_queue
    }

    /// Connects the broker if needed and checks the DLQ exists.
    pub async fn initialize(&self) -> Result<()> {
        if self.broker.channel().is_err() {
            self.broker.connect().await?;
        }
        let info = self.broker.queue_info(self.queue()).await?;
        info!(queue = %info.name, depth = info.message_count, "DLQ manager ready");
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<DlqStats> {
        let info = self.broker.queue_info(self.queue()).await?;
        Ok(DlqStats {
            queue: info.name,
            message_count: info.message_count,
            consumer_count: info.consumer_count,
            checked_at: Utc::now(),
        })
    }

    pub async fn get_message_count(&self) -> Result<u32> {
        Ok(self.broker.queue_info(self.queue()).await?.message_count)
    }

    /// Reads up to `limit` messages without removing them.
    ///
    /// Unparseable messages are returned to the queue but left out of the
    /// result.
    pub async fn peek_messages(&self, limit: usize) -> Result<Vec<DlqEntry>> {
        let channel = self.broker.channel()?;
        let deadline = Instant::now() + self.config.peek_timeout;
        let mut held = Vec::new();
        let mut entries = Vec::new();

        let outcome = async {
            while held.len() < limit {
                let Some(delivery) = next_message(&channel, self.queue(), deadline).await? else {
                    break;
                };
                held.push(delivery.tag);
                match DlqEntry::from_delivery(&delivery) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(
                        message_id = %delivery.envelope.message_id,
                        error = %e,
                        "Skipping unparseable DLQ message"
                    ),
                }
            }
            Ok::<_, PaymentError>(())
        }
        .await;

        release(&channel, &held).await;
        outcome?;
        debug!(queue = %self.queue(), peeked = entries.len(), "DLQ peeked");
        Ok(entries)
    }

    /// Republishes dead-lettered messages to their original routing key.
    ///
    /// One message failing never aborts the batch: it is recorded in the
    /// report and returned to the DLQ when the pass ends. Losing the channel
    /// mid-pass ends it early with a partial report; the broker has already
    /// returned every message still held on that channel.
    pub async fn reprocess_messages(&self, options: ReprocessOptions) -> Result<ReprocessReport> {
        let channel = self.broker.channel()?;
        let deadline = Instant::now() + self.config.reprocess_timeout;
        let exchange = options
            .target_exchange
            .clone()
            .unwrap_or_else(|| self.broker.config().exchange.clone());
        let mut report = ReprocessReport::default();
        let mut held = Vec::new();
        let mut failed_tags = Vec::new();
        let mut consumed = 0;
        let mut interruption = None;

        while consumed < options.max_messages {
            let delivery = match next_message(&channel, self.queue(), deadline).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    interruption = Some(e);
                    break;
                }
            };
            consumed += 1;
            let message_id = delivery.envelope.message_id.clone();
            let routing_key = delivery.envelope.headers.original_routing_key.clone();

            let entry = match DlqEntry::from_delivery(&delivery) {
                Ok(entry) => entry,
                Err(e) => {
                    let error = format!("{message_id}: unparseable payload: {e}");
                    report.record_failure(message_id, routing_key, error);
                    held.push(delivery.tag);
                    failed_tags.push(delivery.tag);
                    continue;
                }
            };

            if let Some(filter) = &options.filter
                && !filter(&entry)
            {
                report.skipped += 1;
                report.outcomes.push(MessageOutcome {
                    message_id,
                    routing_key,
                    action: RedriveAction::Skipped,
                    error: None,
                });
                if options.dry_run {
                    held.push(delivery.tag);
                } else if let Err(e) = channel.ack(delivery.tag).await {
                    held.push(delivery.tag);
                    interruption = Some(e);
                    break;
                }
                continue;
            }

            if options.dry_run {
                held.push(delivery.tag);
                report.processed += 1;
                report.outcomes.push(MessageOutcome {
                    message_id,
                    routing_key,
                    action: RedriveAction::DryRun,
                    error: None,
                });
                continue;
            }

            match self.republish(delivery.envelope, &exchange).await {
                Ok(()) => match channel.ack(delivery.tag).await {
                    Ok(()) => {
                        report.processed += 1;
                        report.outcomes.push(MessageOutcome {
                            message_id,
                            routing_key,
                            action: RedriveAction::Republished,
                            error: None,
                        });
                    }
                    Err(e) => {
                        // the copy is out but the original stays dead-lettered
                        let error = format!("{message_id}: republished but not acked: {e}");
                        warn!(message_id = %message_id, error = %e, "Redrive ack failed");
                        report.record_failure(message_id, routing_key, error);
                        held.push(delivery.tag);
                        failed_tags.push(delivery.tag);
                        interruption = Some(e);
                        break;
                    }
                },
                Err(e) => {
                    let error = format!("{message_id}: {e}");
                    warn!(message_id = %message_id, error = %e, "Redrive failed");
                    report.record_failure(message_id, routing_key, error);
                    held.push(delivery.tag);
                    failed_tags.push(delivery.tag);
                }
            }
        }

        let returned = if channel.is_open() {
            release(&channel, &held).await
        } else {
            held
        };
        report.requeued = failed_tags.iter().filter(|t| returned.contains(t)).count() as u32;

        if let Some(e) = interruption {
            if consumed == 0 {
                return Err(e);
            }
            error!(queue = %self.queue(), consumed, error = %e, "DLQ reprocess interrupted");
            report.interrupted = true;
            report.errors.push(format!("pass interrupted: {e}"));
        }

        info!(
            queue = %self.queue(),
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            dry_run = options.dry_run,
            "DLQ reprocess finished"
        );
        Ok(report)
    }

    async fn republish(&self, mut envelope: Envelope, exchange: &str) -> Result<()> {
        let routing_key = envelope.headers.original_routing_key.clone().ok_or_else(|| {
            PaymentError::ValidationError("message has no x-original-routing-key".to_string())
        })?;
        envelope.exchange = exchange.to_string();
        envelope.routing_key = routing_key;
        envelope.death = None;
        envelope.headers.retry_count = 0;
        envelope.headers.reprocessed = Some(true);
        envelope.headers.reprocess_timestamp = Some(now_ms());
        self.broker.publish_envelope(envelope).await
    }

    /// Checks up to `limit` dead-lettered messages for what a redrive needs.
    pub async fn validate_messages(&self, limit: usize) -> Result<Vec<MessageValidation>> {
        let topics = &self.broker.config().topics;
        let entries = self.peek_messages(limit).await?;
        Ok(entries
            .iter()
            .map(|entry| MessageValidation::check(entry, topics))
            .collect())
    }

    /// Deletes every ready message in the DLQ. Refuses unless `confirm`.
    pub async fn purge_queue(&self, confirm: bool) -> Result<u32> {
        if !confirm {
            return Err(PaymentError::ConfirmationRequired(format!(
                "purging {} deletes its messages permanently",
                self.queue()
            )));
        }
        let purged = self.broker.channel()?.purge(self.queue()).await?;
        warn!(queue = %self.queue(), purged, "DLQ purged");
        Ok(purged)
    }

    /// Polls DLQ depth every `monitor_interval`. Returns `false` if monitoring
    /// is already running.
    pub fn start_monitoring(self: &Arc<Self>, threshold: u32) -> bool {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        let task_token = token.clone();
        let manager = Arc::clone(self);
        let interval = self.config.monitor_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => manager.check_depth(threshold).await,
                }
            }
        });
        info!(queue = %self.queue(), threshold, ?interval, "DLQ monitoring started");
        *slot = Some(Monitor { token, task });
        true
    }

    async fn check_depth(&self, threshold: u32) {
        match self.get_stats().await {
            Ok(stats) => {
                if stats.message_count >= threshold {
                    self.observer.on_alert(&DlqAlert {
                        queue: stats.queue.clone(),
                        depth: stats.message_count,
                        threshold,
                        raised_at: Utc::now(),
                    });
                }
                self.observer.on_stats(&stats);
            }
            Err(e) => self.observer.on_error(&e),
        }
    }

    pub async fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.token.cancel();
            if let Err(e) = monitor.task.await {
                warn!(error = %e, "DLQ monitor ended abnormally");
            }
            info!(queue = %self.queue(), "DLQ monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    pub async fn close(&self) {
        self.stop_monitoring().await;
    }
}

impl ReprocessReport {
    fn record_failure(&mut self, message_id: String, routing_key: Option<String>, error: String) {
        self.failed += 1;
        self.errors.push(error.clone());
        self.outcomes.push(MessageOutcome {
            message_id,
            routing_key,
            action: RedriveAction::Failed,
            error: Some(error),
        });
    }
}

async fn next_message(
    channel: &Arc<dyn BrokerChannel>,
    queue: &str,
    deadline: Instant,
) -> Result<Option<Delivery>> {
    match tokio::time::timeout_at(deadline, channel.get(queue)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(queue, "DLQ pass hit its time budget");
            Ok(None)
        }
    }
}

/// Returns held messages to the queue. Yields the tags actually returned.
async fn release(channel: &Arc<dyn BrokerChannel>, tags: &[u64]) -> Vec<u64> {
    let mut returned = Vec::with_capacity(tags.len());
    for &tag in tags {
        match channel.nack(tag, Nack::requeue()).await {
            Ok(()) => returned.push(tag),
            Err(e) => warn!(tag, error = %e, "Could not return message to DLQ"),
        }
    }
    returned
}
