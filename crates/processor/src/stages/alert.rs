//! Per-event alert rules
//!
//! Rules are evaluated against every event that made it through filtering,
//! transformation and enrichment, independently of windowing. Firings go to
//! [`AlertChannel`]s through the [`AlertDispatcher`], which gives every
//! channel its own bounded queue and worker task. The processing loop never
//! waits on a channel: a firing that finds its queue full is dropped and
//! counted as a failure.

use crate::config::AlertRule;
use crate::error::{ValidationError, ValidationResult};
use crate::expr::CompiledExpr;
use crate::metrics::StreamMetrics;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use stream_analytics_types::{AlertFiring, AlertSeverity, Event, StreamId};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Alert channel errors
#[derive(Error, Debug, Clone)]
pub enum AlertError {
    #[error("alert channel '{channel}' failed: {reason}")]
    Delivery { channel: String, reason: String },
}

/// Destination for alert firings
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn notify(&self, firing: &AlertFiring) -> Result<(), AlertError>;

    fn name(&self) -> &str;
}

/// Writes firings to the log at a level matching their severity
#[derive(Debug, Clone, Default)]
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn notify(&self, firing: &AlertFiring) -> Result<(), AlertError> {
        match firing.severity {
            AlertSeverity::Info => info!(
                stream_id = %firing.stream_id,
                rule = %firing.rule_id,
                message = %firing.message,
                "Alert fired"
            ),
            AlertSeverity::Warning => warn!(
                stream_id = %firing.stream_id,
                rule = %firing.rule_id,
                message = %firing.message,
                "Alert fired"
            ),
            AlertSeverity::Critical => error!(
                stream_id = %firing.stream_id,
                rule = %firing.rule_id,
                message = %firing.message,
                "Alert fired"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Keeps firings in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryAlertChannel {
    firings: Arc<Mutex<Vec<AlertFiring>>>,
}

impl MemoryAlertChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn firings(&self) -> Vec<AlertFiring> {
        self.firings.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.firings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.firings.lock().is_empty()
    }
}

#[async_trait]
impl AlertChannel for MemoryAlertChannel {
    async fn notify(&self, firing: &AlertFiring) -> Result<(), AlertError> {
        self.firings.lock().push(firing.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct AlertWorker {
    channel: String,
    tx: mpsc::Sender<Arc<AlertFiring>>,
    task: JoinHandle<()>,
}

/// Bounded per-channel delivery of alert firings
pub struct AlertDispatcher {
    workers: Vec<AlertWorker>,
    metrics: StreamMetrics,
}

impl AlertDispatcher {
    /// Start one worker per channel, each behind a queue of `capacity` firings
    pub fn spawn(channels: &[Arc<dyn AlertChannel>], capacity: usize, metrics: StreamMetrics) -> Self {
        let workers = channels
            .iter()
            .map(|channel| {
                let (tx, mut rx) = mpsc::channel::<Arc<AlertFiring>>(capacity.max(1));
                let channel = Arc::clone(channel);
                let metrics = metrics.clone();
                let name = channel.name().to_string();
                let task = tokio::spawn(async move {
                    while let Some(firing) = rx.recv().await {
                        if let Err(e) = channel.notify(&firing).await {
                            metrics.alert_failures.inc();
                            warn!(
                                channel = channel.name(),
                                rule = %firing.rule_id,
                                error = %e,
                                "Alert notification failed"
                            );
                        }
                    }
                });
                AlertWorker { channel: name, tx, task }
            })
            .collect();
        Self { workers, metrics }
    }

    /// Queue a firing for every channel without waiting
    pub fn notify(&self, firing: AlertFiring) {
        let firing = Arc::new(firing);
        for worker in &self.workers {
            match worker.tx.try_send(Arc::clone(&firing)) {
                Ok(()) => {}
                Err(TrySendError::Full(firing)) => {
                    self.metrics.alert_failures.inc();
                    warn!(
                        channel = %worker.channel,
                        rule = %firing.rule_id,
                        "Alert queue full, dropping notification"
                    );
                }
                Err(TrySendError::Closed(firing)) => {
                    self.metrics.alert_failures.inc();
                    warn!(
                        channel = %worker.channel,
                        rule = %firing.rule_id,
                        "Alert worker stopped, dropping notification"
                    );
                }
            }
        }
    }

    pub fn channels(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.channel.as_str()).collect()
    }

    /// Close the queues and wait for queued firings to be delivered
    pub async fn shutdown(self) {
        for AlertWorker { channel, tx, task } in self.workers {
            drop(tx);
            if let Err(e) = task.await {
                error!(channel = %channel, error = %e, "Alert worker task failed");
            }
        }
    }
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("channels", &self.channels())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: AlertRule,
    condition: CompiledExpr,
    last_fired_ms: Option<i64>,
}

/// Evaluates alert rules per event with event-time cooldowns
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    stream_id: StreamId,
    rules: Vec<CompiledRule>,
    fired: u64,
    evaluation_errors: u64,
}

impl AlertEvaluator {
    pub fn new(stream_id: StreamId, rules: &[AlertRule]) -> ValidationResult<Self> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let condition = CompiledExpr::parse(&rule.condition).map_err(|source| {
                    ValidationError::Expression {
                        path: format!("alerts[{}].condition", i),
                        source,
                    }
                })?;
                Ok(CompiledRule {
                    rule: rule.clone(),
                    condition,
                    last_fired_ms: None,
                })
            })
            .collect::<ValidationResult<Vec<_>>>()?;
        Ok(Self {
            stream_id,
            rules,
            fired: 0,
            evaluation_errors: 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules that fire for this event
    pub fn evaluate(&mut self, event: &Event) -> Vec<AlertFiring> {
        let t = event.event_time_ms();
        let mut firings = Vec::new();

        for compiled in &mut self.rules {
            match compiled.condition.evaluate_condition(event) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.evaluation_errors += 1;
                    debug!(rule = %compiled.rule.id, error = %e, "Alert condition failed");
                    continue;
                }
            }

            let cooldown = i64::try_from(compiled.rule.cooldown_ms).unwrap_or(i64::MAX);
            if let Some(last) = compiled.last_fired_ms {
                if t.saturating_sub(last) < cooldown {
                    continue;
                }
            }
            compiled.last_fired_ms = Some(t);
            self.fired += 1;

            let rule = &compiled.rule;
            let message = match &rule.message {
                Some(template) => render_message(template, event),
                None => format!("{} matched: {}", rule.display_name(), rule.condition),
            };
            firings.push(AlertFiring {
                id: Uuid::new_v4(),
                stream_id: self.stream_id.clone(),
                rule_id: rule.id.clone(),
                rule_name: rule.display_name().to_string(),
                severity: rule.severity,
                message,
                event_id: event.id,
                event_time: event.event_time,
                fired_at: Utc::now(),
            });
        }

        firings
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    pub fn evaluation_errors(&self) -> u64 {
        self.evaluation_errors
    }
}

/// Replace `{field}` placeholders with event values; unknown fields render empty
pub fn render_message(template: &str, event: &Event) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let field = after[..close].trim();
                match event.field(field) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {}
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
