//! Threshold alerting over the latency monitor.
//!
//! Rules are evaluated on a fixed cadence through a pluggable query
//! evaluator. Alert state is keyed by (rule, label set); firing and
//! resolution are distinct deliveries, and a per-key cooldown suppresses
//! flapping so handlers see at most one fire and one resolve per episode.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::performance::monitor::{LatencyMonitor, OperationClass};

const MAX_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Resolved,
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparison {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Gte => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Lte => value <= threshold,
            Comparison::Eq => value == threshold,
        }
    }
}

/// The statistic a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatistic {
    Mean,
    Median,
    P95,
    P99,
    SuccessRate,
    ErrorRate,
    SlaCompliance,
    Count,
}

/// Typed metric query: one statistic of one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub class: OperationClass,
    pub statistic: MetricStatistic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub description: String,
    pub query: MetricQuery,
    pub threshold: f64,
    pub comparison: Comparison,
    pub severity: AlertSeverity,
    /// Seconds the condition must plausibly span; informational for now.
    pub duration: u64,
    pub enabled: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub status: AlertState,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Delivers alert transitions to an external channel. Failures are logged,
/// never propagated into rule evaluation.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert);
}

/// Tracing-based notifier.
pub struct ConsoleNotifier;

#[async_trait]
impl AlertNotifier for ConsoleNotifier {
    async fn notify(&self, alert: &Alert) {
        match alert.status {
            AlertState::Active => warn!(
                rule = %alert.rule_name,
                value = alert.value,
                threshold = alert.threshold,
                "alert fired: {}",
                alert.message
            ),
            _ => info!(rule = %alert.rule_name, "alert resolved: {}", alert.message),
        }
    }
}

/// POSTs alert transitions as JSON.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) {
        let payload = serde_json::json!({ "alert": alert });
        if let Err(err) = self.client.post(&self.url).json(&payload).send().await {
            error!("failed to deliver webhook notification: {}", err);
        }
    }
}

/// Evaluates a metric query into zero or more (label set, value) series.
pub trait QueryEvaluator: Send + Sync {
    fn evaluate(&self, query: &MetricQuery) -> Vec<(BTreeMap<String, String>, f64)>;
}

/// Default evaluator backed by the latency monitor's rolling statistics.
pub struct LatencyQueryEvaluator {
    monitor: Arc<LatencyMonitor>,
}

impl LatencyQueryEvaluator {
    pub fn new(monitor: Arc<LatencyMonitor>) -> Self {
        Self { monitor }
    }
}

impl QueryEvaluator for LatencyQueryEvaluator {
    fn evaluate(&self, query: &MetricQuery) -> Vec<(BTreeMap<String, String>, f64)> {
        let Some(stats) = self.monitor.statistics(query.class) else {
            return Vec::new();
        };
        let value = match query.statistic {
            MetricStatistic::Mean => stats.average_duration,
            MetricStatistic::Median => stats.median_duration,
            MetricStatistic::P95 => stats.p95_duration,
            MetricStatistic::P99 => stats.p99_duration,
            MetricStatistic::SuccessRate => stats.success_rate,
            MetricStatistic::ErrorRate => 1.0 - stats.success_rate,
            MetricStatistic::SlaCompliance => stats.sla_compliance,
            MetricStatistic::Count => stats.total_operations as f64,
        };
        let labels = BTreeMap::from([(
            "operation_class".to_string(),
            query.class.as_str().to_string(),
        )]);
        vec![(labels, value)]
    }
}

struct ActiveEntry {
    alert: Alert,
    /// False when the fire landed inside the cooldown window; such an alert
    /// resolves silently too.
    delivered: bool,
}

pub struct AlertManager {
    rules: RwLock<HashMap<String, AlertRule>>,
    notifiers: RwLock<Vec<Arc<dyn AlertNotifier>>>,
    evaluator: Arc<dyn QueryEvaluator>,
    active: Mutex<HashMap<String, ActiveEntry>>,
    history: Mutex<Vec<Alert>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    check_interval: Duration,
    cooldown: Duration,
}

impl AlertManager {
    pub fn new(evaluator: Arc<dyn QueryEvaluator>, check_interval: f64, cooldown: f64) -> Self {
        let manager = Self {
            rules: RwLock::new(HashMap::new()),
            notifiers: RwLock::new(Vec::new()),
            evaluator,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            cooldowns: Mutex::new(HashMap::new()),
            check_interval: Duration::from_secs_f64(check_interval.max(0.01)),
            cooldown: Duration::from_secs_f64(cooldown.max(0.0)),
        };
        for rule in default_rules() {
            manager.rules.write().insert(rule.name.clone(), rule);
        }
        manager
    }

    pub fn add_rule(&self, rule: AlertRule) {
        info!(rule = %rule.name, "added alert rule");
        self.rules.write().insert(rule.name.clone(), rule);
    }

    pub fn remove_rule(&self, name: &str) {
        if self.rules.write().remove(name).is_some() {
            info!(rule = name, "removed alert rule");
        }
    }

    pub fn add_notifier(&self, notifier: Arc<dyn AlertNotifier>) {
        self.notifiers.write().push(notifier);
    }

    /// Evaluation loop; exits on cancellation only.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {
                    self.check_all_rules().await;
                }
            }
        }
        debug!("alert check loop exited");
    }

    pub async fn check_all_rules(&self) {
        let rules: Vec<AlertRule> = self
            .rules
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        for rule in rules {
            self.check_rule(&rule).await;
        }
    }

    async fn check_rule(&self, rule: &AlertRule) {
        let series = self.evaluator.evaluate(&rule.query);
        for (mut labels, value) in series {
            for (key, val) in &rule.labels {
                labels.insert(key.clone(), val.clone());
            }
            let key = alert_key(&rule.name, &labels);
            let triggered = rule.comparison.evaluate(value, rule.threshold);

            if triggered {
                self.trigger_alert(rule, key, labels, value).await;
            } else {
                self.resolve_alert(&key).await;
            }
        }
    }

    async fn trigger_alert(
        &self,
        rule: &AlertRule,
        key: String,
        labels: BTreeMap<String, String>,
        value: f64,
    ) {
        let to_deliver = {
            let mut active = self.active.lock();
            if active.contains_key(&key) {
                return;
            }

            let alert = Alert {
                rule_name: rule.name.clone(),
                severity: rule.severity,
                status: AlertState::Active,
                message: format_message(rule, &labels, value),
                value,
                threshold: rule.threshold,
                started_at: Utc::now(),
                resolved_at: None,
                acknowledged_at: None,
                labels,
                annotations: rule.annotations.clone(),
            };

            let within_cooldown = self
                .cooldowns
                .lock()
                .get(&key)
                .map(|fired| fired.elapsed() < self.cooldown)
                .unwrap_or(false);

            self.history_push(alert.clone());
            metrics::ALERTS_FIRED.inc();

            if within_cooldown {
                debug!(rule = %rule.name, "alert fired within cooldown, delivery suppressed");
                active.insert(
                    key,
                    ActiveEntry {
                        alert,
                        delivered: false,
                    },
                );
                None
            } else {
                self.cooldowns.lock().insert(key.clone(), Instant::now());
                active.insert(
                    key,
                    ActiveEntry {
                        alert: alert.clone(),
                        delivered: true,
                    },
                );
                Some(alert)
            }
        };

        if let Some(alert) = to_deliver {
            warn!(rule = %alert.rule_name, "alert triggered: {}", alert.message);
            self.deliver(&alert).await;
        }
    }

    async fn resolve_alert(&self, key: &str) {
        let resolved = {
            let mut active = self.active.lock();
            let Some(mut entry) = active.remove(key) else {
                return;
            };
            entry.alert.status = AlertState::Resolved;
            entry.alert.resolved_at = Some(Utc::now());
            self.history_push(entry.alert.clone());
            metrics::ALERTS_RESOLVED.inc();
            entry.delivered.then_some(entry.alert)
        };

        if let Some(alert) = resolved {
            info!(rule = %alert.rule_name, "alert resolved: {}", alert.message);
            self.deliver(&alert).await;
        }
    }

    async fn deliver(&self, alert: &Alert) {
        let notifiers: Vec<Arc<dyn AlertNotifier>> = self.notifiers.read().clone();
        for notifier in notifiers {
            // A panicking or failing handler must never abort evaluation.
            notifier.notify(alert).await;
        }
    }

    fn history_push(&self, alert: Alert) {
        let mut history = self.history.lock();
        history.push(alert);
        let overflow = history.len().saturating_sub(MAX_HISTORY);
        if overflow > 0 {
            history.drain(..overflow);
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active
            .lock()
            .values()
            .map(|entry| entry.alert.clone())
            .collect()
    }

    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock();
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn acknowledge(&self, key: &str) -> bool {
        let mut active = self.active.lock();
        match active.get_mut(key) {
            Some(entry) => {
                entry.alert.status = AlertState::Acknowledged;
                entry.alert.acknowledged_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }
}

fn alert_key(rule_name: &str, labels: &BTreeMap<String, String>) -> String {
    let mut hasher = DefaultHasher::new();
    for (key, value) in labels {
        key.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    format!("{}_{:x}", rule_name, hasher.finish())
}

fn format_message(rule: &AlertRule, labels: &BTreeMap<String, String>, value: f64) -> String {
    let template = rule
        .annotations
        .get("summary")
        .cloned()
        .unwrap_or_else(|| rule.description.clone());
    let mut message = template.replace("{{$value}}", &format!("{value:.2}"));
    for (key, val) in labels {
        message = message.replace(&format!("{{{{$labels.{key}}}}}"), val);
    }
    message
}

/// Rules every deployment starts with.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            name: "slow_workflow_p95".to_string(),
            description: "workflow p95 latency above target".to_string(),
            query: MetricQuery {
                class: OperationClass::WorkflowExecution,
                statistic: MetricStatistic::P95,
            },
            threshold: 2.0,
            comparison: Comparison::Gt,
            severity: AlertSeverity::Warning,
            duration: 300,
            enabled: true,
            labels: BTreeMap::new(),
            annotations: BTreeMap::from([(
                "summary".to_string(),
                "workflow p95 latency is {{$value}}s".to_string(),
            )]),
        },
        AlertRule {
            name: "high_agent_error_rate".to_string(),
            description: "agent error rate above 10%".to_string(),
            query: MetricQuery {
                class: OperationClass::AgentProcessing,
                statistic: MetricStatistic::ErrorRate,
            },
            threshold: 0.10,
            comparison: Comparison::Gt,
            severity: AlertSeverity::Critical,
            duration: 120,
            enabled: true,
            labels: BTreeMap::new(),
            annotations: BTreeMap::from([(
                "summary".to_string(),
                "agent error rate is {{$value}}".to_string(),
            )]),
        },
        AlertRule {
            name: "session_store_latency".to_string(),
            description: "session store median latency above 1s".to_string(),
            query: MetricQuery {
                class: OperationClass::DatabaseOperation,
                statistic: MetricStatistic::Median,
            },
            threshold: 1.0,
            comparison: Comparison::Gt,
            severity: AlertSeverity::Warning,
            duration: 300,
            enabled: true,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Evaluator returning a programmable value.
    struct FixedEvaluator {
        value: RwLock<Option<f64>>,
    }

    impl FixedEvaluator {
        fn new(value: f64) -> Arc<Self> {
            Arc::new(Self {
                value: RwLock::new(Some(value)),
            })
        }

        fn set(&self, value: f64) {
            *self.value.write() = Some(value);
        }
    }

    impl QueryEvaluator for FixedEvaluator {
        fn evaluate(&self, query: &MetricQuery) -> Vec<(BTreeMap<String, String>, f64)> {
            match *self.value.read() {
                Some(value) => vec![(
                    BTreeMap::from([(
                        "operation_class".to_string(),
                        query.class.as_str().to_string(),
                    )]),
                    value,
                )],
                None => Vec::new(),
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        fires: AtomicUsize,
        resolves: AtomicUsize,
    }

    #[async_trait]
    impl AlertNotifier for RecordingNotifier {
        async fn notify(&self, alert: &Alert) {
            match alert.status {
                AlertState::Active => self.fires.fetch_add(1, Ordering::SeqCst),
                _ => self.resolves.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    fn p95_rule(threshold: f64) -> AlertRule {
        AlertRule {
            name: "test_p95".to_string(),
            description: "p95 too high".to_string(),
            query: MetricQuery {
                class: OperationClass::WorkflowExecution,
                statistic: MetricStatistic::P95,
            },
            threshold,
            comparison: Comparison::Gt,
            severity: AlertSeverity::Warning,
            duration: 60,
            enabled: true,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    fn bare_manager(evaluator: Arc<dyn QueryEvaluator>, cooldown: f64) -> AlertManager {
        let manager = AlertManager::new(evaluator, 1.0, cooldown);
        // Isolate tests from the default rule set.
        for rule in default_rules() {
            manager.remove_rule(&rule.name);
        }
        manager
    }

    #[tokio::test]
    async fn test_alert_fires_once_and_resolves_once() {
        let evaluator = FixedEvaluator::new(2.5);
        let manager = bare_manager(evaluator.clone(), 300.0);
        manager.add_rule(p95_rule(2.0));
        let notifier = Arc::new(RecordingNotifier::default());
        manager.add_notifier(notifier.clone());

        manager.check_all_rules().await;
        manager.check_all_rules().await;
        assert_eq!(notifier.fires.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_alerts().len(), 1);

        evaluator.set(1.0);
        manager.check_all_rules().await;
        assert_eq!(notifier.resolves.load(Ordering::SeqCst), 1);
        assert!(manager.active_alerts().is_empty());
        let history = manager.alert_history(10);
        assert_eq!(history.len(), 2);
        assert!(history[1].resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_flap_within_cooldown_delivers_once() {
        let evaluator = FixedEvaluator::new(2.5);
        let manager = bare_manager(evaluator.clone(), 300.0);
        manager.add_rule(p95_rule(2.0));
        let notifier = Arc::new(RecordingNotifier::default());
        manager.add_notifier(notifier.clone());

        // Fire, resolve, fire again, resolve again, all inside the cooldown.
        manager.check_all_rules().await;
        evaluator.set(1.0);
        manager.check_all_rules().await;
        evaluator.set(2.5);
        manager.check_all_rules().await;
        evaluator.set(1.0);
        manager.check_all_rules().await;

        assert_eq!(notifier.fires.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refire_after_cooldown_delivers_again() {
        let evaluator = FixedEvaluator::new(2.5);
        let manager = bare_manager(evaluator.clone(), 0.0);
        manager.add_rule(p95_rule(2.0));
        let notifier = Arc::new(RecordingNotifier::default());
        manager.add_notifier(notifier.clone());

        manager.check_all_rules().await;
        evaluator.set(1.0);
        manager.check_all_rules().await;
        evaluator.set(2.5);
        manager.check_all_rules().await;

        assert_eq!(notifier.fires.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_comparisons() {
        assert!(Comparison::Gt.evaluate(2.0, 1.0));
        assert!(Comparison::Gte.evaluate(1.0, 1.0));
        assert!(Comparison::Lt.evaluate(0.5, 1.0));
        assert!(Comparison::Lte.evaluate(1.0, 1.0));
        assert!(Comparison::Eq.evaluate(1.0, 1.0));
        assert!(!Comparison::Gt.evaluate(1.0, 1.0));
    }

    #[tokio::test]
    async fn test_message_formatting() {
        let mut rule = p95_rule(2.0);
        rule.annotations.insert(
            "summary".to_string(),
            "p95 is {{$value}}s on {{$labels.operation_class}}".to_string(),
        );
        let labels = BTreeMap::from([(
            "operation_class".to_string(),
            "workflow_execution".to_string(),
        )]);
        let message = format_message(&rule, &labels, 2.5);
        assert_eq!(message, "p95 is 2.50s on workflow_execution");
    }

    #[tokio::test]
    async fn test_acknowledge_active_alert() {
        let evaluator = FixedEvaluator::new(2.5);
        let manager = bare_manager(evaluator, 300.0);
        manager.add_rule(p95_rule(2.0));
        manager.check_all_rules().await;

        let alerts = manager.active_alerts();
        let labels = &alerts[0].labels;
        let key = alert_key("test_p95", labels);
        assert!(manager.acknowledge(&key));
        let alerts = manager.active_alerts();
        assert_eq!(alerts[0].status, AlertState::Acknowledged);
    }

    #[tokio::test]
    async fn test_evaluator_backed_by_monitor() {
        let monitor = Arc::new(LatencyMonitor::new(30.0, 100, 2.0));
        for _ in 0..10 {
            monitor.record(OperationClass::WorkflowExecution, None, 3.0, true);
        }
        let evaluator = LatencyQueryEvaluator::new(monitor);
        let series = evaluator.evaluate(&MetricQuery {
            class: OperationClass::WorkflowExecution,
            statistic: MetricStatistic::P95,
        });
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].1, 3.0);
    }

    #[tokio::test]
    async fn test_disabled_rule_is_skipped() {
        let evaluator = FixedEvaluator::new(2.5);
        let manager = bare_manager(evaluator, 300.0);
        let mut rule = p95_rule(2.0);
        rule.enabled = false;
        manager.add_rule(rule);
        let notifier = Arc::new(RecordingNotifier::default());
        manager.add_notifier(notifier.clone());

        manager.check_all_rules().await;
        assert_eq!(notifier.fires.load(Ordering::SeqCst), 0);
    }
}
