//! Latency monitoring with rolling statistics.
//!
//! Samples are retained in bounded rings per (operation class, agent) pair
//! and pruned to the analysis window. Statistics are recomputed on demand
//! from the retained window; nothing is pre-aggregated.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::now_ts;
use crate::metrics;

/// Classes of operation the monitor distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    WorkflowExecution,
    AgentProcessing,
    DatabaseOperation,
    MessageDelivery,
    SafetyCheck,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::WorkflowExecution => "workflow_execution",
            OperationClass::AgentProcessing => "agent_processing",
            OperationClass::DatabaseOperation => "database_operation",
            OperationClass::MessageDelivery => "message_delivery",
            OperationClass::SafetyCheck => "safety_check",
        }
    }

    pub fn all() -> [OperationClass; 5] {
        [
            OperationClass::WorkflowExecution,
            OperationClass::AgentProcessing,
            OperationClass::DatabaseOperation,
            OperationClass::MessageDelivery,
            OperationClass::SafetyCheck,
        ]
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    duration: f64,
    success: bool,
    recorded_at: f64,
}

/// Rolling statistics over the retained window for one class (or agent).
#[derive(Debug, Clone, Serialize)]
pub struct LatencyStatistics {
    pub total_operations: usize,
    pub success_rate: f64,
    pub average_duration: f64,
    pub median_duration: f64,
    pub p95_duration: f64,
    pub p99_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    /// Fraction of samples at or under the SLA target.
    pub sla_compliance: f64,
    pub meets_sla: bool,
}

type SampleKey = (OperationClass, Option<String>);

pub struct LatencyMonitor {
    window_secs: f64,
    max_samples_per_key: usize,
    sla_target: f64,
    rings: RwLock<HashMap<SampleKey, VecDeque<LatencySample>>>,
}

impl LatencyMonitor {
    pub fn new(analysis_window_minutes: f64, max_samples_per_key: usize, sla_target: f64) -> Self {
        Self {
            window_secs: analysis_window_minutes * 60.0,
            max_samples_per_key: max_samples_per_key.max(1),
            sla_target,
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub fn sla_target(&self) -> f64 {
        self.sla_target
    }

    /// Record one operation sample.
    pub fn record(&self, class: OperationClass, agent_id: Option<&str>, duration: f64, success: bool) {
        let sample = LatencySample {
            duration,
            success,
            recorded_at: now_ts(),
        };
        metrics::OPERATION_DURATION_SECONDS.observe(duration);

        let mut rings = self.rings.write();
        let ring = rings
            .entry((class, agent_id.map(String::from)))
            .or_default();
        ring.push_back(sample);
        while ring.len() > self.max_samples_per_key {
            ring.pop_front();
        }
    }

    /// Statistics for one operation class, merged across all agents.
    pub fn statistics(&self, class: OperationClass) -> Option<LatencyStatistics> {
        let cutoff = now_ts() - self.window_secs;
        let samples: Vec<LatencySample> = self
            .rings
            .read()
            .iter()
            .filter(|((c, _), _)| *c == class)
            .flat_map(|(_, ring)| ring.iter().copied())
            .filter(|s| s.recorded_at >= cutoff)
            .collect();
        self.compute(samples)
    }

    /// Statistics for every class that has samples in the window.
    pub fn statistics_all(&self) -> HashMap<OperationClass, LatencyStatistics> {
        OperationClass::all()
            .into_iter()
            .filter_map(|class| self.statistics(class).map(|stats| (class, stats)))
            .collect()
    }

    /// Statistics for one agent, merged across operation classes. Feeds the
    /// scheduler's profile refresh.
    pub fn agent_statistics(&self, agent_id: &str) -> Option<LatencyStatistics> {
        let cutoff = now_ts() - self.window_secs;
        let samples: Vec<LatencySample> = self
            .rings
            .read()
            .iter()
            .filter(|((_, agent), _)| agent.as_deref() == Some(agent_id))
            .flat_map(|(_, ring)| ring.iter().copied())
            .filter(|s| s.recorded_at >= cutoff)
            .collect();
        self.compute(samples)
    }

    fn compute(&self, samples: Vec<LatencySample>) -> Option<LatencyStatistics> {
        if samples.is_empty() {
            return None;
        }

        let total = samples.len();
        let successes = samples.iter().filter(|s| s.success).count();
        let within_sla = samples
            .iter()
            .filter(|s| s.duration <= self.sla_target)
            .count();

        let mut durations: Vec<f64> = samples.iter().map(|s| s.duration).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let sum: f64 = durations.iter().sum();
        let sla_compliance = within_sla as f64 / total as f64;

        Some(LatencyStatistics {
            total_operations: total,
            success_rate: successes as f64 / total as f64,
            average_duration: sum / total as f64,
            median_duration: percentile(&durations, 0.50),
            p95_duration: percentile(&durations, 0.95),
            p99_duration: percentile(&durations, 0.99),
            min_duration: durations[0],
            max_duration: durations[total - 1],
            sla_compliance,
            meets_sla: sla_compliance >= 0.95,
        })
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> LatencyMonitor {
        LatencyMonitor::new(30.0, 1000, 2.0)
    }

    #[test]
    fn test_empty_monitor_has_no_statistics() {
        assert!(monitor().statistics(OperationClass::WorkflowExecution).is_none());
    }

    #[test]
    fn test_basic_statistics() {
        let monitor = monitor();
        for duration in [1.0, 2.0, 3.0, 4.0] {
            monitor.record(OperationClass::WorkflowExecution, None, duration, true);
        }
        monitor.record(OperationClass::WorkflowExecution, None, 5.0, false);

        let stats = monitor.statistics(OperationClass::WorkflowExecution).unwrap();
        assert_eq!(stats.total_operations, 5);
        assert_eq!(stats.success_rate, 0.8);
        assert_eq!(stats.average_duration, 3.0);
        assert_eq!(stats.min_duration, 1.0);
        assert_eq!(stats.max_duration, 5.0);
        assert_eq!(stats.median_duration, 3.0);
        // 2 of 5 samples are within the 2s target.
        assert_eq!(stats.sla_compliance, 0.4);
        assert!(!stats.meets_sla);
    }

    #[test]
    fn test_percentiles_over_uniform_spread() {
        let monitor = monitor();
        for i in 1..=100 {
            monitor.record(OperationClass::AgentProcessing, None, f64::from(i) / 100.0, true);
        }
        let stats = monitor.statistics(OperationClass::AgentProcessing).unwrap();
        assert!((stats.p95_duration - 0.95).abs() < 0.02);
        assert!((stats.p99_duration - 0.99).abs() < 0.02);
    }

    #[test]
    fn test_ring_is_bounded() {
        let monitor = LatencyMonitor::new(30.0, 10, 2.0);
        for _ in 0..100 {
            monitor.record(OperationClass::DatabaseOperation, Some("db-1"), 0.1, true);
        }
        let stats = monitor.statistics(OperationClass::DatabaseOperation).unwrap();
        assert_eq!(stats.total_operations, 10);
    }

    #[test]
    fn test_agent_statistics_isolated_per_agent() {
        let monitor = monitor();
        monitor.record(OperationClass::AgentProcessing, Some("ipa-0"), 1.0, true);
        monitor.record(OperationClass::AgentProcessing, Some("nga-0"), 3.0, false);

        let ipa = monitor.agent_statistics("ipa-0").unwrap();
        assert_eq!(ipa.total_operations, 1);
        assert_eq!(ipa.average_duration, 1.0);
        assert_eq!(ipa.success_rate, 1.0);

        let nga = monitor.agent_statistics("nga-0").unwrap();
        assert_eq!(nga.success_rate, 0.0);
    }

    #[test]
    fn test_class_statistics_merge_agents() {
        let monitor = monitor();
        monitor.record(OperationClass::AgentProcessing, Some("a"), 1.0, true);
        monitor.record(OperationClass::AgentProcessing, Some("b"), 3.0, true);
        let stats = monitor.statistics(OperationClass::AgentProcessing).unwrap();
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.average_duration, 2.0);
    }

    #[test]
    fn test_window_excludes_old_samples() {
        // Zero-width window: everything recorded is already outside it.
        let monitor = LatencyMonitor::new(0.0, 100, 2.0);
        monitor.record(OperationClass::WorkflowExecution, None, 1.0, true);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(monitor.statistics(OperationClass::WorkflowExecution).is_none());
    }
}
