//! Bottleneck identification and trend analysis over the latency monitor.
//!
//! Served through an analysis endpoint; findings never enter the event
//! fan-out directly. Detection rules operate on the rolling statistics of
//! the analysis window.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::events::now_ts;
use crate::performance::monitor::{LatencyMonitor, LatencyStatistics, OperationClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    AgentOverload,
    WorkflowCongestion,
    DatabaseLatency,
    ResourceContention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
    Volatile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
    NoData,
}

/// One identified bottleneck with its evidence and suggested remedies.
#[derive(Debug, Clone, Serialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub severity: f64,
    pub affected_class: OperationClass,
    pub description: String,
    pub evidence: HashMap<String, Value>,
    pub recommendations: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceTrend {
    pub class: OperationClass,
    pub direction: TrendDirection,
    pub strength: f64,
    pub current_mean: f64,
    pub predicted_mean: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub bottlenecks: Vec<Bottleneck>,
    pub trends: Vec<PerformanceTrend>,
    pub overall_health: HealthGrade,
    pub analysis_timestamp: f64,
}

pub struct PerformanceAnalytics {
    trend_points: usize,
    trend_history: Mutex<HashMap<OperationClass, VecDeque<f64>>>,
}

impl Default for PerformanceAnalytics {
    fn default() -> Self {
        Self::new(10)
    }
}

impl PerformanceAnalytics {
    pub fn new(trend_points: usize) -> Self {
        Self {
            trend_points: trend_points.max(3),
            trend_history: Mutex::new(HashMap::new()),
        }
    }

    /// Run the full analysis pass against the monitor's current window.
    pub fn analyze(&self, monitor: &LatencyMonitor) -> PerformanceReport {
        let statistics = monitor.statistics_all();
        if statistics.is_empty() {
            return PerformanceReport {
                bottlenecks: Vec::new(),
                trends: Vec::new(),
                overall_health: HealthGrade::NoData,
                analysis_timestamp: now_ts(),
            };
        }

        let mut bottlenecks = Vec::new();
        for (class, stats) in &statistics {
            bottlenecks.extend(check_agent_overload(*class, stats));
            bottlenecks.extend(check_workflow_congestion(*class, stats));
            bottlenecks.extend(check_database_latency(*class, stats));
            bottlenecks.extend(check_resource_contention(*class, stats));
        }
        bottlenecks.sort_by(|a, b| {
            b.severity
                .partial_cmp(&a.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let trends = self.update_trends(&statistics);
        let overall_health = health_grade(&statistics, &bottlenecks);

        PerformanceReport {
            bottlenecks,
            trends,
            overall_health,
            analysis_timestamp: now_ts(),
        }
    }

    fn update_trends(
        &self,
        statistics: &HashMap<OperationClass, LatencyStatistics>,
    ) -> Vec<PerformanceTrend> {
        let mut history = self.trend_history.lock();
        let mut trends = Vec::new();

        for (class, stats) in statistics {
            let series = history.entry(*class).or_default();
            series.push_back(stats.average_duration);
            while series.len() > self.trend_points {
                series.pop_front();
            }
            if series.len() >= 3 {
                if let Some(trend) = calculate_trend(*class, series, self.trend_points) {
                    trends.push(trend);
                }
            }
        }
        trends
    }
}

fn check_agent_overload(class: OperationClass, stats: &LatencyStatistics) -> Option<Bottleneck> {
    if stats.average_duration > 3.0 && stats.success_rate < 0.9 && stats.total_operations > 10 {
        Some(Bottleneck {
            kind: BottleneckKind::AgentOverload,
            severity: ((stats.average_duration - 2.0) / 3.0).min(1.0),
            affected_class: class,
            description: format!("agent overload detected for {class} operations"),
            evidence: HashMap::from([
                ("average_duration".to_string(), json!(stats.average_duration)),
                ("success_rate".to_string(), json!(stats.success_rate)),
                ("total_operations".to_string(), json!(stats.total_operations)),
                ("p95_duration".to_string(), json!(stats.p95_duration)),
            ]),
            recommendations: vec![
                "increase agent instance count".to_string(),
                "add request queuing and throttling".to_string(),
                "profile agent processing hot paths".to_string(),
            ],
            confidence: 0.8,
        })
    } else {
        None
    }
}

fn check_workflow_congestion(class: OperationClass, stats: &LatencyStatistics) -> Option<Bottleneck> {
    if class == OperationClass::WorkflowExecution
        && stats.p95_duration > 4.0
        && stats.average_duration < 2.0
    {
        Some(Bottleneck {
            kind: BottleneckKind::WorkflowCongestion,
            severity: ((stats.p95_duration - 2.0) / 8.0).min(1.0),
            affected_class: class,
            description: "workflow congestion causing high tail latencies".to_string(),
            evidence: HashMap::from([
                ("p95_duration".to_string(), json!(stats.p95_duration)),
                ("p99_duration".to_string(), json!(stats.p99_duration)),
                ("average_duration".to_string(), json!(stats.average_duration)),
            ]),
            recommendations: vec![
                "prioritize workflows in the scheduling queue".to_string(),
                "cap concurrent workflows per agent pool".to_string(),
            ],
            confidence: 0.7,
        })
    } else {
        None
    }
}

fn check_database_latency(class: OperationClass, stats: &LatencyStatistics) -> Option<Bottleneck> {
    if class == OperationClass::DatabaseOperation
        && stats.median_duration > 1.0
        && stats.min_duration > 0.5
    {
        Some(Bottleneck {
            kind: BottleneckKind::DatabaseLatency,
            severity: (stats.median_duration / 5.0).min(1.0),
            affected_class: class,
            description: "database operations showing consistently high latency".to_string(),
            evidence: HashMap::from([
                ("median_duration".to_string(), json!(stats.median_duration)),
                ("min_duration".to_string(), json!(stats.min_duration)),
                ("max_duration".to_string(), json!(stats.max_duration)),
            ]),
            recommendations: vec![
                "pool session-store connections".to_string(),
                "cache hot lookups".to_string(),
                "review store indexing".to_string(),
            ],
            confidence: 0.9,
        })
    } else {
        None
    }
}

fn check_resource_contention(class: OperationClass, stats: &LatencyStatistics) -> Option<Bottleneck> {
    if stats.total_operations <= 5 || stats.average_duration <= 1.0 {
        return None;
    }
    let variance_indicator = (stats.max_duration - stats.min_duration) / stats.average_duration;
    if variance_indicator > 3.0 {
        Some(Bottleneck {
            kind: BottleneckKind::ResourceContention,
            severity: (variance_indicator / 10.0).min(1.0),
            affected_class: class,
            description: format!(
                "high variance in {class} response times indicates resource contention"
            ),
            evidence: HashMap::from([
                ("variance_indicator".to_string(), json!(variance_indicator)),
                ("min_duration".to_string(), json!(stats.min_duration)),
                ("max_duration".to_string(), json!(stats.max_duration)),
                ("average_duration".to_string(), json!(stats.average_duration)),
            ]),
            recommendations: vec![
                "pool contended resources".to_string(),
                "monitor per-resource utilization".to_string(),
            ],
            confidence: 0.6,
        })
    } else {
        None
    }
}

fn calculate_trend(
    class: OperationClass,
    series: &VecDeque<f64>,
    trend_points: usize,
) -> Option<PerformanceTrend> {
    let n = series.len();
    if n < 3 {
        return None;
    }

    let points: Vec<f64> = series.iter().copied().collect();
    let x_mean = (n as f64 - 1.0) / 2.0;
    let y_mean = points.iter().sum::<f64>() / n as f64;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, y) in points.iter().enumerate() {
        let dx = x as f64 - x_mean;
        numerator += dx * (y - y_mean);
        denominator += dx * dx;
    }
    let slope = if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    };

    let stdev = {
        let var = points.iter().map(|y| (y - y_mean).powi(2)).sum::<f64>() / n as f64;
        var.sqrt()
    };

    let (direction, strength) = if y_mean > 0.0 && stdev > y_mean * 0.5 {
        (TrendDirection::Volatile, stdev / y_mean)
    } else if slope.abs() < 0.01 {
        (TrendDirection::Stable, 0.0)
    } else if slope > 0.0 {
        (TrendDirection::Degrading, (slope.abs() * 10.0).min(1.0))
    } else {
        (TrendDirection::Improving, (slope.abs() * 10.0).min(1.0))
    };

    Some(PerformanceTrend {
        class,
        direction,
        strength,
        current_mean: points[n - 1],
        predicted_mean: (points[n - 1] + slope * 5.0).max(0.0),
        confidence: (n as f64 / trend_points as f64).min(1.0),
    })
}

fn health_grade(
    statistics: &HashMap<OperationClass, LatencyStatistics>,
    bottlenecks: &[Bottleneck],
) -> HealthGrade {
    if statistics.is_empty() {
        return HealthGrade::NoData;
    }
    let sla_rate = statistics.values().filter(|s| s.meets_sla).count() as f64
        / statistics.len() as f64;
    let max_severity = bottlenecks
        .iter()
        .map(|b| b.severity)
        .fold(0.0_f64, f64::max);
    let score = sla_rate * (1.0 - max_severity * 0.5);

    if score >= 0.9 {
        HealthGrade::Excellent
    } else if score >= 0.7 {
        HealthGrade::Good
    } else if score >= 0.5 {
        HealthGrade::Fair
    } else if score >= 0.3 {
        HealthGrade::Poor
    } else {
        HealthGrade::Critical
    }
}
