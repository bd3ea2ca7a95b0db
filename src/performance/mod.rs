//! Performance monitoring, scheduling, analytics, and alerting.

pub mod alerts;
pub mod analytics;
pub mod integration;
pub mod monitor;
pub mod scheduler;

pub use alerts::{Alert, AlertManager, AlertNotifier, AlertRule};
pub use analytics::{PerformanceAnalytics, PerformanceReport};
pub use monitor::{LatencyMonitor, LatencyStatistics, OperationClass};
pub use scheduler::{AgentCoordinator, SchedulingDecision, SchedulingStrategy, WorkflowRequest};
