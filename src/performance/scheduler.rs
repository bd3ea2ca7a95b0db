//! Intelligent workflow scheduling across the agent pool.
//!
//! Requests queue by priority (deadline-aware), a strategy family selects
//! one agent per required kind from live performance profiles, and selected
//! agents are reserved until released. Profiles refresh from the latency
//! monitor on a background loop.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agents::{AgentKind, AgentProxyRegistry, AgentRequest, AgentResult};
use crate::errors::{FabricError, Result};
use crate::events::now_ts;
use crate::metrics;
use crate::performance::monitor::{LatencyMonitor, OperationClass};
use crate::platform::config::OptimizationSettings;

const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Strategy family for agent selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    FastestFirst,
    LoadBalanced,
    Predictive,
    #[default]
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLoadLevel {
    Idle,
    Low,
    Medium,
    High,
    Overloaded,
}

/// Live performance profile for one agent instance.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPerformanceProfile {
    pub agent_id: String,
    pub kind: AgentKind,
    pub average_response_time: f64,
    pub success_rate: f64,
    pub current_load: u32,
    pub max_concurrent: u32,
    pub last_activity: f64,
    /// Positive = improving, negative = degrading.
    pub performance_trend: f64,
    pub reliability_score: f64,
}

impl AgentPerformanceProfile {
    fn new(agent_id: String, kind: AgentKind, max_concurrent: u32) -> Self {
        Self {
            agent_id,
            kind,
            average_response_time: 1.0,
            success_rate: 1.0,
            current_load: 0,
            max_concurrent: max_concurrent.max(1),
            last_activity: now_ts(),
            performance_trend: 0.0,
            reliability_score: 1.0,
        }
    }

    pub fn load_level(&self) -> AgentLoadLevel {
        if self.current_load == 0 {
            return AgentLoadLevel::Idle;
        }
        let ratio = f64::from(self.current_load) / f64::from(self.max_concurrent.max(1));
        if ratio >= 1.0 {
            AgentLoadLevel::Overloaded
        } else if ratio >= 0.8 {
            AgentLoadLevel::High
        } else if ratio >= 0.5 {
            AgentLoadLevel::Medium
        } else {
            AgentLoadLevel::Low
        }
    }

    /// Lower response time, higher success, higher reliability = better.
    pub fn efficiency_score(&self) -> f64 {
        if self.average_response_time <= 0.0 {
            return 0.0;
        }
        let time_score = (1.0 - self.average_response_time / 5.0).max(0.0);
        time_score * 0.4 + self.success_rate * 0.4 + self.reliability_score * 0.2
    }

    /// Predicted completion time and a confidence grade for it.
    pub fn predict(&self, estimated_duration: f64) -> (f64, f64) {
        let load_factor = 1.0 + f64::from(self.current_load) * 0.15;
        let trend_factor = 1.0 - self.performance_trend * 0.1;
        let complexity_factor = 1.0 + (estimated_duration - 1.0).max(0.0) * 0.1;
        let predicted = self.average_response_time * load_factor * trend_factor * complexity_factor;

        let idle_secs = (now_ts() - self.last_activity).max(0.0);
        let activity_factor = (1.0 - idle_secs / 3600.0).max(0.5);
        (predicted, self.reliability_score * activity_factor)
    }
}

/// A workflow execution request awaiting scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub request_id: String,
    pub workflow_type: String,
    /// 1 (highest) to 5 (lowest).
    pub priority: u8,
    pub estimated_duration: f64,
    pub required_agents: Vec<AgentKind>,
    pub user_id: Option<String>,
    pub deadline: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowRequest {
    /// Queue score; lower is scheduled earlier. Deadline pressure shrinks
    /// the score of urgent requests.
    pub fn priority_score(&self) -> f64 {
        let base = f64::from(self.priority.clamp(1, 5));
        match self.deadline {
            Some(deadline) => {
                let minutes_left = (deadline - now_ts()) / 60.0;
                let urgency = (1.0 / minutes_left.max(1.0)).max(0.1);
                base * urgency
            }
            None => base,
        }
    }
}

/// Outcome of a scheduling attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulingDecision {
    pub request_id: String,
    pub selected_agents: HashMap<AgentKind, String>,
    pub estimated_completion_time: f64,
    pub confidence: f64,
    pub reasoning: String,
}

struct QueuedRequest {
    score: f64,
    seq: u64,
    request: WorkflowRequest,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the lowest score pops first,
        // FIFO within equal scores.
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub registered_agents: usize,
    pub active_requests: usize,
    pub queued_requests: usize,
    pub strategy: SchedulingStrategy,
    pub system_load: f64,
    pub performance_variance: f64,
    pub profiles: HashMap<String, AgentPerformanceProfile>,
}

pub struct AgentCoordinator {
    settings: OptimizationSettings,
    monitor: Arc<LatencyMonitor>,
    profiles: RwLock<HashMap<String, Arc<RwLock<AgentPerformanceProfile>>>>,
    queue: Mutex<BinaryHeap<QueuedRequest>>,
    seq: AtomicU64,
    active: RwLock<HashMap<String, SchedulingDecision>>,
}

impl AgentCoordinator {
    pub fn new(settings: OptimizationSettings, monitor: Arc<LatencyMonitor>) -> Self {
        Self {
            settings,
            monitor,
            profiles: RwLock::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_agent(&self, agent_id: &str, kind: AgentKind, max_concurrent: u32) {
        let profile = AgentPerformanceProfile::new(agent_id.to_string(), kind, max_concurrent);
        self.profiles
            .write()
            .insert(agent_id.to_string(), Arc::new(RwLock::new(profile)));
        info!(agent_id, kind = %kind, "registered agent with coordinator");
    }

    pub fn deregister_agent(&self, agent_id: &str) {
        self.profiles.write().remove(agent_id);
    }

    pub fn profile(&self, agent_id: &str) -> Option<AgentPerformanceProfile> {
        self.profiles
            .read()
            .get(agent_id)
            .map(|p| p.read().clone())
    }

    fn profile_handles(&self) -> Vec<Arc<RwLock<AgentPerformanceProfile>>> {
        self.profiles.read().values().cloned().collect()
    }

    fn snapshot_profiles(&self) -> Vec<AgentPerformanceProfile> {
        self.profile_handles()
            .iter()
            .map(|p| p.read().clone())
            .collect()
    }

    /// Attempt to schedule a request immediately. `None` means no strategy
    /// found capacity; the request is queued for the scheduler loop to retry.
    pub fn schedule_workflow(&self, request: WorkflowRequest) -> Option<SchedulingDecision> {
        match self.try_schedule(&request) {
            Some(decision) => {
                self.reserve(&decision);
                self.active
                    .write()
                    .insert(request.request_id.clone(), decision.clone());
                metrics::SCHEDULING_DECISIONS.inc();
                debug!(
                    request_id = %request.request_id,
                    reasoning = %decision.reasoning,
                    "scheduled workflow request"
                );
                Some(decision)
            }
            None => {
                debug!(request_id = %request.request_id, "no capacity, request stays queued");
                let mut queue = self.queue.lock();
                queue.push(QueuedRequest {
                    score: request.priority_score(),
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                    request,
                });
                None
            }
        }
    }

    fn try_schedule(&self, request: &WorkflowRequest) -> Option<SchedulingDecision> {
        let profiles = self.snapshot_profiles();
        match self.settings.strategy {
            SchedulingStrategy::FastestFirst => select_fastest_first(request, &profiles),
            SchedulingStrategy::LoadBalanced => select_load_balanced(request, &profiles),
            SchedulingStrategy::Predictive => select_predictive(request, &profiles),
            SchedulingStrategy::Adaptive => self.select_adaptive(request, &profiles),
        }
    }

    /// Adaptive: pick a concrete strategy from current conditions. The
    /// speed/creativity balance widens or narrows the fastest-first band.
    fn select_adaptive(
        &self,
        request: &WorkflowRequest,
        profiles: &[AgentPerformanceProfile],
    ) -> Option<SchedulingDecision> {
        let load = system_load(profiles);
        let variance = performance_variance(profiles);
        let low_threshold = 0.3 + 0.3 * (self.settings.speed_creativity_balance - 0.5);

        if load < low_threshold {
            select_fastest_first(request, profiles)
        } else if load > 0.8 {
            select_load_balanced(request, profiles)
        } else if variance > 0.5 {
            select_predictive(request, profiles)
        } else {
            select_load_balanced(request, profiles)
        }
    }

    fn reserve(&self, decision: &SchedulingDecision) {
        let profiles = self.profiles.read();
        for agent_id in decision.selected_agents.values() {
            if let Some(profile) = profiles.get(agent_id) {
                let mut profile = profile.write();
                profile.current_load = (profile.current_load + 1).min(profile.max_concurrent);
            }
        }
    }

    /// Release the agents reserved for a request and stamp their activity.
    pub fn release_agents(&self, request_id: &str) {
        let decision = self.active.write().remove(request_id);
        let Some(decision) = decision else {
            return;
        };
        let profiles = self.profiles.read();
        for agent_id in decision.selected_agents.values() {
            if let Some(profile) = profiles.get(agent_id) {
                let mut profile = profile.write();
                profile.current_load = profile.current_load.saturating_sub(1);
                profile.last_activity = now_ts();
            }
        }
    }

    /// Execute a scheduled request through the proxy registry: one agent per
    /// required kind, in pipeline order, recording a latency sample per
    /// invocation. Agents are released regardless of outcome.
    pub async fn dispatch(
        &self,
        request: &WorkflowRequest,
        decision: &SchedulingDecision,
        registry: &AgentProxyRegistry,
        cancel: CancellationToken,
    ) -> Result<Vec<AgentResult>> {
        let started = std::time::Instant::now();
        let mut results = Vec::with_capacity(request.required_agents.len());
        let mut input = request
            .metadata
            .get("input")
            .cloned()
            .unwrap_or(Value::Null);

        for kind in &request.required_agents {
            let agent_id = decision.selected_agents.get(kind).cloned().ok_or_else(|| {
                FabricError::Internal(format!("decision is missing an agent for kind {kind}"))
            })?;
            let proxy = registry.get(&agent_id).ok_or_else(|| {
                FabricError::Internal(format!("no proxy registered for agent {agent_id}"))
            })?;

            let agent_request = AgentRequest {
                request_id: request.request_id.clone(),
                workflow_id: request.metadata.get("workflow_id").and_then(|v| {
                    v.as_str().map(String::from)
                }),
                user_id: request.user_id.clone(),
                input: input.clone(),
                context: request.metadata.clone(),
            };

            let step_started = std::time::Instant::now();
            let outcome = proxy.invoke(agent_request, cancel.child_token()).await;
            let duration = step_started.elapsed().as_secs_f64();

            match outcome {
                Ok(result) => {
                    self.monitor.record(
                        OperationClass::AgentProcessing,
                        Some(&agent_id),
                        duration,
                        result.success,
                    );
                    // Each stage feeds the next.
                    input = result.output.clone();
                    results.push(result);
                }
                Err(err) => {
                    self.monitor
                        .record(OperationClass::AgentProcessing, Some(&agent_id), duration, false);
                    self.monitor.record(
                        OperationClass::WorkflowExecution,
                        None,
                        started.elapsed().as_secs_f64(),
                        false,
                    );
                    self.release_agents(&request.request_id);
                    return Err(err);
                }
            }
        }

        self.monitor.record(
            OperationClass::WorkflowExecution,
            None,
            started.elapsed().as_secs_f64(),
            true,
        );
        self.release_agents(&request.request_id);
        Ok(results)
    }

    pub fn system_load(&self) -> f64 {
        system_load(&self.snapshot_profiles())
    }

    pub fn performance_variance(&self) -> f64 {
        performance_variance(&self.snapshot_profiles())
    }

    /// Scheduler loop: retries queued requests that could not be scheduled
    /// at submission time. Unschedulable requests stay queued.
    pub async fn run_scheduler(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(SCHEDULER_TICK) => {
                    self.drain_queue();
                }
            }
        }
        debug!("scheduler loop exited");
    }

    fn drain_queue(&self) {
        let pending: Vec<QueuedRequest> = {
            let mut queue = self.queue.lock();
            std::mem::take(&mut *queue).into_sorted_vec()
        };
        if pending.is_empty() {
            return;
        }

        let mut requeue = Vec::new();
        // into_sorted_vec is ascending by Ord; our Ord is inverted, so walk
        // from the back to take the highest-priority request first.
        for entry in pending.into_iter().rev() {
            if self.active.read().contains_key(&entry.request.request_id) {
                continue;
            }
            match self.try_schedule(&entry.request) {
                Some(decision) => {
                    self.reserve(&decision);
                    self.active
                        .write()
                        .insert(entry.request.request_id.clone(), decision);
                    metrics::SCHEDULING_DECISIONS.inc();
                }
                None => requeue.push(entry),
            }
        }

        if !requeue.is_empty() {
            let mut queue = self.queue.lock();
            for entry in requeue {
                queue.push(entry);
            }
        }
    }

    /// Profile refresh loop: folds rolling monitor statistics back into the
    /// live profiles.
    pub async fn run_profile_refresh(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs_f64(self.settings.profile_update_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.refresh_profiles();
                }
            }
        }
        debug!("profile refresh loop exited");
    }

    pub fn refresh_profiles(&self) {
        for handle in self.profile_handles() {
            let agent_id = handle.read().agent_id.clone();
            let Some(stats) = self.monitor.agent_statistics(&agent_id) else {
                continue;
            };

            let mut profile = handle.write();
            let old_average = profile.average_response_time;
            profile.average_response_time = stats.average_duration;
            profile.success_rate = stats.success_rate;
            profile.performance_trend =
                (old_average - stats.average_duration) / old_average.max(0.1);
            profile.reliability_score = (stats.success_rate * 1.1).min(1.0);
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn active_len(&self) -> usize {
        self.active.read().len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let profiles: HashMap<String, AgentPerformanceProfile> = self
            .profiles
            .read()
            .iter()
            .map(|(id, p)| (id.clone(), p.read().clone()))
            .collect();
        CoordinatorStats {
            registered_agents: profiles.len(),
            active_requests: self.active_len(),
            queued_requests: self.queued_len(),
            strategy: self.settings.strategy,
            system_load: system_load(&profiles.values().cloned().collect::<Vec<_>>()),
            performance_variance: performance_variance(
                &profiles.values().cloned().collect::<Vec<_>>(),
            ),
            profiles,
        }
    }
}

fn candidates<'a>(
    profiles: &'a [AgentPerformanceProfile],
    kind: AgentKind,
) -> Vec<&'a AgentPerformanceProfile> {
    profiles
        .iter()
        .filter(|p| p.kind == kind && p.load_level() != AgentLoadLevel::Overloaded)
        .collect()
}

fn select_fastest_first(
    request: &WorkflowRequest,
    profiles: &[AgentPerformanceProfile],
) -> Option<SchedulingDecision> {
    let mut selected = HashMap::new();
    let mut completion = 0.0_f64;

    for kind in &request.required_agents {
        let pool = candidates(profiles, *kind);
        let best = pool.into_iter().max_by(|a, b| {
            a.efficiency_score()
                .partial_cmp(&b.efficiency_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        selected.insert(*kind, best.agent_id.clone());
        completion = completion.max(best.average_response_time);
    }

    Some(SchedulingDecision {
        request_id: request.request_id.clone(),
        selected_agents: selected,
        estimated_completion_time: completion,
        confidence: 0.8,
        reasoning: "selected fastest available agents".to_string(),
    })
}

fn select_load_balanced(
    request: &WorkflowRequest,
    profiles: &[AgentPerformanceProfile],
) -> Option<SchedulingDecision> {
    let mut selected = HashMap::new();
    let mut completion = 0.0_f64;

    for kind in &request.required_agents {
        let pool = candidates(profiles, *kind);
        let best = pool.into_iter().min_by(|a, b| {
            a.current_load.cmp(&b.current_load).then_with(|| {
                // Tie-break on efficiency, best first.
                b.efficiency_score()
                    .partial_cmp(&a.efficiency_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        })?;
        selected.insert(*kind, best.agent_id.clone());
        let load_factor = 1.0 + f64::from(best.current_load) * 0.2;
        completion = completion.max(best.average_response_time * load_factor);
    }

    Some(SchedulingDecision {
        request_id: request.request_id.clone(),
        selected_agents: selected,
        estimated_completion_time: completion,
        confidence: 0.7,
        reasoning: "selected least loaded agents".to_string(),
    })
}

fn select_predictive(
    request: &WorkflowRequest,
    profiles: &[AgentPerformanceProfile],
) -> Option<SchedulingDecision> {
    let mut selected = HashMap::new();
    let mut completion = 0.0_f64;
    let mut confidences = Vec::new();

    for kind in &request.required_agents {
        let pool = candidates(profiles, *kind);
        if pool.is_empty() {
            return None;
        }
        let mut best: Option<(&AgentPerformanceProfile, f64, f64)> = None;
        for profile in pool {
            let (predicted, confidence) = profile.predict(request.estimated_duration);
            if best.as_ref().map_or(true, |(_, t, _)| predicted < *t) {
                best = Some((profile, predicted, confidence));
            }
        }
        let (profile, predicted, confidence) = best?;
        selected.insert(*kind, profile.agent_id.clone());
        completion = completion.max(predicted);
        confidences.push(confidence);
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    Some(SchedulingDecision {
        request_id: request.request_id.clone(),
        selected_agents: selected,
        estimated_completion_time: completion,
        confidence,
        reasoning: "selected agents by predicted completion time".to_string(),
    })
}

fn system_load(profiles: &[AgentPerformanceProfile]) -> f64 {
    if profiles.is_empty() {
        return 0.0;
    }
    profiles
        .iter()
        .map(|p| f64::from(p.current_load) / f64::from(p.max_concurrent.max(1)))
        .sum::<f64>()
        / profiles.len() as f64
}

fn performance_variance(profiles: &[AgentPerformanceProfile]) -> f64 {
    if profiles.len() < 2 {
        return 0.0;
    }
    let times: Vec<f64> = profiles.iter().map(|p| p.average_response_time).collect();
    let mean = times.iter().sum::<f64>() / times.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (times.len() - 1) as f64;
    variance.sqrt() / mean
}
