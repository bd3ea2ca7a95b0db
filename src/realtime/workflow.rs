//! Milestone-weighted workflow tracking.
//!
//! A workflow is an ordered composition of agent invocations. Progress is
//! the sum of completed milestone weights (weights must sum to 1), stages
//! follow a fixed path, and every mutation can auto-publish a
//! `WorkflowProgress` event.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{FabricError, Result};
use crate::events::{now_ts, WorkflowStatus};
use crate::metrics;
use crate::platform::config::FeedbackSettings;
use crate::realtime::publisher::EventPublisher;

const WEIGHT_EPSILON: f64 = 1e-6;

/// The ordered stage path a workflow moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Initializing,
    Preparing,
    Executing,
    PostProcessing,
    Finalizing,
    Completed,
    Failed,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Initializing => "initializing",
            WorkflowStage::Preparing => "preparing",
            WorkflowStage::Executing => "executing",
            WorkflowStage::PostProcessing => "post_processing",
            WorkflowStage::Finalizing => "finalizing",
            WorkflowStage::Completed => "completed",
            WorkflowStage::Failed => "failed",
        }
    }

    /// Position on the ordered path; terminal stages are reachable from
    /// anywhere.
    fn order(&self) -> u8 {
        match self {
            WorkflowStage::Initializing => 0,
            WorkflowStage::Preparing => 1,
            WorkflowStage::Executing => 2,
            WorkflowStage::PostProcessing => 3,
            WorkflowStage::Finalizing => 4,
            WorkflowStage::Completed | WorkflowStage::Failed => 5,
        }
    }
}

/// A weighted checkpoint inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub name: String,
    pub stage: WorkflowStage,
    pub weight: f64,
    pub completed: bool,
}

impl Milestone {
    pub fn new(id: impl Into<String>, name: impl Into<String>, stage: WorkflowStage, weight: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stage,
            weight,
            completed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub workflow_type: String,
    pub user_id: Option<String>,
    pub status: WorkflowStatus,
    pub stage: WorkflowStage,
    pub current_step: Option<String>,
    pub steps_done: u32,
    pub steps_total: Option<u32>,
    pub milestones: Vec<Milestone>,
    pub started_at: f64,
    pub updated_at: f64,
    pub cancellation_reason: Option<String>,
}

impl WorkflowRecord {
    /// Fraction complete: the sum of completed milestone weights.
    pub fn progress_fraction(&self) -> f64 {
        self.milestones
            .iter()
            .filter(|m| m.completed)
            .map(|m| m.weight)
            .sum()
    }

    pub fn progress_percentage(&self) -> f64 {
        self.progress_fraction() * 100.0
    }

    /// Completion estimate extrapolated from elapsed time and progress.
    pub fn estimated_completion(&self) -> Option<f64> {
        let progress = self.progress_fraction();
        if progress <= 0.0 || progress >= 1.0 {
            return None;
        }
        let elapsed = now_ts() - self.started_at;
        Some(self.started_at + elapsed / progress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

pub struct WorkflowTracker {
    auto_publish: bool,
    publisher: Arc<EventPublisher>,
    workflows: RwLock<HashMap<String, WorkflowRecord>>,
}

impl WorkflowTracker {
    pub fn new(settings: &FeedbackSettings, publisher: Arc<EventPublisher>) -> Self {
        Self {
            auto_publish: settings.auto_publish_updates,
            publisher,
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Begin tracking a workflow. Milestone weights must sum to 1 within
    /// epsilon; anything else is a configuration error.
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        user_id: Option<String>,
        milestones: Vec<Milestone>,
        steps_total: Option<u32>,
    ) -> Result<String> {
        let weight_sum: f64 = milestones.iter().map(|m| m.weight).sum();
        if !milestones.is_empty() && (weight_sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(FabricError::Configuration(format!(
                "milestone weights must sum to 1.0, got {weight_sum}"
            )));
        }

        let now = now_ts();
        let record = WorkflowRecord {
            workflow_id: Uuid::new_v4().simple().to_string(),
            workflow_type: workflow_type.to_string(),
            user_id,
            status: WorkflowStatus::Running,
            stage: WorkflowStage::Initializing,
            current_step: None,
            steps_done: 0,
            steps_total,
            milestones,
            started_at: now,
            updated_at: now,
            cancellation_reason: None,
        };
        let workflow_id = record.workflow_id.clone();

        {
            let mut workflows = self.workflows.write().await;
            workflows.insert(workflow_id.clone(), record.clone());
            metrics::WORKFLOWS_ACTIVE.set(workflows.len() as f64);
        }

        self.publish(&record).await;
        info!(workflow_id = %workflow_id, workflow_type, "started tracking workflow");
        Ok(workflow_id)
    }

    /// Mark a milestone completed and recompute progress. Completing an
    /// already-completed milestone is a no-op.
    pub async fn complete_milestone(&self, workflow_id: &str, milestone_id: &str) -> Result<f64> {
        let record = {
            let mut workflows = self.workflows.write().await;
            let record = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| FabricError::UnknownWorkflow(workflow_id.to_string()))?;

            let milestone = record
                .milestones
                .iter_mut()
                .find(|m| m.id == milestone_id)
                .ok_or_else(|| {
                    FabricError::Configuration(format!(
                        "workflow {workflow_id} has no milestone {milestone_id}"
                    ))
                })?;

            if milestone.completed {
                debug!(workflow_id, milestone_id, "milestone already completed");
                return Ok(record.progress_percentage());
            }
            milestone.completed = true;
            record.updated_at = now_ts();
            record.clone()
        };

        self.publish(&record).await;
        Ok(record.progress_percentage())
    }

    /// Move along the ordered stage path. Backward transitions are refused.
    pub async fn advance_stage(&self, workflow_id: &str, stage: WorkflowStage) -> Result<()> {
        let record = {
            let mut workflows = self.workflows.write().await;
            let record = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| FabricError::UnknownWorkflow(workflow_id.to_string()))?;

            if stage.order() < record.stage.order() {
                warn!(
                    workflow_id,
                    from = record.stage.as_str(),
                    to = stage.as_str(),
                    "refusing backward stage transition"
                );
                return Err(FabricError::Internal(format!(
                    "cannot move workflow from {} back to {}",
                    record.stage.as_str(),
                    stage.as_str()
                )));
            }
            record.stage = stage;
            match stage {
                WorkflowStage::Completed => record.status = WorkflowStatus::Completed,
                WorkflowStage::Failed => record.status = WorkflowStatus::Failed,
                _ => {}
            }
            record.updated_at = now_ts();
            record.clone()
        };

        self.publish(&record).await;
        Ok(())
    }

    pub async fn update_step(
        &self,
        workflow_id: &str,
        current_step: Option<String>,
        steps_done: u32,
    ) -> Result<()> {
        let record = {
            let mut workflows = self.workflows.write().await;
            let record = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| FabricError::UnknownWorkflow(workflow_id.to_string()))?;
            record.current_step = current_step;
            record.steps_done = steps_done;
            record.updated_at = now_ts();
            record.clone()
        };
        self.publish(&record).await;
        Ok(())
    }

    /// Pause a running workflow; progress and milestones are retained.
    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<()> {
        self.set_status(workflow_id, WorkflowStatus::Paused).await
    }

    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<()> {
        self.set_status(workflow_id, WorkflowStatus::Running).await
    }

    async fn set_status(&self, workflow_id: &str, status: WorkflowStatus) -> Result<()> {
        let record = {
            let mut workflows = self.workflows.write().await;
            let record = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| FabricError::UnknownWorkflow(workflow_id.to_string()))?;
            record.status = status;
            record.updated_at = now_ts();
            record.clone()
        };
        self.publish(&record).await;
        Ok(())
    }

    pub async fn complete_workflow(&self, workflow_id: &str) -> Result<()> {
        self.finish(workflow_id, WorkflowStatus::Completed, WorkflowStage::Completed, None)
            .await
    }

    pub async fn fail_workflow(&self, workflow_id: &str, reason: &str) -> Result<()> {
        self.finish(
            workflow_id,
            WorkflowStatus::Failed,
            WorkflowStage::Failed,
            Some(reason.to_string()),
        )
        .await
    }

    /// Explicit cancellation with a recorded reason.
    pub async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<()> {
        self.finish(
            workflow_id,
            WorkflowStatus::Cancelled,
            WorkflowStage::Failed,
            Some(reason.to_string()),
        )
        .await
    }

    async fn finish(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        stage: WorkflowStage,
        reason: Option<String>,
    ) -> Result<()> {
        let record = {
            let mut workflows = self.workflows.write().await;
            let record = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| FabricError::UnknownWorkflow(workflow_id.to_string()))?;
            record.status = status;
            record.stage = stage;
            record.cancellation_reason = reason;
            record.updated_at = now_ts();
            if status == WorkflowStatus::Completed {
                for milestone in &mut record.milestones {
                    milestone.completed = true;
                }
            }
            let snapshot = record.clone();
            workflows.remove(workflow_id);
            metrics::WORKFLOWS_ACTIVE.set(workflows.len() as f64);
            snapshot
        };

        self.publish(&record).await;
        info!(workflow_id, status = ?record.status, "workflow finished");
        Ok(())
    }

    pub async fn workflow_status(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.workflows.read().await.len()
    }

    async fn publish(&self, record: &WorkflowRecord) {
        if !self.auto_publish {
            return;
        }
        self.publisher
            .publish_workflow_progress(
                &record.workflow_id,
                &record.workflow_type,
                record.status,
                record.progress_percentage(),
                record.current_step.clone(),
                record.steps_total,
                Some(record.steps_done),
                record.estimated_completion(),
                record.user_id.clone(),
            )
            .await;
    }
}
