//! Progressive feedback for long-running operations.
//!
//! Each tracked operation is a small state machine: progress in [0, 1],
//! monotonically non-decreasing until terminal, a bounded number of updates,
//! and a background sweep that fails anything stale. Every mutation emits a
//! `ProgressiveFeedback` event through the publisher and invokes registered
//! callbacks outside the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{FabricError, Result};
use crate::events::now_ts;
use crate::metrics;
use crate::platform::config::FeedbackSettings;
use crate::realtime::publisher::EventPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
}

/// State of one tracked operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub operation_type: String,
    pub user_id: Option<String>,
    pub started_at: f64,
    pub last_update_at: f64,
    pub stage: String,
    /// Fraction complete in [0, 1]; events carry the percent form.
    pub progress: f64,
    pub steps_total: Option<u32>,
    pub steps_done: u32,
    pub status: OperationStatus,
    pub update_count: u32,
    pub estimated_completion: Option<f64>,
    pub intermediate: HashMap<String, Value>,
    pub error: Option<String>,
}

impl OperationRecord {
    fn new(operation_type: &str, user_id: Option<String>, steps_total: Option<u32>) -> Self {
        let now = now_ts();
        Self {
            operation_id: Uuid::new_v4().simple().to_string(),
            operation_type: operation_type.to_string(),
            user_id,
            started_at: now,
            last_update_at: now,
            stage: "initializing".to_string(),
            progress: 0.0,
            steps_total,
            steps_done: 0,
            status: OperationStatus::Running,
            update_count: 0,
            estimated_completion: None,
            intermediate: HashMap::new(),
            error: None,
        }
    }

    /// Remaining seconds, from the explicit estimate when present, otherwise
    /// extrapolated from elapsed time and progress.
    pub fn estimated_remaining(&self) -> Option<f64> {
        if let Some(completion) = self.estimated_completion {
            return Some((completion - now_ts()).max(0.0));
        }
        if self.progress > 0.0 {
            let elapsed = now_ts() - self.started_at;
            let total = elapsed / self.progress;
            return Some((total - elapsed).max(0.0));
        }
        None
    }

    pub fn progress_percentage(&self) -> f64 {
        self.progress * 100.0
    }
}

/// Fields accepted by [`FeedbackTracker::update_operation`].
#[derive(Debug, Clone, Default)]
pub struct OperationUpdate {
    pub stage: Option<String>,
    pub message: Option<String>,
    pub progress: Option<f64>,
    pub steps_done: Option<u32>,
    pub estimated_completion: Option<f64>,
    pub intermediate: Option<HashMap<String, Value>>,
}

pub type OperationCallback = Arc<dyn Fn(&OperationRecord) + Send + Sync>;

/// Identifier returned by `add_callback`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub active_operations: usize,
    pub total_updates: u64,
    pub operations_by_type: HashMap<String, usize>,
    pub operations_by_user: HashMap<String, usize>,
}

pub struct FeedbackTracker {
    settings: FeedbackSettings,
    publisher: Arc<EventPublisher>,
    operations: RwLock<HashMap<String, OperationRecord>>,
    callbacks: Mutex<HashMap<String, Vec<(CallbackId, OperationCallback)>>>,
    next_callback: AtomicU64,
    total_updates: AtomicU64,
}

impl FeedbackTracker {
    pub fn new(settings: FeedbackSettings, publisher: Arc<EventPublisher>) -> Self {
        Self {
            settings,
            publisher,
            operations: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            next_callback: AtomicU64::new(1),
            total_updates: AtomicU64::new(0),
        }
    }

    /// Begin tracking; emits the initial `stage=initializing, progress=0`
    /// event and returns the new operation id.
    pub async fn start_operation(
        &self,
        operation_type: &str,
        user_id: Option<String>,
        steps_total: Option<u32>,
        estimated_duration: Option<f64>,
    ) -> String {
        let mut record = OperationRecord::new(operation_type, user_id, steps_total);
        if let Some(duration) = estimated_duration {
            record.estimated_completion = Some(record.started_at + duration);
        }
        let operation_id = record.operation_id.clone();

        {
            let mut operations = self.operations.write().await;
            operations.insert(operation_id.clone(), record.clone());
            metrics::OPERATIONS_ACTIVE.set(operations.len() as f64);
        }

        self.emit(&record, "operation started").await;
        info!(operation_id = %operation_id, operation_type, "started tracking operation");
        operation_id
    }

    /// Apply a progress update. Fails closed on unknown ids; returns
    /// `Ok(false)` once the per-operation update cap is reached, leaving the
    /// previous state untouched.
    pub async fn update_operation(&self, operation_id: &str, update: OperationUpdate) -> Result<bool> {
        let record = {
            let mut operations = self.operations.write().await;
            let record = operations
                .get_mut(operation_id)
                .ok_or_else(|| FabricError::UnknownOperation(operation_id.to_string()))?;

            if record.update_count >= self.settings.max_updates_per_operation {
                warn!(operation_id, "update cap reached, rejecting update");
                return Ok(false);
            }

            record.last_update_at = now_ts();
            if let Some(stage) = &update.stage {
                record.stage = stage.clone();
            }
            if let Some(progress) = update.progress {
                // Monotonic until terminal.
                record.progress = record.progress.max(progress.clamp(0.0, 1.0));
            }
            if let Some(steps_done) = update.steps_done {
                record.steps_done = steps_done;
                if let Some(total) = record.steps_total {
                    if total > 0 {
                        record.progress = record
                            .progress
                            .max((f64::from(steps_done) / f64::from(total)).clamp(0.0, 1.0));
                    }
                }
            }
            if let Some(estimate) = update.estimated_completion {
                record.estimated_completion = Some(estimate);
            }
            if let Some(intermediate) = &update.intermediate {
                record.intermediate.extend(intermediate.clone());
            }
            record.update_count += 1;
            record.clone()
        };

        self.total_updates.fetch_add(1, Ordering::Relaxed);
        let message = update
            .message
            .unwrap_or_else(|| format!("progress update: {}", record.stage));
        self.emit(&record, &message).await;
        self.invoke_callbacks(operation_id, &record);
        Ok(true)
    }

    /// Terminal success (or explicit failure with `success = false`).
    /// Completing an already-removed operation is a no-op returning false.
    pub async fn complete_operation(
        &self,
        operation_id: &str,
        final_result: Option<HashMap<String, Value>>,
        success: bool,
    ) -> bool {
        let record = {
            let mut operations = self.operations.write().await;
            let Some(mut record) = operations.remove(operation_id) else {
                debug!(operation_id, "complete on unknown operation is a no-op");
                return false;
            };
            metrics::OPERATIONS_ACTIVE.set(operations.len() as f64);

            record.status = if success {
                OperationStatus::Completed
            } else {
                OperationStatus::Failed
            };
            if success {
                record.progress = 1.0;
            }
            record.last_update_at = now_ts();
            if let Some(result) = final_result {
                record.intermediate.extend(result);
            }
            record
        };

        let message = match (&record.status, &record.error) {
            (OperationStatus::Failed, Some(error)) => format!("operation failed: {error}"),
            (OperationStatus::Failed, None) => "operation failed".to_string(),
            _ => "operation completed".to_string(),
        };
        self.emit(&record, &message).await;
        self.invoke_callbacks(operation_id, &record);
        self.callbacks.lock().remove(operation_id);

        info!(
            operation_id,
            success, "operation finished and removed from tracking"
        );
        true
    }

    /// Terminal failure with an error message and optional details.
    pub async fn fail_operation(
        &self,
        operation_id: &str,
        error_message: &str,
        details: Option<HashMap<String, Value>>,
    ) -> bool {
        {
            let mut operations = self.operations.write().await;
            let Some(record) = operations.get_mut(operation_id) else {
                return false;
            };
            record.error = Some(error_message.to_string());
            if let Some(details) = details {
                record
                    .intermediate
                    .insert("error_details".to_string(), Value::Object(details.into_iter().collect()));
            }
        }
        self.complete_operation(operation_id, None, false).await
    }

    pub fn add_callback(&self, operation_id: &str, callback: OperationCallback) -> CallbackId {
        let mut callbacks = self.callbacks.lock();
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        callbacks
            .entry(operation_id.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    pub fn remove_callback(&self, operation_id: &str, callback_id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock();
        if let Some(list) = callbacks.get_mut(operation_id) {
            let before = list.len();
            list.retain(|(id, _)| *id != callback_id);
            return list.len() != before;
        }
        false
    }

    pub async fn operation_status(&self, operation_id: &str) -> Option<OperationRecord> {
        self.operations.read().await.get(operation_id).cloned()
    }

    pub async fn active_operations(&self, user_id: Option<&str>) -> Vec<OperationRecord> {
        self.operations
            .read()
            .await
            .values()
            .filter(|record| match user_id {
                Some(user) => record.user_id.as_deref() == Some(user),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> FeedbackStats {
        let operations = self.operations.read().await;
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_user: HashMap<String, usize> = HashMap::new();
        for record in operations.values() {
            *by_type.entry(record.operation_type.clone()).or_default() += 1;
            let user = record.user_id.clone().unwrap_or_else(|| "anonymous".into());
            *by_user.entry(user).or_default() += 1;
        }
        FeedbackStats {
            active_operations: operations.len(),
            total_updates: self.total_updates.load(Ordering::Relaxed),
            operations_by_type: by_type,
            operations_by_user: by_user,
        }
    }

    /// Background sweep failing operations past the timeout or quiet for two
    /// cleanup intervals.
    pub async fn run_cleanup(&self, cancel: CancellationToken) {
        let interval = std::time::Duration::from_secs_f64(self.settings.cleanup_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.sweep_stale().await;
                }
            }
        }
        debug!("feedback cleanup loop exited");
    }

    async fn sweep_stale(&self) {
        let now = now_ts();
        let stale: Vec<String> = self
            .operations
            .read()
            .await
            .values()
            .filter(|record| {
                now - record.started_at > self.settings.operation_timeout
                    || now - record.last_update_at > self.settings.cleanup_interval * 2.0
            })
            .map(|record| record.operation_id.clone())
            .collect();

        let swept = stale.len();
        for operation_id in stale {
            self.fail_operation(&operation_id, "stale", None).await;
        }
        if swept > 0 {
            info!(swept, "cleaned up stale operations");
        }
    }

    async fn emit(&self, record: &OperationRecord, message: &str) {
        let intermediate = if self.settings.stream_intermediate_results
            && !record.intermediate.is_empty()
        {
            Some(record.intermediate.clone())
        } else {
            None
        };

        self.publisher
            .publish_progressive_feedback(
                &record.operation_id,
                &record.operation_type,
                &record.stage,
                message,
                record.progress_percentage(),
                intermediate,
                record.estimated_remaining(),
                record.user_id.clone(),
            )
            .await;
    }

    fn invoke_callbacks(&self, operation_id: &str, record: &OperationRecord) {
        let callbacks: Vec<OperationCallback> = {
            let map = self.callbacks.lock();
            map.get(operation_id)
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(record);
        }
    }
}
