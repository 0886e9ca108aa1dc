//! Progress tracking for long-running operations
//!
//! A [`ProgressTracker`] records the lifecycle of downloads, benchmarks and
//! generations by operation id and notifies registered callbacks on every
//! transition. It is an ordinary value shared through an `Arc`; callers that
//! need isolation (tests, separate front ends) construct their own.
//!
//! Callbacks run synchronously on the thread that reported the change, after
//! the tracker's lock has been released, on a snapshot of the operation. A
//! panicking callback is logged and does not stop the remaining callbacks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Kind of work being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Download,
    Benchmark,
    BatchBenchmark,
    Generation,
}

/// Lifecycle state of a tracked operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of a tracked operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub operation_type: OperationType,
    pub operation_id: String,
    pub status: OperationStatus,
    /// Fraction of work done, always within [0, 1]
    pub progress: f64,
    pub message: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ProgressInfo {
    pub fn new(operation_type: OperationType, operation_id: impl Into<String>) -> Self {
        Self {
            operation_type,
            operation_id: operation_id.into(),
            status: OperationStatus::Pending,
            progress: 0.0,
            message: String::new(),
            start_time: Utc::now(),
            end_time: None,
            error: None,
            details: serde_json::Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Wall time since the operation started, up to its end if it has one
    pub fn elapsed(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }

    /// Linear extrapolation of the remaining time.
    ///
    /// Only meaningful while running with non-zero progress; this is a
    /// heuristic and gets worse the less uniform the work is.
    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        if self.status != OperationStatus::Running || self.progress <= 0.0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        let remaining = elapsed * (1.0 - self.progress) / self.progress;
        // Tiny progress values extrapolate past what a Duration can hold.
        Duration::try_from_secs_f64(remaining.max(0.0)).ok()
    }

    /// JSON view including the derived timing fields
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "elapsed_seconds".to_string(),
                serde_json::json!(self.elapsed().as_secs_f64()),
            );
            map.insert(
                "estimated_remaining_seconds".to_string(),
                serde_json::json!(self.estimated_time_remaining().map(|d| d.as_secs_f64())),
            );
        }
        value
    }
}

/// Observer invoked with a snapshot after every change
pub type ProgressCallback = Arc<dyn Fn(&ProgressInfo) + Send + Sync>;

#[derive(Default)]
struct TrackerState {
    operations: HashMap<String, ProgressInfo>,
    callbacks: HashMap<String, Vec<ProgressCallback>>,
    global_callbacks: Vec<ProgressCallback>,
}

/// Registry of tracked operations and their observers
#[derive(Default)]
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an operation. An existing operation with the same id is replaced.
    pub fn register_operation(&self, info: ProgressInfo) -> String {
        let id = info.operation_id.clone();
        let mut state = self.state.lock();
        if state.operations.insert(id.clone(), info).is_some() {
            debug!("Operation {} re-registered, previous state replaced", id);
        }
        id
    }

    /// Register a pending operation, generating an id when none is given
    pub fn create_operation(
        &self,
        operation_type: OperationType,
        operation_id: Option<String>,
        message: impl Into<String>,
    ) -> String {
        let id = operation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.register_operation(ProgressInfo::new(operation_type, id).with_message(message))
    }

    pub fn start_operation(&self, operation_id: &str, message: Option<&str>) -> bool {
        self.transition(operation_id, |info| {
            info.status = OperationStatus::Running;
            info.start_time = Utc::now();
            if let Some(message) = message {
                info.message = message.to_string();
            }
        })
    }

    /// Record progress. Values outside [0, 1] are clamped.
    pub fn update_operation(&self, operation_id: &str, progress: f64, message: Option<&str>) -> bool {
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
        trace!("Progress {} -> {:.3}", operation_id, progress);
        self.transition(operation_id, |info| {
            info.progress = progress;
            if info.status == OperationStatus::Pending {
                info.status = OperationStatus::Running;
            }
            if let Some(message) = message {
                info.message = message.to_string();
            }
        })
    }

    /// Attach a free-form detail to an operation
    pub fn update_details(&self, operation_id: &str, key: &str, value: serde_json::Value) -> bool {
        self.transition(operation_id, |info| {
            info.details.insert(key.to_string(), value);
        })
    }

    pub fn complete_operation(&self, operation_id: &str, message: Option<&str>) -> bool {
        self.transition(operation_id, |info| {
            info.status = OperationStatus::Completed;
            info.progress = 1.0;
            info.end_time = Some(Utc::now());
            if let Some(message) = message {
                info.message = message.to_string();
            }
        })
    }

    pub fn fail_operation(&self, operation_id: &str, error: &str) -> bool {
        self.transition(operation_id, |info| {
            info.status = OperationStatus::Failed;
            info.end_time = Some(Utc::now());
            info.error = Some(error.to_string());
            info.message = format!("Failed: {}", error);
        })
    }

    pub fn cancel_operation(&self, operation_id: &str) -> bool {
        self.transition(operation_id, |info| {
            info.status = OperationStatus::Cancelled;
            info.end_time = Some(Utc::now());
            info.message = "Cancelled".to_string();
        })
    }

    pub fn register_callback(&self, operation_id: &str, callback: ProgressCallback) {
        self.state
            .lock()
            .callbacks
            .entry(operation_id.to_string())
            .or_default()
            .push(callback);
    }

    pub fn register_global_callback(&self, callback: ProgressCallback) {
        self.state.lock().global_callbacks.push(callback);
    }

    pub fn clear_callbacks(&self, operation_id: &str) {
        self.state.lock().callbacks.remove(operation_id);
    }

    pub fn get_operation(&self, operation_id: &str) -> Option<ProgressInfo> {
        self.state.lock().operations.get(operation_id).cloned()
    }

    pub fn operations(&self) -> Vec<ProgressInfo> {
        let mut ops: Vec<_> = self.state.lock().operations.values().cloned().collect();
        ops.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        ops
    }

    pub fn active_operations(&self) -> Vec<ProgressInfo> {
        self.operations()
            .into_iter()
            .filter(|op| !op.status.is_terminal())
            .collect()
    }

    pub fn estimated_time_remaining(&self, operation_id: &str) -> Option<Duration> {
        self.get_operation(operation_id)?.estimated_time_remaining()
    }

    /// Drop terminal operations that ended longer ago than `older_than`
    /// (every terminal operation when `None`), along with their callbacks.
    pub fn clear_completed_operations(&self, older_than: Option<Duration>) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .operations
            .values()
            .filter(|op| op.status.is_terminal())
            .filter(|op| match (older_than, op.end_time) {
                (None, _) => true,
                (Some(age), Some(end)) => (now - end).to_std().unwrap_or_default() >= age,
                (Some(_), None) => false,
            })
            .map(|op| op.operation_id.clone())
            .collect();
        for id in &expired {
            state.operations.remove(id);
            state.callbacks.remove(id);
        }
        expired.len()
    }

    fn transition<F>(&self, operation_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut ProgressInfo),
    {
        let (snapshot, callbacks) = {
            let mut state = self.state.lock();
            let Some(info) = state.operations.get_mut(operation_id) else {
                warn!("Progress reported for unknown operation {}", operation_id);
                return false;
            };
            apply(info);
            let snapshot = info.clone();
            let mut callbacks: Vec<ProgressCallback> = state
                .callbacks
                .get(operation_id)
                .cloned()
                .unwrap_or_default();
            callbacks.extend(state.global_callbacks.iter().cloned());
            (snapshot, callbacks)
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                error!("Progress callback for {} panicked", operation_id);
            }
        }
        true
    }
}
