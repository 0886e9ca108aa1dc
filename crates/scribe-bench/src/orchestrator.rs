//! Batch orchestration
//!
//! Expands a batch into one unit per (model, prompt) pair, runs the units
//! sequentially or on a bounded worker pool, and records the outcome.
//!
//! State machine of the batch record:
//!
//! ```text
//! PENDING --run--> RUNNING --loop done--> COMPLETED
//!                     |  \--error escapes--> FAILED
//!                     \--cancel--> CANCELLED
//! ```
//!
//! A failing unit is logged and skipped; only errors outside the unit loop
//! (persistence, worker pool setup) fail the batch. Per-model result lists
//! are always in prompt order, in both execution modes. Results gathered
//! before a failure or cancellation are persisted with the error set.

use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use scribe_core::progress::{OperationType, ProgressTracker};
use scribe_core::{CoreError, Result};

pub use tokio_util::sync::CancellationToken;

use crate::registry::BatchBenchmarkRegistry;
use crate::runner::BenchmarkRunner;
use crate::types::{
    BatchBenchmark, BatchResult, BatchStatus, BenchmarkResult, BenchmarkTemplate, ModelBenchmark,
};

/// Error text stored on the result of a cancelled batch
pub const CANCELLED_ERROR: &str = "cancelled";

/// Expand a batch into units: models outer, prompts inner, in list order
pub fn plan_units(batch: &BatchBenchmark, template: &BenchmarkTemplate) -> Vec<ModelBenchmark> {
    batch
        .model_ids
        .iter()
        .flat_map(|model_id| {
            (0..template.prompts.len())
                .filter_map(move |i| ModelBenchmark::for_batch(batch, template, model_id, i))
        })
        .collect()
}

fn already_running(batch_id: &str) -> CoreError {
    CoreError::invalid_input(
        "BATCH_ALREADY_RUNNING",
        format!("Batch '{}' is already running", batch_id),
        "Starting a batch benchmark",
        "Wait for it to finish or cancel it first",
    )
}

/// Progress operation id used for a batch
pub fn progress_operation_id(batch_id: &str) -> String {
    format!("batch_{}", batch_id)
}

struct Collected {
    results: BTreeMap<String, Vec<BenchmarkResult>>,
    failed_units: usize,
    skipped_units: usize,
    total_units: usize,
}

impl Collected {
    fn new(batch: &BatchBenchmark) -> Self {
        Self {
            results: batch
                .model_ids
                .iter()
                .map(|id| (id.clone(), Vec::new()))
                .collect(),
            failed_units: 0,
            skipped_units: 0,
            total_units: 0,
        }
    }

    fn record(&mut self, unit: &ModelBenchmark, outcome: Result<BenchmarkResult>) {
        match outcome {
            Ok(result) => self
                .results
                .entry(unit.model_id.clone())
                .or_default()
                .push(result),
            Err(e) if e.is_cancelled() => self.skipped_units += 1,
            Err(e) => {
                warn!(
                    "Benchmark of {} on prompt {} failed, skipping: {}",
                    unit.model_id, unit.prompt_index, e
                );
                self.failed_units += 1;
            }
        }
    }
}

/// Registration of a run in the active map, released on drop.
///
/// A run that unwinds out of a backend leaves its batch FAILED instead of
/// RUNNING.
struct ActiveRun<'a> {
    orchestrator: &'a BatchOrchestrator,
    batch_id: &'a str,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.orchestrator.active.lock().remove(self.batch_id);
        if !std::thread::panicking() {
            return;
        }
        error!("Batch {} aborted by a panic", self.batch_id);
        self.orchestrator
            .tracker
            .fail_operation(&progress_operation_id(self.batch_id), "benchmark worker panicked");
        let marked = self.orchestrator.registry.transition_batch(
            self.batch_id,
            BatchStatus::Running,
            |b| {
                b.status = BatchStatus::Failed;
                b.error = Some("benchmark worker panicked".to_string());
                b.completed_at = Some(Utc::now());
            },
        );
        if let Err(e) = marked {
            error!("Could not mark batch {} as failed: {}", self.batch_id, e);
        }
    }
}

/// Runs batch benchmarks against a registry
pub struct BatchOrchestrator {
    registry: Arc<BatchBenchmarkRegistry>,
    runner: Arc<BenchmarkRunner>,
    tracker: Arc<ProgressTracker>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl BatchOrchestrator {
    pub fn new(
        registry: Arc<BatchBenchmarkRegistry>,
        runner: Arc<BenchmarkRunner>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            registry,
            runner,
            tracker,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<BatchBenchmarkRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Create a batch over `model_ids` from a registered template and run it
    pub fn run_template_on_models(
        &self,
        name: &str,
        template_id: &str,
        model_ids: Vec<String>,
        parallel: bool,
        max_workers: usize,
    ) -> Result<BatchResult> {
        let batch = self.registry.create_batch_benchmark(
            BatchBenchmark::new(name, template_id, model_ids).with_parallelism(parallel, max_workers),
        )?;
        self.run_batch_benchmark(&batch.id)
    }

    /// Request cancellation of a running batch.
    ///
    /// Returns `false` and changes nothing unless the batch is RUNNING.
    /// Units already executing finish; no new units start.
    pub fn cancel_batch_benchmark(&self, batch_id: &str) -> Result<bool> {
        let cancelled = self
            .registry
            .transition_batch(batch_id, BatchStatus::Running, |batch| {
                batch.status = BatchStatus::Cancelled;
                batch.completed_at = Some(Utc::now());
            })?;

        if cancelled {
            info!("Batch {} cancelled", batch_id);
            if let Some(token) = self.active.lock().get(batch_id) {
                token.cancel();
            }
        } else {
            info!("Batch {} is not running, nothing to cancel", batch_id);
        }
        Ok(cancelled)
    }

    pub fn is_running(&self, batch_id: &str) -> bool {
        self.active.lock().contains_key(batch_id)
    }

    /// Run every unit of a batch and persist its result
    pub fn run_batch_benchmark(&self, batch_id: &str) -> Result<BatchResult> {
        self.run_batch_benchmark_with(batch_id, CancellationToken::new())
    }

    /// Run a batch under a caller-owned token.
    ///
    /// Cancelling `token` stops scheduling like `cancel_batch_benchmark`
    /// does, and the batch ends CANCELLED.
    pub fn run_batch_benchmark_with(
        &self,
        batch_id: &str,
        token: CancellationToken,
    ) -> Result<BatchResult> {
        let batch = self
            .registry
            .get_batch(batch_id)
            .ok_or_else(|| CoreError::not_found("BATCH_NOT_FOUND", "batch", batch_id))?;

        if batch.status == BatchStatus::Running || self.is_running(batch_id) {
            return Err(already_running(batch_id));
        }

        let Some(template) = self.registry.get_template(&batch.template_id) else {
            let err =
                CoreError::not_found("TEMPLATE_NOT_FOUND", "template", batch.template_id.clone());
            error!("Batch {} references unknown template {}", batch_id, batch.template_id);
            let message = err.to_string();
            self.registry.modify_batch(batch_id, |b| {
                b.status = BatchStatus::Failed;
                b.error = Some(message);
                b.completed_at = Some(Utc::now());
            })?;
            return Err(err);
        };

        let _active = {
            let mut active = self.active.lock();
            if active.contains_key(batch_id) {
                return Err(already_running(batch_id));
            }
            active.insert(batch_id.to_string(), token.clone());
            ActiveRun {
                orchestrator: self,
                batch_id,
            }
        };
        self.run_registered(&batch, &template, &token)
    }

    fn run_registered(
        &self,
        batch: &BatchBenchmark,
        template: &BenchmarkTemplate,
        token: &CancellationToken,
    ) -> Result<BatchResult> {
        let op_id = progress_operation_id(&batch.id);
        self.tracker.create_operation(
            OperationType::BatchBenchmark,
            Some(op_id.clone()),
            format!("Batch {}", batch.name),
        );
        self.tracker.start_operation(&op_id, Some("Starting batch"));

        let clock = Instant::now();
        let started_at = Utc::now();
        let mut collected = Collected::new(batch);

        let outcome = self
            .execute(batch, template, token, &op_id, started_at, &mut collected)
            .and_then(|()| self.finish(batch, token, &op_id, started_at, clock, &mut collected));

        match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                let message = e.to_string();
                error!("Batch {} failed: {}", batch.id, message);
                let completed_at = Utc::now();
                let result = BatchResult {
                    batch_id: batch.id.clone(),
                    benchmark_results: std::mem::take(&mut collected.results),
                    started_at,
                    completed_at,
                    duration_seconds: clock.elapsed().as_secs_f64(),
                    total_units: collected.total_units,
                    failed_units: collected.failed_units,
                    error: Some(message.clone()),
                };
                let recorded = self.registry.record_outcome(result, |b| {
                    if b.status != BatchStatus::Cancelled {
                        b.status = BatchStatus::Failed;
                    }
                    b.started_at = Some(started_at);
                    b.completed_at = Some(completed_at);
                    b.error = Some(message.clone());
                });
                if let Err(save_err) = recorded {
                    error!("Could not record failure of batch {}: {}", batch.id, save_err);
                }
                self.tracker.fail_operation(&op_id, &message);
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        batch: &BatchBenchmark,
        template: &BenchmarkTemplate,
        token: &CancellationToken,
        op_id: &str,
        started_at: chrono::DateTime<Utc>,
        collected: &mut Collected,
    ) -> Result<()> {
        self.registry.modify_batch(&batch.id, |b| {
            b.status = BatchStatus::Running;
            b.started_at = Some(started_at);
            b.completed_at = None;
            b.error = None;
        })?;

        let units = plan_units(batch, template);
        collected.total_units = units.len();
        self.tracker
            .update_details(op_id, "total_units", serde_json::json!(units.len()));
        info!(
            "Batch {} running {} unit(s) over {} model(s), {}",
            batch.id,
            units.len(),
            batch.model_ids.len(),
            if batch.is_parallel() {
                format!("parallel with {} workers", batch.max_workers)
            } else {
                "sequential".to_string()
            }
        );

        if units.is_empty() {
            return Ok(());
        }

        if batch.is_parallel() {
            self.run_parallel(batch.max_workers, &units, token, op_id, collected)
        } else {
            self.run_sequential(&units, token, op_id, collected);
            Ok(())
        }
    }

    fn run_sequential(
        &self,
        units: &[ModelBenchmark],
        token: &CancellationToken,
        op_id: &str,
        collected: &mut Collected,
    ) {
        let total = units.len();
        for (i, unit) in units.iter().enumerate() {
            if token.is_cancelled() {
                info!("Cancellation requested, {} unit(s) not started", total - i);
                break;
            }
            let message = format!(
                "Benchmarking {} on prompt {} ({}/{})",
                unit.model_id,
                unit.prompt_index + 1,
                i + 1,
                total
            );
            self.tracker
                .update_operation(op_id, i as f64 / total as f64, Some(&message));

            let outcome = self.runner.run_benchmark(unit);
            collected.record(unit, outcome);

            self.tracker
                .update_operation(op_id, (i + 1) as f64 / total as f64, None);
        }
    }

    fn run_parallel(
        &self,
        max_workers: usize,
        units: &[ModelBenchmark],
        token: &CancellationToken,
        op_id: &str,
        collected: &mut Collected,
    ) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|i| format!("scribe-bench-{}", i))
            .build()
            .map_err(|e| CoreError::from(anyhow::Error::new(e).context("building worker pool")))?;

        let total = units.len();
        let finished = AtomicUsize::new(0);

        // Collecting an indexed parallel iterator keeps submission order.
        let outcomes: Vec<Result<BenchmarkResult>> = pool.install(|| {
            units
                .par_iter()
                .map(|unit| {
                    if token.is_cancelled() {
                        return Err(CoreError::cancelled(format!(
                            "{} on prompt {} not started",
                            unit.model_id, unit.prompt_index
                        )));
                    }
                    let outcome = self.runner.run_benchmark(unit);
                    let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    let message = format!(
                        "Finished {} on prompt {} ({}/{})",
                        unit.model_id,
                        unit.prompt_index + 1,
                        done,
                        total
                    );
                    self.tracker
                        .update_operation(op_id, done as f64 / total as f64, Some(&message));
                    outcome
                })
                .collect()
        });

        for (unit, outcome) in units.iter().zip(outcomes) {
            collected.record(unit, outcome);
        }
        if collected.skipped_units > 0 {
            info!(
                "Cancellation requested, {} unit(s) not started",
                collected.skipped_units
            );
        }
        Ok(())
    }

    fn finish(
        &self,
        batch: &BatchBenchmark,
        token: &CancellationToken,
        op_id: &str,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
        collected: &mut Collected,
    ) -> Result<BatchResult> {
        let completed_at = Utc::now();
        // A token cancelled by the caller has not touched the record yet.
        let requested = token.is_cancelled();
        let applied = self
            .registry
            .transition_batch(&batch.id, BatchStatus::Running, |b| {
                b.status = if requested {
                    BatchStatus::Cancelled
                } else {
                    BatchStatus::Completed
                };
                b.completed_at = Some(completed_at);
                b.error = None;
            })?;
        let completed = applied && !requested;

        let result = BatchResult {
            batch_id: batch.id.clone(),
            benchmark_results: std::mem::take(&mut collected.results),
            started_at,
            completed_at,
            duration_seconds: clock.elapsed().as_secs_f64(),
            total_units: collected.total_units,
            failed_units: collected.failed_units,
            error: (!completed).then(|| CANCELLED_ERROR.to_string()),
        };
        let recorded = result.result_count();

        if let Err(e) = self.registry.register_result(result.clone()) {
            // Keep the results for the failure record.
            collected.results = result.benchmark_results;
            return Err(e);
        }

        if completed {
            info!(
                "Batch {} completed: {} result(s), {} failed unit(s) in {:.2}s",
                batch.id, recorded, result.failed_units, result.duration_seconds
            );
            self.tracker
                .complete_operation(op_id, Some("Batch benchmark completed"));
        } else {
            info!(
                "Batch {} stopped after cancellation with {} result(s)",
                batch.id, recorded
            );
            self.tracker.cancel_operation(op_id);
        }
        Ok(result)
    }
}
