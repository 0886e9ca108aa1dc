//! End-to-end tests for batch orchestration
//!
//! Every test builds its own registry in a temporary directory, its own
//! progress tracker and a scripted in-process model backend.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use scribe_bench::{
    BatchBenchmark, BatchBenchmarkRegistry, BatchOrchestrator, BatchStatus, BenchmarkRunner,
    BenchmarkTemplate, CancellationToken,
};
use scribe_core::memory::MemoryProbe;
use scribe_core::model::{Generation, GenerationParams, ModelCache, ModelLoader, TextGenerator};
use scribe_core::progress::{OperationStatus, ProgressInfo, ProgressTracker};
use scribe_core::{CoreError, Result};
use tempfile::TempDir;

/// Backend whose behaviour is driven by the prompt text
#[derive(Default)]
struct Script {
    /// (model, prompt) pairs that fail
    failing: HashSet<(String, String)>,
    /// Every generation waits until this is set, when present
    gate: Option<Arc<AtomicBool>>,
    /// Generation panics while set
    panicking: AtomicBool,
    /// After generating this prompt, create a directory at this path
    blocker: Mutex<Option<(String, PathBuf)>>,
    started: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
}

struct ScriptedModel {
    id: String,
    script: Arc<Script>,
}

impl TextGenerator for ScriptedModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn model_type(&self) -> &str {
        "scripted"
    }

    fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<Generation> {
        self.script.started.fetch_add(1, Ordering::SeqCst);
        self.script
            .calls
            .lock()
            .push((self.id.clone(), prompt.to_string()));

        if let Some(gate) = &self.script.gate {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        }

        if self.script.panicking.load(Ordering::SeqCst) {
            panic!("backend crashed on {}", prompt);
        }

        // Later prompts finish first, so completion order differs from
        // submission order in parallel mode.
        let delay = 30u64.saturating_sub(prompt.len() as u64 * 3);
        thread::sleep(Duration::from_millis(delay));

        if self
            .script
            .failing
            .contains(&(self.id.clone(), prompt.to_string()))
        {
            return Err(CoreError::generation(
                "SCRIPTED_FAILURE",
                &self.id,
                "scripted failure",
                "none",
            ));
        }
        if let Some((after, path)) = &*self.script.blocker.lock() {
            if after == prompt {
                std::fs::create_dir(path).unwrap();
            }
        }
        Ok(Generation {
            text: format!("{}: {}", self.id, prompt),
            tokens: prompt.len().max(1),
            logprobs: None,
        })
    }
}

struct ScriptedLoader(Arc<Script>);

impl ModelLoader for ScriptedLoader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn TextGenerator>> {
        if model_id == "unloadable" {
            return Err(CoreError::model(
                "MODEL_NOT_FOUND",
                model_id,
                "no such model",
                "none",
            ));
        }
        Ok(Arc::new(ScriptedModel {
            id: model_id.to_string(),
            script: self.0.clone(),
        }))
    }
}

struct ZeroMemory;

impl MemoryProbe for ZeroMemory {
    fn current_mb(&self) -> f64 {
        0.0
    }
}

struct Harness {
    orchestrator: Arc<BatchOrchestrator>,
    registry: Arc<BatchBenchmarkRegistry>,
    tracker: Arc<ProgressTracker>,
    script: Arc<Script>,
    _dir: TempDir,
}

fn harness(script: Script) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("scribe_bench=debug")
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let registry =
        Arc::new(BatchBenchmarkRegistry::open(dir.path().join("batch_benchmarks.json")).unwrap());
    let script = Arc::new(script);
    let cache = Arc::new(ModelCache::new(Arc::new(ScriptedLoader(script.clone()))));
    let runner = Arc::new(BenchmarkRunner::new(cache, Arc::new(ZeroMemory)));
    let tracker = Arc::new(ProgressTracker::new());
    let orchestrator = Arc::new(BatchOrchestrator::new(
        registry.clone(),
        runner,
        tracker.clone(),
    ));
    Harness {
        orchestrator,
        registry,
        tracker,
        script,
        _dir: dir,
    }
}

fn prompts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn models(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn wait_for_started(h: &Harness, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while h.script.started.load(Ordering::SeqCst) < count {
        assert!(Instant::now() < deadline, "units never started");
        thread::sleep(Duration::from_millis(5));
    }
}

fn register(h: &Harness, template: BenchmarkTemplate, batch: BatchBenchmark) -> String {
    h.registry.create_benchmark_template(template).unwrap();
    h.registry.create_batch_benchmark(batch).unwrap().id
}

#[test]
fn sequential_batch_preserves_prompt_order() {
    let h = harness(Script::default());
    let template =
        BenchmarkTemplate::new("greetings", prompts(&["Hello", "World"])).with_num_runs(1);
    let batch = BatchBenchmark::new("seq", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    let result = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();

    assert_eq!(
        *h.script.calls.lock(),
        vec![
            ("m1".to_string(), "Hello".to_string()),
            ("m1".to_string(), "World".to_string())
        ]
    );
    let m1 = result.results_for("m1");
    assert_eq!(m1.len(), 2);
    assert_eq!(m1[0].prompt, "Hello");
    assert_eq!(m1[1].prompt, "World");
    assert!(m1[0].tags.contains(&format!("batch_{}", batch_id)));
    assert_eq!(result.total_units, 2);
    assert_eq!(result.failed_units, 0);

    let stored = h.registry.get_batch(&batch_id).unwrap();
    assert_eq!(stored.status, BatchStatus::Completed);
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());
    assert_eq!(h.registry.get_result(&batch_id), Some(result));
}

#[test]
fn parallel_batch_stores_results_in_submission_order() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("p", prompts(&["a", "bbb", "ccccc", "ddddddd"]))
        .with_num_runs(1);
    let batch = BatchBenchmark::new("par", &template.id, models(&["m1", "m2"]))
        .with_parallelism(true, 4);
    let batch_id = register(&h, template, batch);

    let result = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();

    for model in ["m1", "m2"] {
        let order: Vec<usize> = result
            .results_for(model)
            .iter()
            .map(|r| r.prompt_index)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
    assert_eq!(h.script.started.load(Ordering::SeqCst), 8);
    assert_eq!(
        h.registry.get_batch(&batch_id).unwrap().status,
        BatchStatus::Completed
    );
}

#[test]
fn failing_unit_is_skipped_and_batch_completes() {
    let mut script = Script::default();
    script
        .failing
        .insert(("m2".to_string(), "World".to_string()));
    let h = harness(script);
    let template =
        BenchmarkTemplate::new("t", prompts(&["Hello", "World", "Again"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1", "m2"]));
    let batch_id = register(&h, template, batch);

    let result = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();

    assert_eq!(result.result_count(), 5);
    assert_eq!(result.failed_units, 1);
    assert_eq!(result.results_for("m1").len(), 3);
    let m2: Vec<&str> = result
        .results_for("m2")
        .iter()
        .map(|r| r.prompt.as_str())
        .collect();
    assert_eq!(m2, vec!["Hello", "Again"]);

    let stored = h.registry.get_batch(&batch_id).unwrap();
    assert_eq!(stored.status, BatchStatus::Completed);
    assert!(stored.error.is_none());
    assert!(result.error.is_none());
}

#[test]
fn unloadable_model_keeps_an_empty_entry() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("t", prompts(&["Hello"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["unloadable", "m1"]))
        .with_parallelism(true, 2);
    let batch_id = register(&h, template, batch);

    let result = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();
    assert!(result.benchmark_results.contains_key("unloadable"));
    assert!(result.results_for("unloadable").is_empty());
    assert_eq!(result.results_for("m1").len(), 1);
    assert_eq!(result.failed_units, 1);
}

#[test]
fn zero_prompt_template_completes_immediately() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("empty", vec![]);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    let result = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();
    assert_eq!(result.total_units, 0);
    assert_eq!(result.result_count(), 0);
    assert!(result.results_for("m1").is_empty());
    assert_eq!(h.script.started.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.registry.get_batch(&batch_id).unwrap().status,
        BatchStatus::Completed
    );
}

#[test]
fn progress_reaches_completion() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("t", prompts(&["a", "b", "c"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    h.tracker.register_global_callback(Arc::new(move |info: &ProgressInfo| {
        s.lock().push(info.progress);
    }));

    h.orchestrator.run_batch_benchmark(&batch_id).unwrap();

    let op = h
        .tracker
        .get_operation(&format!("batch_{}", batch_id))
        .unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.progress, 1.0);
    assert_eq!(op.details["total_units"], 3);

    let seen = seen.lock();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
    assert_eq!(seen.last().copied(), Some(1.0));
}

#[test]
fn cancel_is_refused_unless_running() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("t", prompts(&["Hello"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    let before = h.registry.get_batch(&batch_id).unwrap();
    let modified = std::fs::metadata(h.registry.path()).unwrap().modified().unwrap();

    assert!(!h.orchestrator.cancel_batch_benchmark(&batch_id).unwrap());
    assert!(!h.orchestrator.cancel_batch_benchmark("unknown").unwrap());

    assert_eq!(h.registry.get_batch(&batch_id).unwrap(), before);
    assert_eq!(
        std::fs::metadata(h.registry.path()).unwrap().modified().unwrap(),
        modified
    );
}

#[test]
fn cancel_running_batch_stops_scheduling() {
    let gate = Arc::new(AtomicBool::new(false));
    let h = harness(Script {
        gate: Some(gate.clone()),
        ..Script::default()
    });
    let template =
        BenchmarkTemplate::new("t", prompts(&["one", "two", "three"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    let orchestrator = h.orchestrator.clone();
    let id = batch_id.clone();
    let worker = thread::spawn(move || orchestrator.run_batch_benchmark(&id));

    wait_for_started(&h, 1);

    assert!(h.orchestrator.cancel_batch_benchmark(&batch_id).unwrap());
    let cancelled = h.registry.get_batch(&batch_id).unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    gate.store(true, Ordering::SeqCst);
    let result = worker.join().unwrap().unwrap();

    assert_eq!(h.script.started.load(Ordering::SeqCst), 1);
    assert_eq!(result.results_for("m1").len(), 1);
    assert_eq!(result.error.as_deref(), Some("cancelled"));
    assert_eq!(
        h.registry.get_batch(&batch_id).unwrap().status,
        BatchStatus::Cancelled
    );
    assert_eq!(h.registry.get_result(&batch_id), Some(result));
    assert_eq!(
        h.tracker
            .get_operation(&format!("batch_{}", batch_id))
            .unwrap()
            .status,
        OperationStatus::Cancelled
    );
    assert!(!h.orchestrator.is_running(&batch_id));
}

#[test]
fn cancel_parallel_batch_skips_queued_units() {
    let gate = Arc::new(AtomicBool::new(false));
    let h = harness(Script {
        gate: Some(gate.clone()),
        ..Script::default()
    });
    let template = BenchmarkTemplate::new("t", prompts(&["a", "b", "c", "d", "e", "f"]))
        .with_num_runs(1);
    let batch =
        BatchBenchmark::new("b", &template.id, models(&["m1"])).with_parallelism(true, 2);
    let batch_id = register(&h, template, batch);

    let orchestrator = h.orchestrator.clone();
    let id = batch_id.clone();
    let worker = thread::spawn(move || orchestrator.run_batch_benchmark(&id));

    wait_for_started(&h, 1);
    assert!(h.orchestrator.cancel_batch_benchmark(&batch_id).unwrap());
    gate.store(true, Ordering::SeqCst);
    let result = worker.join().unwrap().unwrap();

    // Only units already held by a worker ran.
    let started = h.script.started.load(Ordering::SeqCst);
    assert!((1..=2).contains(&started), "{started} units started");
    assert_eq!(result.total_units, 6);
    assert_eq!(result.result_count(), started);
    assert_eq!(result.failed_units, 0);
    assert_eq!(result.error.as_deref(), Some("cancelled"));
    let order: Vec<usize> = result
        .results_for("m1")
        .iter()
        .map(|r| r.prompt_index)
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{order:?}");

    assert_eq!(
        h.registry.get_batch(&batch_id).unwrap().status,
        BatchStatus::Cancelled
    );
    assert_eq!(h.registry.get_result(&batch_id), Some(result));
    assert!(!h.orchestrator.is_running(&batch_id));
}

#[test]
fn caller_token_cancels_the_batch() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("t", prompts(&["Hello", "World"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    let token = CancellationToken::new();
    token.cancel();
    let result = h
        .orchestrator
        .run_batch_benchmark_with(&batch_id, token)
        .unwrap();

    assert_eq!(h.script.started.load(Ordering::SeqCst), 0);
    assert_eq!(result.result_count(), 0);
    assert_eq!(result.error.as_deref(), Some("cancelled"));
    let stored = h.registry.get_batch(&batch_id).unwrap();
    assert_eq!(stored.status, BatchStatus::Cancelled);
    assert!(stored.completed_at.is_some());
    assert_eq!(
        h.tracker
            .get_operation(&format!("batch_{}", batch_id))
            .unwrap()
            .status,
        OperationStatus::Cancelled
    );
}

#[test]
fn panicking_backend_releases_the_batch() {
    let h = harness(Script::default());
    h.script.panicking.store(true, Ordering::SeqCst);
    let template = BenchmarkTemplate::new("t", prompts(&["Hello"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        h.orchestrator.run_batch_benchmark(&batch_id)
    }));
    assert!(outcome.is_err());
    assert!(!h.orchestrator.is_running(&batch_id));
    let stored = h.registry.get_batch(&batch_id).unwrap();
    assert_eq!(stored.status, BatchStatus::Failed);
    assert!(stored.error.is_some());
    assert_eq!(
        h.tracker
            .get_operation(&format!("batch_{}", batch_id))
            .unwrap()
            .status,
        OperationStatus::Failed
    );

    h.script.panicking.store(false, Ordering::SeqCst);
    let result = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();
    assert_eq!(result.results_for("m1").len(), 1);
    assert_eq!(
        h.registry.get_batch(&batch_id).unwrap().status,
        BatchStatus::Completed
    );
}

#[test]
fn unknown_template_fails_the_batch() {
    let h = harness(Script::default());
    let batch = BatchBenchmark::new("b", "missing-template", models(&["m1"]));
    let batch_id = batch.id.clone();
    h.registry.register_batch(batch).unwrap();

    let err = h.orchestrator.run_batch_benchmark(&batch_id).unwrap_err();
    assert_eq!(err.code(), "TEMPLATE_NOT_FOUND");

    let stored = h.registry.get_batch(&batch_id).unwrap();
    assert_eq!(stored.status, BatchStatus::Failed);
    assert!(stored.error.unwrap().contains("missing-template"));
    assert_eq!(h.script.started.load(Ordering::SeqCst), 0);
}

#[test]
fn unknown_batch_is_rejected() {
    let h = harness(Script::default());
    let err = h.orchestrator.run_batch_benchmark("nope").unwrap_err();
    assert_eq!(err.code(), "BATCH_NOT_FOUND");
    assert_eq!(h.registry.batch_count(), 0);
}

#[test]
fn unknown_template_on_create_registers_nothing() {
    let h = harness(Script::default());
    let before = h.registry.batch_count();
    let err = h
        .orchestrator
        .run_template_on_models("b", "missing", models(&["m1"]), false, 1)
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.registry.batch_count(), before);
}

#[test]
fn persistence_failure_marks_batch_failed() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("t", prompts(&["Hello"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    // A directory where the temporary file goes makes every save fail.
    std::fs::create_dir(h.registry.path().with_extension("json.tmp")).unwrap();

    let err = h.orchestrator.run_batch_benchmark(&batch_id).unwrap_err();
    assert!(matches!(err, CoreError::Persistence { .. }));

    let stored = h.registry.get_batch(&batch_id).unwrap();
    assert_eq!(stored.status, BatchStatus::Failed);
    assert!(stored.error.is_some());
    let result = h.registry.get_result(&batch_id).unwrap();
    assert!(result.error.is_some());
    assert_eq!(
        h.tracker
            .get_operation(&format!("batch_{}", batch_id))
            .unwrap()
            .status,
        OperationStatus::Failed
    );
}

#[test]
fn failure_after_units_keeps_partial_results() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("t", prompts(&["Hello", "World"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);
    let blocker = h.registry.path().with_extension("json.tmp");
    *h.script.blocker.lock() = Some(("World".to_string(), blocker.clone()));

    let err = h.orchestrator.run_batch_benchmark(&batch_id).unwrap_err();
    assert!(matches!(err, CoreError::Persistence { .. }));
    assert_eq!(h.script.started.load(Ordering::SeqCst), 2);

    let stored = h.registry.get_batch(&batch_id).unwrap();
    assert_eq!(stored.status, BatchStatus::Failed);
    assert!(stored.error.is_some());
    let result = h.registry.get_result(&batch_id).unwrap();
    assert!(result.error.is_some());
    assert_eq!(result.total_units, 2);
    let m1: Vec<&str> = result
        .results_for("m1")
        .iter()
        .map(|r| r.prompt.as_str())
        .collect();
    assert_eq!(m1, vec!["Hello", "World"]);

    // The next successful write persists the failure record.
    std::fs::remove_dir(&blocker).unwrap();
    h.registry.modify_batch(&batch_id, |_| ()).unwrap();
    let reopened = BatchBenchmarkRegistry::open(h.registry.path()).unwrap();
    assert_eq!(reopened.get_batch(&batch_id).unwrap().status, BatchStatus::Failed);
    assert_eq!(reopened.get_result(&batch_id), Some(result));
}

#[test]
fn rerun_overwrites_previous_result() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("t", prompts(&["Hello"])).with_num_runs(2);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);

    let first = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();
    let second = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();

    assert_ne!(first.results_for("m1")[0].id, second.results_for("m1")[0].id);
    assert_eq!(h.registry.result_count(), 1);
    assert_eq!(h.registry.get_result(&batch_id), Some(second));
    assert_eq!(h.script.started.load(Ordering::SeqCst), 4);
}

#[test]
fn registry_reopens_with_results() {
    let h = harness(Script::default());
    let template = BenchmarkTemplate::new("t", prompts(&["Hello", "World"])).with_num_runs(1);
    let batch = BatchBenchmark::new("b", &template.id, models(&["m1"]));
    let batch_id = register(&h, template, batch);
    let result = h.orchestrator.run_batch_benchmark(&batch_id).unwrap();

    let reopened = BatchBenchmarkRegistry::open(h.registry.path()).unwrap();
    assert_eq!(reopened.get_result(&batch_id), Some(result));
    assert_eq!(
        reopened.get_batch(&batch_id).unwrap().status,
        BatchStatus::Completed
    );
}
