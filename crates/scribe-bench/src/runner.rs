//! Single-unit benchmark execution
//!
//! The runner is a plain unit of work: it loads the model, runs the prompt
//! `num_runs` times and reports measurements. Errors propagate to the
//! caller; skipping failed units is batch policy, not runner policy.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use scribe_core::memory::{MemoryProbe, ProcessMemoryProbe};
use scribe_core::model::{ModelCache, ModelLoader};
use scribe_core::{CoreError, Result};

use crate::types::{BenchmarkResult, ModelBenchmark};

/// Measure the wall time of a closure
pub fn measure_time<F, R>(f: F) -> (Duration, R)
where
    F: FnOnce() -> R,
{
    let start = Instant::now();
    let result = f();
    (start.elapsed(), result)
}

/// Executes [`ModelBenchmark`] units against cached models
pub struct BenchmarkRunner {
    cache: Arc<ModelCache>,
    memory: Arc<dyn MemoryProbe>,
}

impl BenchmarkRunner {
    pub fn new(cache: Arc<ModelCache>, memory: Arc<dyn MemoryProbe>) -> Self {
        Self { cache, memory }
    }

    /// Runner with a fresh cache over `loader` and process memory sampling
    pub fn with_loader(loader: Arc<dyn ModelLoader>) -> Self {
        Self::new(
            Arc::new(ModelCache::new(loader)),
            Arc::new(ProcessMemoryProbe::new()),
        )
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn run_benchmark(&self, benchmark: &ModelBenchmark) -> Result<BenchmarkResult> {
        if benchmark.num_runs == 0 {
            return Err(CoreError::invalid_parameter(
                "BENCHMARK_NUM_RUNS",
                "num_runs must be at least 1",
                "num_runs",
                "0",
                "[1, ∞)",
            ));
        }

        let started_at = Utc::now();
        let mut peak_memory_mb = self.memory.current_mb();

        let (load_time, loaded) = measure_time(|| self.cache.get_or_load(&benchmark.model_id));
        let (model, cache_hit) = loaded?;
        peak_memory_mb = peak_memory_mb.max(self.memory.current_mb());
        debug!(
            "Model {} ready in {:?} (cache hit: {})",
            benchmark.model_id, load_time, cache_hit
        );

        let params = benchmark.generation_params();
        let runs = benchmark.num_runs as usize;
        let mut generation_times = Vec::with_capacity(runs);
        let mut tokens_generated = Vec::with_capacity(runs);
        let mut generated_texts = Vec::with_capacity(runs);
        let mut logprobs: Vec<Vec<f32>> = Vec::new();

        for run in 0..runs {
            let (elapsed, generation) = measure_time(|| model.generate(&benchmark.prompt, &params));
            let generation = generation?;
            peak_memory_mb = peak_memory_mb.max(self.memory.current_mb());

            debug!(
                "Run {}/{} of {} produced {} tokens in {:?}",
                run + 1,
                runs,
                benchmark.model_id,
                generation.tokens,
                elapsed
            );

            generation_times.push(elapsed.as_secs_f64());
            tokens_generated.push(generation.tokens);
            generated_texts.push(generation.text);
            if benchmark.save_logprobs {
                if let Some(lp) = generation.logprobs {
                    logprobs.push(lp);
                }
            }
        }

        let avg_generation_time = generation_times.iter().sum::<f64>() / runs as f64;
        let avg_tokens_per_second = generation_times
            .iter()
            .zip(&tokens_generated)
            .map(|(secs, tokens)| if *secs > 0.0 { *tokens as f64 / secs } else { 0.0 })
            .sum::<f64>()
            / runs as f64;

        info!(
            "Benchmark {} / prompt {} done: {:.3}s avg, {:.1} tok/s",
            benchmark.model_id, benchmark.prompt_index, avg_generation_time, avg_tokens_per_second
        );

        Ok(BenchmarkResult {
            id: Uuid::new_v4().to_string(),
            model_id: benchmark.model_id.clone(),
            model_type: model.model_type().to_string(),
            prompt: benchmark.prompt.clone(),
            prompt_index: benchmark.prompt_index,
            reference_text: benchmark.reference_text.clone(),
            tags: benchmark.tags.clone(),
            started_at,
            completed_at: Utc::now(),
            load_time_seconds: load_time.as_secs_f64(),
            generation_times,
            tokens_generated,
            avg_generation_time,
            avg_tokens_per_second,
            peak_memory_mb,
            generated_texts,
            logprobs: (benchmark.save_logprobs && !logprobs.is_empty()).then_some(logprobs),
            error: None,
        })
    }
}
