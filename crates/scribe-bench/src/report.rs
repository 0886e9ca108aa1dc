//! Per-model comparison of a batch result

use serde::{Deserialize, Serialize};

use crate::types::{BatchResult, BenchmarkResult};

/// Aggregated measurements of one model within a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model_id: String,
    pub model_type: Option<String>,
    pub units: usize,
    pub mean_load_time: f64,
    pub mean_generation_time: f64,
    pub mean_tokens_per_second: f64,
    pub peak_memory_mb: f64,
    pub mean_bleu: Option<f64>,
    pub mean_perplexity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativePerformance {
    pub model_id: String,
    /// Throughput as a fraction of the fastest model's
    pub relative_to_fastest: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonAnalysis {
    pub fastest: Option<String>,
    pub slowest: Option<String>,
    pub relative_performance: Vec<RelativePerformance>,
}

/// Comparison report with analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub duration_seconds: f64,
    pub total_units: usize,
    pub failed_units: usize,
    pub error: Option<String>,
    pub models: Vec<ModelSummary>,
    pub analysis: ComparisonAnalysis,
}

fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

impl ModelSummary {
    fn from_results(model_id: &str, results: &[BenchmarkResult]) -> Self {
        Self {
            model_id: model_id.to_string(),
            model_type: results.first().map(|r| r.model_type.clone()),
            units: results.len(),
            mean_load_time: mean_of(results.iter().map(|r| r.load_time_seconds)).unwrap_or(0.0),
            mean_generation_time: mean_of(results.iter().map(|r| r.avg_generation_time))
                .unwrap_or(0.0),
            mean_tokens_per_second: mean_of(results.iter().map(|r| r.avg_tokens_per_second))
                .unwrap_or(0.0),
            peak_memory_mb: results
                .iter()
                .map(|r| r.peak_memory_mb)
                .fold(0.0, f64::max),
            mean_bleu: mean_of(results.iter().filter_map(BenchmarkResult::bleu_score)),
            mean_perplexity: mean_of(results.iter().filter_map(BenchmarkResult::perplexity)),
        }
    }
}

impl BatchReport {
    pub fn from_result(result: &BatchResult) -> Self {
        let models: Vec<ModelSummary> = result
            .benchmark_results
            .iter()
            .map(|(model_id, results)| ModelSummary::from_results(model_id, results))
            .collect();
        let analysis = Self::analyze(&models);
        Self {
            batch_id: result.batch_id.clone(),
            duration_seconds: result.duration_seconds,
            total_units: result.total_units,
            failed_units: result.failed_units,
            error: result.error.clone(),
            models,
            analysis,
        }
    }

    fn analyze(models: &[ModelSummary]) -> ComparisonAnalysis {
        let measured: Vec<&ModelSummary> = models.iter().filter(|m| m.units > 0).collect();
        if measured.is_empty() {
            return ComparisonAnalysis {
                fastest: None,
                slowest: None,
                relative_performance: Vec::new(),
            };
        }

        let by_throughput = |a: &&&ModelSummary, b: &&&ModelSummary| {
            a.mean_tokens_per_second.total_cmp(&b.mean_tokens_per_second)
        };
        let fastest = measured.iter().max_by(by_throughput).copied();
        let slowest = measured.iter().min_by(by_throughput).copied();
        let best = fastest.map(|m| m.mean_tokens_per_second).unwrap_or(0.0);

        let relative_performance = measured
            .iter()
            .map(|m| RelativePerformance {
                model_id: m.model_id.clone(),
                relative_to_fastest: if best > 0.0 {
                    m.mean_tokens_per_second / best
                } else {
                    0.0
                },
            })
            .collect();

        ComparisonAnalysis {
            fastest: fastest.map(|m| m.model_id.clone()),
            slowest: slowest.map(|m| m.model_id.clone()),
            relative_performance,
        }
    }

    /// Generate markdown report
    pub fn to_markdown(&self) -> String {
        let mut report = String::new();

        report.push_str("# Batch Benchmark Report\n\n");
        report.push_str(&format!("**Batch**: {}\n", self.batch_id));
        report.push_str(&format!("**Duration**: {:.2}s\n", self.duration_seconds));
        report.push_str(&format!(
            "**Units**: {} ({} failed)\n",
            self.total_units, self.failed_units
        ));
        if let Some(error) = &self.error {
            report.push_str(&format!("**Error**: {}\n", error));
        }
        if let Some(fastest) = &self.analysis.fastest {
            report.push_str(&format!("**Fastest**: {}\n", fastest));
        }
        if let Some(slowest) = &self.analysis.slowest {
            report.push_str(&format!("**Slowest**: {}\n", slowest));
        }

        report.push_str("\n## Results\n\n");
        report.push_str(
            "| Model | Units | Load (s) | Generation (s) | Tokens/s | Peak MB | BLEU | Perplexity | Relative |\n",
        );
        report.push_str(
            "|-------|-------|----------|----------------|----------|---------|------|------------|----------|\n",
        );

        for model in &self.models {
            let relative = self
                .analysis
                .relative_performance
                .iter()
                .find(|r| r.model_id == model.model_id)
                .map(|r| format!("{:.2}x", r.relative_to_fastest))
                .unwrap_or_else(|| "-".to_string());
            report.push_str(&format!(
                "| {} | {} | {:.3} | {:.3} | {:.2} | {:.1} | {} | {} | {} |\n",
                model.model_id,
                model.units,
                model.mean_load_time,
                model.mean_generation_time,
                model.mean_tokens_per_second,
                model.peak_memory_mb,
                model
                    .mean_bleu
                    .map(|b| format!("{:.3}", b))
                    .unwrap_or_else(|| "-".to_string()),
                model
                    .mean_perplexity
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".to_string()),
                relative,
            ));
        }

        report
    }
}
