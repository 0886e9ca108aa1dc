//! Benchmark records: templates, batches, units of work and their results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use scribe_core::model::GenerationParams;
use scribe_core::{CoreError, Result};

/// Reusable set of prompts and generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompts: Vec<String>,
    pub max_tokens: usize,
    pub num_runs: u32,
    pub temperature: f32,
    pub top_p: f32,
    /// Parallel to `prompts`; may be shorter, later prompts have no reference
    #[serde(default)]
    pub reference_texts: Option<Vec<String>>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub save_logprobs: bool,
    pub created_at: DateTime<Utc>,
}

impl BenchmarkTemplate {
    pub fn new(name: impl Into<String>, prompts: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            prompts,
            max_tokens: 100,
            num_runs: 3,
            temperature: 0.7,
            top_p: 0.9,
            reference_texts: None,
            tags: BTreeSet::new(),
            save_logprobs: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_num_runs(mut self, num_runs: u32) -> Self {
        self.num_runs = num_runs;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, top_p: f32) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self
    }

    pub fn with_reference_texts(mut self, references: Vec<String>) -> Self {
        self.reference_texts = Some(references);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_logprobs(mut self, save_logprobs: bool) -> Self {
        self.save_logprobs = save_logprobs;
        self
    }

    /// Reference text for prompt `index`, if one was provided
    pub fn reference_text(&self, index: usize) -> Option<&str> {
        self.reference_texts
            .as_ref()
            .and_then(|refs| refs.get(index))
            .map(String::as_str)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_runs == 0 {
            return Err(CoreError::invalid_parameter(
                "TEMPLATE_NUM_RUNS",
                "num_runs must be at least 1",
                "num_runs",
                "0",
                "[1, ∞)",
            ));
        }
        if self.max_tokens == 0 {
            return Err(CoreError::invalid_parameter(
                "TEMPLATE_MAX_TOKENS",
                "max_tokens must be at least 1",
                "max_tokens",
                "0",
                "[1, ∞)",
            ));
        }
        if !(self.temperature >= 0.0) {
            return Err(CoreError::invalid_parameter(
                "TEMPLATE_TEMPERATURE",
                "temperature cannot be negative",
                "temperature",
                self.temperature.to_string(),
                "[0, ∞)",
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(CoreError::invalid_parameter(
                "TEMPLATE_TOP_P",
                "top_p must be within (0, 1]",
                "top_p",
                self.top_p.to_string(),
                "(0, 1]",
            ));
        }
        if let Some(refs) = &self.reference_texts {
            if refs.len() > self.prompts.len() {
                return Err(CoreError::invalid_input(
                    "TEMPLATE_REFERENCES",
                    format!(
                        "{} reference texts for {} prompts",
                        refs.len(),
                        self.prompts.len()
                    ),
                    format!("Template '{}'", self.name),
                    "Provide at most one reference text per prompt",
                ));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Lifecycle of a batch run, serialized by name (`"RUNNING"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(CoreError::invalid_parameter(
                "BATCH_STATUS_UNKNOWN",
                format!("Unknown batch status '{}'", other),
                "status",
                other,
                "PENDING, RUNNING, COMPLETED, FAILED, CANCELLED",
            )),
        }
    }
}

/// A run request pairing one template with a list of models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchBenchmark {
    pub id: String,
    pub name: String,
    pub model_ids: Vec<String>,
    pub template_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub parallel: bool,
    pub max_workers: usize,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BatchBenchmark {
    pub fn new(
        name: impl Into<String>,
        template_id: impl Into<String>,
        model_ids: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            model_ids,
            template_id: template_id.into(),
            description: String::new(),
            tags: BTreeSet::new(),
            parallel: false,
            max_workers: 1,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_parallelism(mut self, parallel: bool, max_workers: usize) -> Self {
        self.parallel = parallel;
        self.max_workers = max_workers;
        self
    }

    /// Parallel execution needs both the flag and more than one worker
    pub fn is_parallel(&self) -> bool {
        self.parallel && self.max_workers > 1
    }

    /// Tag attached to every unit of this batch
    pub fn batch_tag(&self) -> String {
        format!("batch_{}", self.id)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// One (model, prompt) unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBenchmark {
    pub model_id: String,
    pub prompt: String,
    pub prompt_index: usize,
    pub max_tokens: usize,
    pub num_runs: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub tags: Vec<String>,
    pub reference_text: Option<String>,
    pub save_logprobs: bool,
}

impl ModelBenchmark {
    /// Build the unit for prompt `prompt_index` of `template` on `model_id`.
    ///
    /// Tags are the template's, then the batch's, then the batch tag,
    /// without duplicates.
    pub fn for_batch(
        batch: &BatchBenchmark,
        template: &BenchmarkTemplate,
        model_id: &str,
        prompt_index: usize,
    ) -> Option<Self> {
        let prompt = template.prompts.get(prompt_index)?;
        let mut tags: Vec<String> = Vec::new();
        for tag in template
            .tags
            .iter()
            .chain(batch.tags.iter())
            .cloned()
            .chain(std::iter::once(batch.batch_tag()))
        {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        Some(Self {
            model_id: model_id.to_string(),
            prompt: prompt.clone(),
            prompt_index,
            max_tokens: template.max_tokens,
            num_runs: template.num_runs,
            temperature: template.temperature,
            top_p: template.top_p,
            tags,
            reference_text: template.reference_text(prompt_index).map(str::to_string),
            save_logprobs: template.save_logprobs,
        })
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            want_logprobs: self.save_logprobs,
        }
    }
}

/// Measurements for one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub id: String,
    pub model_id: String,
    pub model_type: String,
    pub prompt: String,
    pub prompt_index: usize,
    #[serde(default)]
    pub reference_text: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub load_time_seconds: f64,
    /// Seconds per run, in run order
    pub generation_times: Vec<f64>,
    pub tokens_generated: Vec<usize>,
    pub avg_generation_time: f64,
    pub avg_tokens_per_second: f64,
    pub peak_memory_mb: f64,
    pub generated_texts: Vec<String>,
    /// Per-run token log-probabilities, kept only when requested
    #[serde(default)]
    pub logprobs: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Aggregate outcome of a batch, keyed by model id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub benchmark_results: BTreeMap<String, Vec<BenchmarkResult>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub total_units: usize,
    #[serde(default)]
    pub failed_units: usize,
    #[serde(default)]
    pub error: Option<String>,
}

impl BatchResult {
    /// Number of recorded unit results across all models
    pub fn result_count(&self) -> usize {
        self.benchmark_results.values().map(Vec::len).sum()
    }

    pub fn results_for(&self, model_id: &str) -> &[BenchmarkResult] {
        self.benchmark_results
            .get(model_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
