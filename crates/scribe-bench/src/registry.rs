//! JSON-backed store of templates, batches and batch results
//!
//! The registry owns its file exclusively. Every mutation takes the single
//! lock, updates the in-memory maps and rewrites the whole document through
//! a temporary file that is renamed over the original, so a crash leaves
//! either the old or the new file. Reads take the same lock.
//!
//! A file that fails to parse is copied aside with a timestamped name and
//! the registry starts empty; the copy is kept for inspection, never repaired.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use scribe_core::{config, CoreError, Result};

use crate::types::{BatchBenchmark, BatchResult, BatchStatus, BenchmarkTemplate};

#[derive(Debug, Default, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    templates: BTreeMap<String, BenchmarkTemplate>,
    #[serde(default)]
    batches: BTreeMap<String, BatchBenchmark>,
    #[serde(default)]
    results: BTreeMap<String, BatchResult>,
    #[serde(default)]
    #[allow(dead_code)]
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct RegistryDocumentRef<'a> {
    templates: &'a BTreeMap<String, BenchmarkTemplate>,
    batches: &'a BTreeMap<String, BatchBenchmark>,
    results: &'a BTreeMap<String, BatchResult>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    templates: BTreeMap<String, BenchmarkTemplate>,
    batches: BTreeMap<String, BatchBenchmark>,
    results: BTreeMap<String, BatchResult>,
}

/// Persistent store for batch benchmarking
pub struct BatchBenchmarkRegistry {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

impl BatchBenchmarkRegistry {
    /// Open the registry stored at `path`, starting empty if it is missing
    /// or unreadable as JSON.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = Self::load(&path)?;
        info!(
            "Opened benchmark registry {} ({} templates, {} batches, {} results)",
            path.display(),
            state.templates.len(),
            state.batches.len(),
            state.results.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Open the registry in the configured data directory
    pub fn open_default() -> Result<Self> {
        Self::open(config::registry_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<RegistryState> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", path.display());
                return Ok(RegistryState::default());
            }
            Err(e) => return Err(CoreError::persistence(e, path)),
        };

        match serde_json::from_str::<RegistryDocument>(&content) {
            Ok(doc) => Ok(RegistryState {
                templates: doc.templates,
                batches: doc.batches,
                results: doc.results,
            }),
            Err(e) => {
                error!("Failed to parse benchmark registry {}: {}", path.display(), e);
                let backup = Self::backup_path(path);
                match std::fs::copy(path, &backup) {
                    Ok(_) => warn!("Corrupted registry preserved at {}", backup.display()),
                    Err(copy_err) => error!(
                        "Could not preserve corrupted registry at {}: {}",
                        backup.display(),
                        copy_err
                    ),
                }
                Ok(RegistryState::default())
            }
        }
    }

    fn backup_path(path: &Path) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| config::REGISTRY_FILE_NAME.to_string());
        path.with_file_name(format!("{}.corrupt-{}", file_name, timestamp))
    }

    fn save(&self, state: &RegistryState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::persistence(e, parent))?;
            }
        }

        let doc = RegistryDocumentRef {
            templates: &state.templates,
            batches: &state.batches,
            results: &state.results,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| CoreError::persistence(e, &tmp))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CoreError::persistence(e, &self.path))?;
        debug!("Registry saved to {}", self.path.display());
        Ok(())
    }

    // Templates

    /// Insert or replace a template
    pub fn register_template(&self, template: BenchmarkTemplate) -> Result<()> {
        let mut state = self.state.lock();
        info!("Registering template {} ({})", template.name, template.id);
        state.templates.insert(template.id.clone(), template);
        self.save(&state)
    }

    /// Validate and register a new template
    pub fn create_benchmark_template(&self, template: BenchmarkTemplate) -> Result<BenchmarkTemplate> {
        template.validate()?;
        self.register_template(template.clone())?;
        Ok(template)
    }

    pub fn get_template(&self, template_id: &str) -> Option<BenchmarkTemplate> {
        self.state.lock().templates.get(template_id).cloned()
    }

    /// All templates, oldest first
    pub fn get_benchmark_templates(&self) -> Vec<BenchmarkTemplate> {
        let mut templates: Vec<_> = self.state.lock().templates.values().cloned().collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        templates
    }

    /// Remove a template. Templates still referenced by a batch are kept.
    pub fn delete_template(&self, template_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if let Some(batch) = state.batches.values().find(|b| b.template_id == template_id) {
            return Err(CoreError::invalid_input(
                "TEMPLATE_IN_USE",
                format!("Template '{}' is used by batch '{}'", template_id, batch.id),
                "Deleting a benchmark template",
                "Delete the batches that use it first",
            ));
        }
        if state.templates.remove(template_id).is_none() {
            return Ok(false);
        }
        self.save(&state)?;
        Ok(true)
    }

    pub fn template_count(&self) -> usize {
        self.state.lock().templates.len()
    }

    // Batches

    /// Insert or replace a batch without validation
    pub fn register_batch(&self, batch: BatchBenchmark) -> Result<()> {
        let mut state = self.state.lock();
        state.batches.insert(batch.id.clone(), batch);
        self.save(&state)
    }

    /// Register a new PENDING batch after checking its configuration.
    ///
    /// Nothing is stored if the template is unknown, the model list is
    /// empty or `max_workers` is zero.
    pub fn create_batch_benchmark(&self, mut batch: BatchBenchmark) -> Result<BatchBenchmark> {
        let mut state = self.state.lock();
        if !state.templates.contains_key(&batch.template_id) {
            return Err(CoreError::not_found(
                "TEMPLATE_NOT_FOUND",
                "template",
                batch.template_id.clone(),
            ));
        }
        if batch.model_ids.is_empty() {
            return Err(CoreError::invalid_input(
                "BATCH_NO_MODELS",
                "A batch needs at least one model",
                format!("Batch '{}'", batch.name),
                "Pass one or more model ids",
            ));
        }
        if batch.max_workers == 0 {
            return Err(CoreError::invalid_parameter(
                "BATCH_MAX_WORKERS",
                "max_workers must be at least 1",
                "max_workers",
                "0",
                "[1, ∞)",
            ));
        }

        batch.status = BatchStatus::Pending;
        batch.started_at = None;
        batch.completed_at = None;
        batch.error = None;
        info!(
            "Creating batch {} ({}) over {} model(s)",
            batch.name,
            batch.id,
            batch.model_ids.len()
        );
        state.batches.insert(batch.id.clone(), batch.clone());
        self.save(&state)?;
        Ok(batch)
    }

    /// Replace an existing batch record
    pub fn update_batch(&self, batch: BatchBenchmark) -> Result<()> {
        let mut state = self.state.lock();
        if !state.batches.contains_key(&batch.id) {
            return Err(CoreError::not_found("BATCH_NOT_FOUND", "batch", batch.id.clone()));
        }
        state.batches.insert(batch.id.clone(), batch);
        self.save(&state)
    }

    /// Apply `f` to a batch under the registry lock and persist the result
    pub fn modify_batch<F, R>(&self, batch_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut BatchBenchmark) -> R,
    {
        let mut state = self.state.lock();
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| CoreError::not_found("BATCH_NOT_FOUND", "batch", batch_id))?;
        let out = f(batch);
        self.save(&state)?;
        Ok(out)
    }

    /// Apply `f` only if the batch is currently in state `from`.
    ///
    /// Returns `Ok(false)` without touching the file when the batch is in any
    /// other state, or does not exist.
    pub fn transition_batch<F>(&self, batch_id: &str, from: BatchStatus, f: F) -> Result<bool>
    where
        F: FnOnce(&mut BatchBenchmark),
    {
        let mut state = self.state.lock();
        match state.batches.get_mut(batch_id) {
            Some(batch) if batch.status == from => f(batch),
            _ => return Ok(false),
        }
        self.save(&state)?;
        Ok(true)
    }

    pub fn get_batch(&self, batch_id: &str) -> Option<BatchBenchmark> {
        self.state.lock().batches.get(batch_id).cloned()
    }

    /// All batches, oldest first
    pub fn get_batches(&self) -> Vec<BatchBenchmark> {
        let mut batches: Vec<_> = self.state.lock().batches.values().cloned().collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        batches
    }

    /// Remove a batch and its result. Running batches cannot be deleted.
    pub fn delete_batch(&self, batch_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.batches.get(batch_id) {
            None => return Ok(false),
            Some(batch) if batch.status == BatchStatus::Running => {
                return Err(CoreError::invalid_input(
                    "BATCH_RUNNING",
                    format!("Batch '{}' is running", batch_id),
                    "Deleting a batch",
                    "Cancel the batch first",
                ));
            }
            Some(_) => {}
        }
        state.batches.remove(batch_id);
        state.results.remove(batch_id);
        self.save(&state)?;
        Ok(true)
    }

    pub fn batch_count(&self) -> usize {
        self.state.lock().batches.len()
    }

    // Results

    /// Store the result of a batch, replacing any earlier run
    pub fn register_result(&self, result: BatchResult) -> Result<()> {
        let mut state = self.state.lock();
        if state.results.contains_key(&result.batch_id) {
            debug!("Overwriting previous result of batch {}", result.batch_id);
        }
        state.results.insert(result.batch_id.clone(), result);
        self.save(&state)
    }

    /// Apply `f` to the stored batch and store its result in one write
    pub fn record_outcome<F>(&self, result: BatchResult, f: F) -> Result<()>
    where
        F: FnOnce(&mut BatchBenchmark),
    {
        let mut state = self.state.lock();
        let batch = state.batches.get_mut(&result.batch_id).ok_or_else(|| {
            CoreError::not_found("BATCH_NOT_FOUND", "batch", result.batch_id.clone())
        })?;
        f(batch);
        state.results.insert(result.batch_id.clone(), result);
        self.save(&state)
    }

    pub fn get_result(&self, batch_id: &str) -> Option<BatchResult> {
        self.state.lock().results.get(batch_id).cloned()
    }

    pub fn get_results(&self) -> Vec<BatchResult> {
        self.state.lock().results.values().cloned().collect()
    }

    pub fn result_count(&self) -> usize {
        self.state.lock().results.len()
    }
}
