//! Model loading seam and the shared model cache
//!
//! Benchmarks treat models as opaque text generators: a [`ModelLoader`]
//! turns a model id into a [`TextGenerator`], and the [`ModelCache`] keeps
//! loaded generators around so repeated benchmarks against the same model
//! skip the load. The cache has its own lock, independent of any registry.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::{CoreError, Result};

/// Sampling parameters passed to a generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    /// Ask the backend for per-token log-probabilities if it supports them
    pub want_logprobs: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.7,
            top_p: 0.9,
            want_logprobs: false,
        }
    }
}

/// Output of a single generation call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Generation {
    pub text: String,
    /// Number of generated tokens as reported (or estimated) by the backend
    pub tokens: usize,
    pub logprobs: Option<Vec<f32>>,
}

/// A loaded model able to generate text
pub trait TextGenerator: Send + Sync {
    fn model_id(&self) -> &str;

    /// Backend family, e.g. `gguf` or `command`
    fn model_type(&self) -> &str;

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Generation>;
}

/// Loads models by id. Loads may be slow and may fail.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_id: &str) -> Result<Arc<dyn TextGenerator>>;
}

/// Counters for the model cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelCacheStats {
    pub cached_models: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct CacheState {
    models: HashMap<String, Arc<dyn TextGenerator>>,
    hits: u64,
    misses: u64,
}

/// Model id -> loaded generator, shared across benchmark runs
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    state: Mutex<CacheState>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Return the cached generator or load it. The flag is `true` on a hit.
    ///
    /// The load runs without holding the cache lock; if two threads load the
    /// same model concurrently the first insert wins and both get that handle.
    pub fn get_or_load(&self, model_id: &str) -> Result<(Arc<dyn TextGenerator>, bool)> {
        {
            let mut state = self.state.lock();
            if let Some(model) = state.models.get(model_id).cloned() {
                state.hits += 1;
                trace!("Model cache hit for {}", model_id);
                return Ok((model, true));
            }
            state.misses += 1;
        }

        debug!("Model cache miss for {}, loading", model_id);
        let loaded = self.loader.load(model_id)?;

        let mut state = self.state.lock();
        let model = state
            .models
            .entry(model_id.to_string())
            .or_insert(loaded)
            .clone();
        info!("Loaded model {} ({})", model_id, model.model_type());
        Ok((model, false))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.state.lock().models.contains_key(model_id)
    }

    pub fn evict(&self, model_id: &str) -> bool {
        self.state.lock().models.remove(model_id).is_some()
    }

    pub fn clear(&self) {
        self.state.lock().models.clear();
    }

    pub fn stats(&self) -> ModelCacheStats {
        let state = self.state.lock();
        ModelCacheStats {
            cached_models: state.models.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }
}

/// How to invoke an external inference executable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    /// Arguments with `{model}`, `{prompt}`, `{max_tokens}`, `{temperature}`
    /// and `{top_p}` placeholders
    pub args: Vec<String>,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            program: PathBuf::from("llama-cli"),
            args: [
                "-m",
                "{model}",
                "-p",
                "{prompt}",
                "-n",
                "{max_tokens}",
                "--temp",
                "{temperature}",
                "--top-p",
                "{top_p}",
                "--no-display-prompt",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl CommandSpec {
    fn render_args(&self, model: &Path, prompt: &str, params: &GenerationParams) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &model.to_string_lossy())
                    .replace("{max_tokens}", &params.max_tokens.to_string())
                    .replace("{temperature}", &params.temperature.to_string())
                    .replace("{top_p}", &params.top_p.to_string())
                    .replace("{prompt}", prompt)
            })
            .collect()
    }
}

/// Loader that resolves model files on disk and runs them through an
/// external executable
#[derive(Debug, Clone)]
pub struct CommandLoader {
    spec: CommandSpec,
    model_dirs: Vec<PathBuf>,
}

impl CommandLoader {
    pub fn new(spec: CommandSpec, model_dirs: Vec<PathBuf>) -> Self {
        Self { spec, model_dirs }
    }

    /// Find a model file: the id itself as a path, its `~`/env expansion,
    /// then `<dir>/<id>` and `<dir>/<id>.gguf` for each model directory.
    pub fn resolve_model(&self, model_id: &str) -> Result<PathBuf> {
        let direct = Path::new(model_id);
        if direct.exists() {
            return Ok(direct.to_path_buf());
        }

        if let Ok(expanded) = shellexpand::full(model_id) {
            let expanded = Path::new(expanded.as_ref());
            if expanded.exists() {
                return Ok(expanded.to_path_buf());
            }
        }

        for dir in &self.model_dirs {
            let candidate = dir.join(model_id);
            if candidate.exists() {
                return Ok(candidate);
            }
            let with_ext = dir.join(format!("{}.gguf", model_id));
            if with_ext.exists() {
                return Ok(with_ext);
            }
        }

        Err(CoreError::model(
            "MODEL_NOT_FOUND",
            model_id,
            format!("Model '{}' not found in any configured directory", model_id),
            "Pass a path to the model file or add its directory to model_dirs",
        ))
    }
}

impl ModelLoader for CommandLoader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn TextGenerator>> {
        if self.spec.program.as_os_str().is_empty() {
            return Err(CoreError::configuration(
                "BACKEND_NOT_CONFIGURED",
                "No backend program is configured",
                format!("Loading model '{}'", model_id),
                "Set backend.program in the configuration file",
            ));
        }
        let path = self.resolve_model(model_id)?;
        let model_type = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => "command".to_string(),
        };
        Ok(Arc::new(CommandGenerator {
            model_id: model_id.to_string(),
            model_type,
            path,
            spec: self.spec.clone(),
        }))
    }
}

/// Generator backed by one process invocation per call
#[derive(Debug)]
pub struct CommandGenerator {
    model_id: String,
    model_type: String,
    path: PathBuf,
    spec: CommandSpec,
}

impl TextGenerator for CommandGenerator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Generation> {
        let args = self.spec.render_args(&self.path, prompt, params);
        debug!("Running {} for {}", self.spec.program.display(), self.model_id);

        let output = Command::new(&self.spec.program)
            .args(&args)
            .output()
            .map_err(|e| {
                CoreError::generation(
                    "BACKEND_SPAWN_FAILED",
                    &self.model_id,
                    format!("Failed to start {}: {}", self.spec.program.display(), e),
                    "Check the backend program in the configuration",
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::generation(
                "BACKEND_FAILED",
                &self.model_id,
                format!("Backend exited with {}: {}", output.status, stderr.trim()),
                "Run the backend command manually to inspect the failure",
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let tokens = text.split_whitespace().count();
        Ok(Generation {
            text,
            tokens,
            logprobs: None,
        })
    }
}
