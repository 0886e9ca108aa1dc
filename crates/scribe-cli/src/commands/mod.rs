//! Command implementations for the scribe CLI

pub mod batch;
pub mod results;
pub mod template;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use scribe_bench::{BatchBenchmarkRegistry, BatchOrchestrator, BenchmarkRunner};
use scribe_core::memory::ProcessMemoryProbe;
use scribe_core::model::{CommandLoader, ModelCache};
use scribe_core::progress::ProgressTracker;

use crate::config::Config;

/// Trait for CLI command execution
#[async_trait]
pub trait Command {
    /// Execute the command
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()>;
}

/// Open the registry in the configured data directory
pub fn open_registry(config: &Config) -> Result<Arc<BatchBenchmarkRegistry>> {
    let path = config.registry_path();
    debug!("Using registry {}", path.display());
    let registry = BatchBenchmarkRegistry::open(&path)
        .with_context(|| format!("Failed to open registry {}", path.display()))?;
    Ok(Arc::new(registry))
}

/// Wire an orchestrator around the command backend from the configuration
pub fn build_orchestrator(
    config: &Config,
    registry: Arc<BatchBenchmarkRegistry>,
    tracker: Arc<ProgressTracker>,
) -> BatchOrchestrator {
    let loader = CommandLoader::new(config.backend.clone(), config.model_search_dirs());
    let cache = Arc::new(ModelCache::new(Arc::new(loader)));
    let runner = Arc::new(BenchmarkRunner::new(
        cache,
        Arc::new(ProcessMemoryProbe::new()),
    ));
    BatchOrchestrator::new(registry, runner, tracker)
}
