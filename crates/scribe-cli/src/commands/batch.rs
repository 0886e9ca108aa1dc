//! Batch creation, execution and cancellation

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Subcommand};
use serde_json::json;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::{debug, info, warn};

use scribe_bench::orchestrator::progress_operation_id;
use scribe_bench::{BatchBenchmark, BatchBenchmarkRegistry, BatchReport, CancellationToken};
use scribe_core::progress::{ProgressInfo, ProgressTracker};

use crate::commands::results::print_summary_table;
use crate::commands::{build_orchestrator, open_registry, Command};
use crate::config::Config;
use crate::utils::{
    create_progress_bar, format_seconds, format_timestamp, print_output, print_success,
    print_warning, PROGRESS_STEPS,
};

#[derive(Args, Debug)]
pub struct BatchCommand {
    #[command(subcommand)]
    pub action: BatchAction,
}

#[derive(Subcommand, Debug)]
pub enum BatchAction {
    /// Register a batch that runs a template over several models
    Create(CreateBatch),

    /// List registered batches
    #[command(alias = "ls")]
    List,

    /// Show one batch
    Show {
        /// Batch id
        id: String,
    },

    /// Run a batch in the foreground; Ctrl-C cancels it
    Run {
        /// Batch id
        id: String,
    },

    /// Mark a running batch as cancelled
    Cancel {
        /// Batch id
        id: String,
    },

    /// Delete a batch and its results
    #[command(alias = "rm")]
    Delete {
        /// Batch id
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct CreateBatch {
    /// Batch name
    #[arg(short, long)]
    pub name: String,

    /// Template id
    #[arg(short, long)]
    pub template: String,

    /// Model id or path, repeat for several models
    #[arg(short, long = "model", required = true)]
    pub models: Vec<String>,

    /// Run units on a worker pool
    #[arg(long)]
    pub parallel: bool,

    /// Worker pool size, implies --parallel
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Tag attached to every result, repeatable
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Free-form description
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Tabled)]
struct BatchRow {
    id: String,
    name: String,
    template: String,
    models: String,
    mode: String,
    status: String,
    started: String,
    completed: String,
}

impl From<&BatchBenchmark> for BatchRow {
    fn from(b: &BatchBenchmark) -> Self {
        Self {
            id: b.id.clone(),
            name: b.name.clone(),
            template: b.template_id.clone(),
            models: b.model_ids.join(","),
            mode: if b.is_parallel() {
                format!("parallel x{}", b.max_workers)
            } else {
                "sequential".to_string()
            },
            status: b.status.to_string(),
            started: format_timestamp(b.started_at),
            completed: format_timestamp(b.completed_at),
        }
    }
}

#[async_trait]
impl Command for BatchCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing batch command: {:?}", self.action);
        let registry = open_registry(config)?;

        match &self.action {
            BatchAction::Create(args) => {
                let batch = registry.create_batch_benchmark(args.build(config))?;
                if json_output {
                    print_output(&batch.to_json()?, true)?;
                } else {
                    print_success(&format!("Created batch '{}' with id {}", batch.name, batch.id));
                }
            }
            BatchAction::List => {
                let batches = registry.get_batches();
                if json_output {
                    print_output(&serde_json::to_value(&batches)?, true)?;
                } else if batches.is_empty() {
                    println!("No batches registered");
                } else {
                    let rows: Vec<BatchRow> = batches.iter().map(BatchRow::from).collect();
                    println!("{}", Table::new(rows).with(Style::modern()));
                }
            }
            BatchAction::Show { id } => match registry.get_batch(id) {
                Some(batch) => print_output(&batch.to_json()?, json_output)?,
                None => bail!("Unknown batch '{}'", id),
            },
            BatchAction::Run { id } => run_batch(config, registry, id, json_output).await?,
            BatchAction::Cancel { id } => {
                if registry.get_batch(id).is_none() {
                    bail!("Unknown batch '{}'", id);
                }
                let tracker = Arc::new(ProgressTracker::new());
                let orchestrator = build_orchestrator(config, registry, tracker);
                let cancelled = orchestrator.cancel_batch_benchmark(id)?;
                if json_output {
                    print_output(&json!({ "batch_id": id, "cancelled": cancelled }), true)?;
                } else if cancelled {
                    print_success(&format!("Batch {} cancelled", id));
                } else {
                    print_warning(&format!("Batch {} is not running", id));
                }
            }
            BatchAction::Delete { id } => {
                if !registry.delete_batch(id)? {
                    bail!("Unknown batch '{}'", id);
                }
                if json_output {
                    print_output(&json!({ "deleted": id }), true)?;
                } else {
                    print_success(&format!("Deleted batch {}", id));
                }
            }
        }
        Ok(())
    }
}

impl CreateBatch {
    fn build(&self, config: &Config) -> BatchBenchmark {
        let parallel = self.parallel || self.workers.is_some() || config.batch.parallel;
        let workers = self.workers.unwrap_or(config.batch.max_workers);
        let mut batch = BatchBenchmark::new(&self.name, &self.template, self.models.clone())
            .with_parallelism(parallel, workers)
            .with_tags(self.tags.iter().cloned());
        if let Some(description) = &self.description {
            batch = batch.with_description(description);
        }
        batch
    }
}

async fn run_batch(
    config: &Config,
    registry: Arc<BatchBenchmarkRegistry>,
    batch_id: &str,
    json_output: bool,
) -> Result<()> {
    let tracker = Arc::new(ProgressTracker::new());
    let orchestrator = Arc::new(build_orchestrator(config, registry, tracker.clone()));

    let bar = (!json_output).then(|| create_progress_bar(PROGRESS_STEPS, "Starting batch"));
    if let Some(bar) = &bar {
        let bar = bar.clone();
        tracker.register_callback(
            &progress_operation_id(batch_id),
            Arc::new(move |info: &ProgressInfo| {
                bar.set_position((info.progress * PROGRESS_STEPS as f64).round() as u64);
                bar.set_message(info.message.clone());
            }),
        );
    }

    let token = CancellationToken::new();
    let mut worker = tokio::task::spawn_blocking({
        let orchestrator = orchestrator.clone();
        let batch_id = batch_id.to_string();
        let token = token.clone();
        move || orchestrator.run_batch_benchmark_with(&batch_id, token)
    });

    // The registry transition cancels the token of the running batch.
    let interrupt = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let batch_id = batch_id.to_string();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, cancelling batch {}", batch_id);
                if let Err(e) = orchestrator.cancel_batch_benchmark(&batch_id) {
                    warn!("Could not cancel batch {}: {}", batch_id, e);
                }
            }
        }
    });

    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = token.cancelled() => {
            if let Some(bar) = &bar {
                bar.set_message("Cancelling after in-flight units finish");
            }
            worker.await
        }
    };
    interrupt.abort();
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let result = joined
        .context("Batch worker thread panicked")?
        .with_context(|| format!("Batch {} failed", batch_id))?;

    if json_output {
        return print_output(&serde_json::to_value(&result)?, true);
    }

    match &result.error {
        Some(error) => print_warning(&format!(
            "Batch {} stopped ({}) with {} result(s)",
            batch_id,
            error,
            result.result_count()
        )),
        None => print_success(&format!(
            "Batch {} completed: {} result(s), {} failed unit(s) in {}",
            batch_id,
            result.result_count(),
            result.failed_units,
            format_seconds(result.duration_seconds)
        )),
    }
    let report = BatchReport::from_result(&result);
    if !report.models.is_empty() {
        print_summary_table(&report);
    }
    Ok(())
}
