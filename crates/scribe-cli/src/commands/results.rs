//! Inspection and reporting of stored batch results

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use tabled::{settings::Style, Table, Tabled};
use tracing::{debug, info};

use scribe_bench::{BatchBenchmarkRegistry, BatchReport, BatchResult};

use crate::commands::{open_registry, Command};
use crate::config::Config;
use crate::utils::{format_seconds, print_output, print_success};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Markdown,
}

#[derive(Args, Debug)]
pub struct ResultsCommand {
    #[command(subcommand)]
    pub action: ResultsAction,
}

#[derive(Subcommand, Debug)]
pub enum ResultsAction {
    /// Show the per-unit results of a batch
    Show {
        /// Batch id
        batch_id: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Write a model comparison report for a batch
    Report {
        /// Batch id
        batch_id: String,

        /// Write the markdown report to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct UnitRow {
    model: String,
    prompt: usize,
    runs: usize,
    load: String,
    generation: String,
    #[tabled(rename = "tokens/s")]
    tokens_per_second: String,
    #[tabled(rename = "peak MB")]
    peak_memory: String,
    bleu: String,
    perplexity: String,
}

#[derive(Tabled)]
struct ModelRow {
    model: String,
    units: usize,
    #[tabled(rename = "tokens/s")]
    tokens_per_second: String,
    generation: String,
    #[tabled(rename = "peak MB")]
    peak_memory: String,
    relative: String,
}

fn optional(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "-".to_string())
}

fn unit_rows(result: &BatchResult) -> Vec<UnitRow> {
    result
        .benchmark_results
        .values()
        .flatten()
        .map(|r| UnitRow {
            model: r.model_id.clone(),
            prompt: r.prompt_index + 1,
            runs: r.generation_times.len(),
            load: format_seconds(r.load_time_seconds),
            generation: format_seconds(r.avg_generation_time),
            tokens_per_second: format!("{:.2}", r.avg_tokens_per_second),
            peak_memory: format!("{:.1}", r.peak_memory_mb),
            bleu: optional(r.bleu_score(), 3),
            perplexity: optional(r.perplexity(), 2),
        })
        .collect()
}

/// Print the per-model summary of a report as a table
pub fn print_summary_table(report: &BatchReport) {
    let rows: Vec<ModelRow> = report
        .models
        .iter()
        .map(|m| ModelRow {
            model: m.model_id.clone(),
            units: m.units,
            tokens_per_second: format!("{:.2}", m.mean_tokens_per_second),
            generation: format_seconds(m.mean_generation_time),
            peak_memory: format!("{:.1}", m.peak_memory_mb),
            relative: report
                .analysis
                .relative_performance
                .iter()
                .find(|r| r.model_id == m.model_id)
                .map(|r| format!("{:.2}x", r.relative_to_fastest))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::modern()));
}

fn load_result(registry: &BatchBenchmarkRegistry, batch_id: &str) -> Result<BatchResult> {
    if registry.get_batch(batch_id).is_none() {
        anyhow::bail!("Unknown batch '{}'", batch_id);
    }
    registry
        .get_result(batch_id)
        .with_context(|| format!("Batch '{}' has no results yet", batch_id))
}

#[async_trait]
impl Command for ResultsCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing results command: {:?}", self.action);
        let registry = open_registry(config)?;

        match &self.action {
            ResultsAction::Show { batch_id, format } => {
                let result = load_result(&registry, batch_id)?;
                let format = if json_output { OutputFormat::Json } else { *format };
                match format {
                    OutputFormat::Json => print_output(&serde_json::to_value(&result)?, true)?,
                    OutputFormat::Markdown => {
                        print!("{}", BatchReport::from_result(&result).to_markdown())
                    }
                    OutputFormat::Table => {
                        println!(
                            "Batch {}: {} unit(s), {} failed, {}",
                            result.batch_id,
                            result.total_units,
                            result.failed_units,
                            format_seconds(result.duration_seconds)
                        );
                        if let Some(error) = &result.error {
                            println!("Stopped: {}", error);
                        }
                        let rows = unit_rows(&result);
                        if rows.is_empty() {
                            println!("No unit results recorded");
                        } else {
                            println!("{}", Table::new(rows).with(Style::modern()));
                        }
                    }
                }
            }
            ResultsAction::Report { batch_id, output } => {
                let report = BatchReport::from_result(&load_result(&registry, batch_id)?);
                match output {
                    Some(path) => {
                        std::fs::write(path, report.to_markdown()).with_context(|| {
                            format!("Failed to write report: {}", path.display())
                        })?;
                        info!("Report for batch {} written to {}", batch_id, path.display());
                        if json_output {
                            print_output(&json!({ "report": path }), true)?;
                        } else {
                            print_success(&format!("Report written to {}", path.display()));
                        }
                    }
                    None if json_output => print_output(&serde_json::to_value(&report)?, true)?,
                    None => print!("{}", report.to_markdown()),
                }
            }
        }
        Ok(())
    }
}
