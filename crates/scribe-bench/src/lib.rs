//! Scribe batch benchmarking
//!
//! This crate compares local language models by running prompt templates
//! against them:
//! - Benchmark templates and batch definitions ([`types`])
//! - A JSON-backed registry for templates, batches and results ([`registry`])
//! - Single-unit measurement of latency, throughput and memory ([`runner`])
//! - Sequential and worker-pool batch execution with cancellation ([`orchestrator`])
//! - Derived quality metrics and comparison reports ([`metrics`], [`report`])

pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod runner;
pub mod types;

pub use orchestrator::{plan_units, BatchOrchestrator, CancellationToken};
pub use registry::BatchBenchmarkRegistry;
pub use report::BatchReport;
pub use runner::BenchmarkRunner;
pub use types::{
    BatchBenchmark, BatchResult, BatchStatus, BenchmarkResult, BenchmarkTemplate, ModelBenchmark,
};

pub use scribe_core::{CoreError, Result};
