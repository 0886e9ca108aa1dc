//! Benchmark template management

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Args, Subcommand};
use serde_json::json;
use tabled::{settings::Style, Table, Tabled};
use tracing::debug;

use scribe_bench::BenchmarkTemplate;

use crate::commands::{open_registry, Command};
use crate::config::Config;
use crate::utils::{format_timestamp, print_output, print_success};

#[derive(Args, Debug)]
pub struct TemplateCommand {
    #[command(subcommand)]
    pub action: TemplateAction,
}

#[derive(Subcommand, Debug)]
pub enum TemplateAction {
    /// Register a new template
    Create(CreateTemplate),

    /// List registered templates
    #[command(alias = "ls")]
    List,

    /// Show one template
    Show {
        /// Template id
        id: String,
    },

    /// Delete a template that no batch references
    #[command(alias = "rm")]
    Delete {
        /// Template id
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct CreateTemplate {
    /// Template name
    #[arg(short, long)]
    pub name: String,

    /// Prompt text, repeat for several prompts
    #[arg(short, long = "prompt", required = true)]
    pub prompts: Vec<String>,

    /// Reference text for the prompt at the same position
    #[arg(short, long = "reference")]
    pub references: Vec<String>,

    /// Free-form description
    #[arg(long)]
    pub description: Option<String>,

    /// Maximum tokens to generate per run
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Runs per prompt
    #[arg(long)]
    pub runs: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Top-p sampling threshold
    #[arg(long)]
    pub top_p: Option<f32>,

    /// Tag attached to every result, repeatable
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Keep per-token log-probabilities
    #[arg(long)]
    pub logprobs: bool,
}

#[derive(Tabled)]
struct TemplateRow {
    id: String,
    name: String,
    prompts: usize,
    runs: u32,
    max_tokens: usize,
    tags: String,
    created: String,
}

impl From<&BenchmarkTemplate> for TemplateRow {
    fn from(t: &BenchmarkTemplate) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            prompts: t.prompts.len(),
            runs: t.num_runs,
            max_tokens: t.max_tokens,
            tags: t.tags.iter().cloned().collect::<Vec<_>>().join(","),
            created: format_timestamp(Some(t.created_at)),
        }
    }
}

#[async_trait]
impl Command for TemplateCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing template command: {:?}", self.action);
        let registry = open_registry(config)?;

        match &self.action {
            TemplateAction::Create(args) => {
                let template = registry.create_benchmark_template(args.build(config))?;
                if json_output {
                    print_output(&template.to_json()?, true)?;
                } else {
                    print_success(&format!(
                        "Created template '{}' with id {}",
                        template.name, template.id
                    ));
                }
            }
            TemplateAction::List => {
                let templates = registry.get_benchmark_templates();
                if json_output {
                    print_output(&serde_json::to_value(&templates)?, true)?;
                } else if templates.is_empty() {
                    println!("No templates registered");
                } else {
                    let rows: Vec<TemplateRow> = templates.iter().map(TemplateRow::from).collect();
                    println!("{}", Table::new(rows).with(Style::modern()));
                }
            }
            TemplateAction::Show { id } => match registry.get_template(id) {
                Some(template) => print_output(&template.to_json()?, json_output)?,
                None => bail!("Unknown template '{}'", id),
            },
            TemplateAction::Delete { id } => {
                if !registry.delete_template(id)? {
                    bail!("Unknown template '{}'", id);
                }
                if json_output {
                    print_output(&json!({ "deleted": id }), true)?;
                } else {
                    print_success(&format!("Deleted template {}", id));
                }
            }
        }
        Ok(())
    }
}

impl CreateTemplate {
    fn build(&self, config: &Config) -> BenchmarkTemplate {
        let defaults = &config.generation;
        let mut template = BenchmarkTemplate::new(&self.name, self.prompts.clone())
            .with_max_tokens(self.max_tokens.unwrap_or(defaults.max_tokens))
            .with_num_runs(self.runs.unwrap_or(defaults.num_runs))
            .with_sampling(
                self.temperature.unwrap_or(defaults.temperature),
                self.top_p.unwrap_or(defaults.top_p),
            )
            .with_tags(self.tags.iter().cloned())
            .with_logprobs(self.logprobs);
        if let Some(description) = &self.description {
            template = template.with_description(description);
        }
        if !self.references.is_empty() {
            template = template.with_reference_texts(self.references.clone());
        }
        template
    }
}
