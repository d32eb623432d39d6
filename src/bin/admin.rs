//! Workflow Engine Admin CLI
//!
//! Operator tool for checking definitions and expressions before they reach a
//! running engine, and for computing the domain keys and proposal hashes the
//! engine stores.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use workflow_engine::engine::expression::ExpressionVars;
use workflow_engine::engine::validate_definition;
use workflow_engine::models::{compute_proposal_hash, domain_key, normalize_fields};
use workflow_engine::{EngineConfig, ExpressionEvaluator, WorkflowDefinition};

#[derive(Parser)]
#[command(name = "workflow-engine-admin")]
#[command(about = "Workflow engine admin CLI - validate definitions and inspect engine values")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file used for expression limits
    #[arg(short, long, env = "WORKFLOW_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition JSON file
    Validate {
        /// Path to the definition
        file: String,
    },

    /// Evaluate an expression
    Eval {
        /// Expression source, e.g. `object.status == "approved"`
        expression: String,

        /// Variables as a JSON object, e.g. '{"object": {"status": "draft"}}'
        #[arg(long, default_value = "{}")]
        vars: String,
    },

    /// Compute the proposal hash of a JSON change set
    Hash {
        /// Changes as a JSON object
        changes: String,
    },

    /// Compute the domain key of a field list
    DomainKey {
        /// Field names
        #[arg(required = true)]
        fields: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let evaluator = ExpressionEvaluator::new(config.expression.clone());

    match cli.command {
        Commands::Validate { file } => validate_file(&evaluator, &file)?,
        Commands::Eval { expression, vars } => eval_expression(&evaluator, &expression, &vars)?,
        Commands::Hash { changes } => {
            let changes = parse_object(&changes).context("parsing changes")?;
            println!("{}", compute_proposal_hash(&changes)?);
        }
        Commands::DomainKey { fields } => {
            debug!(normalized = ?normalize_fields(&fields), "normalized fields");
            println!("{}", domain_key(&fields));
        }
    }

    Ok(())
}

fn validate_file(evaluator: &ExpressionEvaluator, file: &str) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    let mut definition: WorkflowDefinition =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file))?;

    if let Err(err) = validate_definition(&definition, evaluator) {
        error!(file, error = %err, "definition is invalid");
        bail!("{}: {}", file, err);
    }

    definition.derive_trigger_prefilter();
    info!(
        file,
        actions = definition.document.actions.len(),
        trigger_operations = ?definition.trigger_operations,
        "definition is valid"
    );
    println!(
        "✅ {} is valid ({} triggers, {} actions, fields: {})",
        definition.name,
        definition.document.triggers.len(),
        definition.document.actions.len(),
        definition.trigger_fields.join(",")
    );
    Ok(())
}

fn eval_expression(evaluator: &ExpressionEvaluator, expression: &str, vars: &str) -> Result<()> {
    let vars = parse_object(vars).context("parsing --vars")?;
    let mut scope = ExpressionVars::new();
    scope.extend(&vars);

    let value = evaluator.evaluate_value(expression, &scope)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {}", other),
    }
}
