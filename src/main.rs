//! Explorer Engine - Command Line Entry Point
//!
//! Loads an explorer config and an instructions file, brings an engine up,
//! runs a search and prints a JSON summary of the result.

use anyhow::Context;
use clap::Parser;
use explorer_engine::{
    engine::{ExplorerEngine, FileInstructions, QueryForm, QuerySpec},
    persistence::FileStorage,
    pipeline::{ScriptProcessor, StageKind},
    ExplorerConfig,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "explorer-engine", version, about)]
struct Cli {
    /// Explorer config (TOML or JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON array of instructions to explore
    #[arg(short, long)]
    instructions: PathBuf,

    /// Advanced query predicate, e.g. `metric.name == "loss"`, used instead
    /// of the configured initial query
    #[arg(short, long)]
    query: Option<String>,

    /// Rhai script used as the custom stage
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Print every output record, not just the counts
    #[arg(long)]
    records: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,explorer_engine=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ExplorerConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => ExplorerConfig::default(),
    };
    if let Some(query) = cli.query {
        config.initial_state.query = Some(QuerySpec {
            form: QueryForm {
                advanced_mode: true,
                advanced_input: query,
                ..QueryForm::default()
            },
            ..QuerySpec::default()
        });
    }
    tracing::info!("Starting explorer '{}'", config.name);

    let mut builder = ExplorerEngine::builder(config.clone())
        .source(Arc::new(FileInstructions::new(&cli.instructions)));
    if config.persist {
        builder = builder.storage(Arc::new(
            FileStorage::default_location().context("Failed to open local storage")?,
        ));
    }
    if let Some(path) = &cli.script {
        builder = builder.processor(Arc::new(
            ScriptProcessor::from_file(path).context("Failed to load custom stage script")?,
        ));
    }
    let engine = builder.build();

    let teardown = engine.initialize().await?;

    let pipeline = engine.pipeline();
    let output = pipeline.output();
    let stats = pipeline.stats();
    let stages: serde_json::Map<String, serde_json::Value> = StageKind::ORDER
        .iter()
        .map(|stage| {
            let s = stats.get(*stage);
            (stage.name().to_string(), json!({ "runs": s.runs, "hits": s.hits }))
        })
        .collect();
    let mut summary = json!({
        "engine": config.name,
        "status": pipeline.status(),
        "records": output.len(),
        "groups": output.group_count(),
        "stages": stages,
        "notifications": engine.notifications().list(),
    });
    if cli.records {
        summary["output"] = output
            .records
            .iter()
            .map(|record| json!({ "key": record.key, "fields": record.fields, "meta": record.meta }))
            .collect();
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);

    teardown.run();
    tracing::info!("Shutting down...");
    Ok(())
}
