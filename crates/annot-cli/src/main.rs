//! annot - run LLM annotation experiments

mod config;
mod publications;

use std::path::PathBuf;
use std::sync::Arc;

use annot_agent::{Experiment, HandlerRegistry};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// annot - annotate publications with a language model
#[derive(Parser, Debug)]
#[command(name = "annot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an experiment over a folder of publications
    Run {
        /// Experiment config file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Folder with one `<uuid>/paper.md` per publication
        #[arg(short, long)]
        publications: PathBuf,

        /// JSON annotation schema, available to prompts as `{schema}`
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// Results are written to a timestamped folder below this one
        #[arg(short, long, default_value = "results")]
        output: PathBuf,
    },
    /// Print an example config file
    ExampleConfig,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "annot=debug" } else { "annot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::ExampleConfig => {
            print!("{}", config::example_config());
            Ok(())
        }
        Command::Run {
            config,
            publications,
            schema,
            output,
        } => run(config, publications, schema, output).await,
    }
}

async fn run(
    config_path: PathBuf,
    publications_dir: PathBuf,
    schema_path: Option<PathBuf>,
    output: PathBuf,
) -> anyhow::Result<()> {
    let config = config::load(&config_path)?;
    let publications = publications::load_publications(&publications_dir)?;
    let schema = schema_path
        .as_deref()
        .map(publications::load_schema)
        .transpose()?;

    let client = config.endpoint.client()?;
    if config.endpoint.dry_run {
        tracing::warn!("Dry run: no requests will be sent");
    } else {
        match client.key_info().await {
            Ok(info) => tracing::info!("{}", describe_key(&info)),
            Err(e) => tracing::warn!("Could not fetch API key info: {}", e),
        }
    }

    let registry = HandlerRegistry::with_builtins(None);
    let mut experiment = Experiment::new(
        config,
        &publications,
        schema.as_ref(),
        &registry,
        Arc::new(client),
    )?;

    let summary = experiment.run().await;

    let folder = output.join(chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string());
    experiment.save(&folder)?;

    println!(
        "{} conversations, {} failed ({:.1}s). Results in {}",
        summary.conversations,
        summary.failed,
        (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0,
        folder.display()
    );
    Ok(())
}

/// One-line summary of the key in use. The label arrives redacted.
fn describe_key(info: &annot_ai::KeyInfo) -> String {
    let limit = info
        .limit
        .map(|limit| format!("{:.4}", limit))
        .unwrap_or_else(|| "none".to_string());
    format!(
        "Using key '{}' (usage: {:.4}, limit: {})",
        info.label, info.usage, limit
    )
}
