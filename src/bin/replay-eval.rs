use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use replaykit::{EvalRunRequest, ProviderKind, ReplayConfig, RunEvent, RunOrchestrator};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, ValueEnum)]
enum ProviderArg {
    Openai,
    Gemini,
}

impl From<ProviderArg> for ProviderKind {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Openai => ProviderKind::OpenAI,
            ProviderArg::Gemini => ProviderKind::Gemini,
        }
    }
}

#[derive(Parser)]
#[command(name = "replay-eval")]
#[command(about = "Replay a draft prompt against recorded traces")]
struct Args {
    /// Run request file (JSON, or YAML by extension)
    #[arg(short, long)]
    request: PathBuf,

    /// Engine settings file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the request's provider
    #[arg(long, value_enum)]
    provider: Option<ProviderArg>,

    /// Override the request's model
    #[arg(long)]
    model: Option<String>,

    /// Override the request's concurrency
    #[arg(long)]
    concurrency: Option<usize>,

    /// Event id; reuse one to resume an interrupted run
    #[arg(long)]
    event_id: Option<String>,

    /// Print the full run result as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = ReplayConfig::load(args.config.as_deref())?;
    let mut request = EvalRunRequest::from_file(&args.request)?;
    if let Some(provider) = args.provider {
        request.provider = provider.into();
    }
    if let Some(model) = args.model {
        request.model = model;
    }
    if let Some(concurrency) = args.concurrency {
        request.concurrency = Some(concurrency);
    }

    let event = match args.event_id {
        Some(id) => RunEvent::with_id(id, request),
        None => RunEvent::new(request),
    };

    let orchestrator = RunOrchestrator::from_env(&config)?;
    let run = orchestrator.run(&event).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!(
            "Run {} ({}): total {}, succeeded {}, failed {}, matching original {}, {} ms",
            run.run_name,
            run.run_id,
            run.total,
            run.success_count,
            run.failure_count,
            run.matching_count,
            run.duration_ms
        );
        println!(
            "Tokens: {} prompt, {} completion",
            run.usage.prompt_tokens, run.usage.completion_tokens
        );
        if let Some(url) = &run.results_url {
            println!("Results: {url}");
        }
        for failure in run.failures() {
            println!(
                "Failed: {} - {}",
                failure.trace_id,
                failure.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    if run.failure_count > 0 {
        std::process::exit(1);
    }
    Ok(())
}
