// ABOUTME: Command-line front end for the render service: render a snippet
// ABOUTME: file to an artifact, or check that the container engine is up

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use vitrine_renderer::{
    ContainerEngine, DockerEngine, ExecutionOrchestrator, RenderMode, RendererSettings,
    ResultSink, SandboxPool,
};

#[derive(Parser)]
#[command(name = "vitrine")]
#[command(about = "Vitrine - render Kivy snippets in disposable sandboxes")]
#[command(version)]
struct Cli {
    /// Path to a JSON settings file (defaults apply for missing sections)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the first runnable snippet found in a file
    Render {
        /// Input file: markdown with fenced Python blocks, or a raw .py file
        input: PathBuf,

        /// Artifact to produce
        #[arg(long, value_enum, default_value = "screenshot")]
        mode: ModeArg,

        /// Where to write the artifact (defaults to the artifact's file name)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the metrics snapshot as JSON after the run
        #[arg(long)]
        stats: bool,
    },
    /// Check that the container engine is reachable
    Ping,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Screenshot,
    Video,
}

impl From<ModeArg> for RenderMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Screenshot => RenderMode::Screenshot,
            ModeArg::Video => RenderMode::Video,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Arc::new(
        RendererSettings::load_or_default(cli.config.as_deref())
            .context("failed to load settings")?,
    );
    debug!(config = ?cli.config, pool_size = settings.pool.size, "Settings loaded");

    match cli.command {
        Commands::Ping => ping().await,
        Commands::Render {
            input,
            mode,
            out,
            stats,
        } => render(settings, input, mode.into(), out, stats).await,
    }
}

async fn ping() -> Result<()> {
    let engine = DockerEngine::connect().context("failed to connect to the container engine")?;
    engine
        .ping()
        .await
        .context("container engine did not respond")?;
    println!("{}", "Container engine is reachable".green());
    Ok(())
}

async fn render(
    settings: Arc<RendererSettings>,
    input: PathBuf,
    mode: RenderMode,
    out: Option<PathBuf>,
    stats: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(&input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    // Raw Python files have no fence of their own; wrap them so the
    // inspector sees one snippet covering the whole file.
    let text = if input.extension().is_some_and(|ext| ext == "py") {
        format!("```python\n{}\n```", raw)
    } else {
        raw
    };
    info!(input = %input.display(), %mode, "Submitting snippet for render");

    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerEngine::connect().context("failed to connect to the container engine")?);
    let pool = Arc::new(SandboxPool::new(engine.clone(), &settings));
    let metrics = Arc::new(ResultSink::new());
    let orchestrator =
        ExecutionOrchestrator::new(engine, pool.clone(), metrics.clone(), settings.clone());

    let ready = pool.initialize().await;
    println!("Pool ready with {} container(s)", ready);

    let exit_code = match orchestrator.submit(&text, mode).await {
        Ok(outcome) => {
            for line in &outcome.log_lines {
                println!("  {}", line.dimmed());
            }
            match outcome.artifact {
                Some(artifact) => {
                    let path = out.unwrap_or_else(|| PathBuf::from(&artifact.file_name));
                    match std::fs::write(&path, &artifact.bytes) {
                        Ok(()) => {
                            println!(
                                "{} {} ({} bytes, {:.1}s)",
                                "Rendered".green().bold(),
                                path.display(),
                                artifact.bytes.len(),
                                outcome.duration.as_secs_f64()
                            );
                            0
                        }
                        Err(e) => {
                            eprintln!(
                                "{} could not write {}: {}",
                                "Error:".red().bold(),
                                path.display(),
                                e
                            );
                            1
                        }
                    }
                }
                None => {
                    eprintln!("{} {}", "Render failed:".red().bold(), outcome.message);
                    1
                }
            }
        }
        Err(e) => {
            eprintln!("{} {}", "Rejected:".red().bold(), e);
            1
        }
    };

    if stats {
        let snapshot = metrics.snapshot().await;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    pool.drain().await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
