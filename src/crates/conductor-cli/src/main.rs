//! # conductor
//!
//! Command-line entrypoint: run a plan document against real agent CLIs (or
//! the mock runner), and inspect past executions in the log.
//!
//! Exit codes: 0 success, 1 execution failed, 2 bad usage, 130 cancelled.

mod git_effects;
mod plan_yaml;

use clap::{Parser, Subcommand};
use conductor_agents::ProcessSupervisor;
use conductor_core::{AgentRunner, Engine, EngineConfig, MockRunner};
use conductor_governor::{AnthropicClient, Governor, OpenAiClient, ThrottleConfig};
use conductor_store::{ExecutionLog, ExecutionStatus};
use git_effects::{GitEffectOptions, MergeMethod};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Drive AI coding agents through declarative plans", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the execution log database.
    #[arg(long, env = "CONDUCTOR_DB", default_value = "conductor.db", global = true)]
    database: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan document.
    Run {
        /// Path to the YAML plan.
        plan: PathBuf,

        /// Bypass spawning; every agent returns a stubbed successful result.
        #[arg(long, env = "CONDUCTOR_MOCK")]
        mock: bool,

        /// Reconciliation passes before giving up.
        #[arg(long, default_value_t = 100)]
        max_iterations: u32,

        /// Run parallel groups one dispatch at a time.
        #[arg(long)]
        sequential: bool,

        /// Concurrent dispatches inside a parallel group.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Global wall-clock limit for the whole run, in milliseconds.
        #[arg(long)]
        time_limit_ms: Option<u64>,

        /// Branch the commit effect folds work into.
        #[arg(long)]
        target_branch: Option<String>,

        /// How the commit effect merges into the target branch.
        #[arg(long, value_enum, default_value_t = MergeMethod::Merge)]
        merge_method: MergeMethod,

        /// Skip rebasing onto the target branch after commits.
        #[arg(long)]
        skip_rebase: bool,
    },

    /// List recorded executions.
    List,

    /// Show one execution: invocations and frames.
    Show {
        /// Execution id (or unique prefix).
        execution: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let code = runtime.block_on(run(cli));
    ExitCode::from(code)
}

fn database_url(database: &str) -> String {
    if database.starts_with("sqlite:") {
        database.to_string()
    } else {
        format!("sqlite:{database}")
    }
}

async fn run(cli: Cli) -> u8 {
    let log = match ExecutionLog::open(&database_url(&cli.database)).await {
        Ok(log) => Arc::new(log),
        Err(e) => {
            eprintln!("error: cannot open execution log: {e}");
            return EXIT_FAILED;
        }
    };

    match cli.command {
        Commands::Run {
            plan,
            mock,
            max_iterations,
            sequential,
            concurrency,
            time_limit_ms,
            target_branch,
            merge_method,
            skip_rebase,
        } => {
            let loaded = match plan_yaml::load(&plan) {
                Ok(loaded) => loaded,
                Err(e) => {
                    eprintln!("error: {e}");
                    return EXIT_USAGE;
                }
            };

            let runner: Arc<dyn AgentRunner> = if mock {
                Arc::new(MockRunner::new().with_default_output("mock output"))
            } else {
                Arc::new(ProcessSupervisor::new())
            };

            let mut governor =
                Governor::new(ThrottleConfig::default()).with_store(Arc::clone(&log));
            governor.register_provider(Arc::new(AnthropicClient::new()));
            governor.register_provider(Arc::new(OpenAiClient::new()));

            let effects = git_effects::registry(GitEffectOptions {
                target_branch,
                merge_method,
                skip_rebase,
            });

            let engine = Engine::new(Arc::clone(&log), runner)
                .with_governor(Arc::new(governor))
                .with_effects(effects)
                .with_config(EngineConfig {
                    max_iterations,
                    concurrency,
                    sequential,
                    time_limit_ms,
                    ..EngineConfig::default()
                });

            let cancel = engine.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling execution");
                    cancel.cancel();
                }
            });

            let report = match engine
                .run(&loaded.root, &loaded.name, plan.to_str())
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("error: {e}");
                    return EXIT_FAILED;
                }
            };

            log.close().await;
            match report.status {
                ExecutionStatus::Succeeded => {
                    println!(
                        "execution {} succeeded: {} frames, {} invocations (log: {})",
                        report.execution_id, report.frames, report.invocations, cli.database
                    );
                    EXIT_OK
                }
                ExecutionStatus::Cancelled => {
                    eprintln!(
                        "execution {} cancelled (log: {})",
                        report.execution_id, cli.database
                    );
                    EXIT_CANCELLED
                }
                _ => {
                    eprintln!(
                        "execution {} failed: {} (log: {})",
                        report.execution_id,
                        report.error.as_deref().unwrap_or("see invocation rows"),
                        cli.database
                    );
                    EXIT_FAILED
                }
            }
        }

        Commands::List => {
            let executions = match log.list_executions().await {
                Ok(rows) => rows,
                Err(e) => {
                    eprintln!("error: {e}");
                    return EXIT_FAILED;
                }
            };
            for row in executions {
                println!(
                    "{}  {:<10} {}  {}",
                    row.id,
                    row.status,
                    row.started_at,
                    row.plan_name
                );
            }
            EXIT_OK
        }

        Commands::Show { execution } => match show_execution(&log, &execution).await {
            Ok(()) => EXIT_OK,
            Err(e) => {
                eprintln!("error: {e}");
                EXIT_FAILED
            }
        },
    }
}

async fn show_execution(log: &ExecutionLog, id_or_prefix: &str) -> anyhow::Result<()> {
    let executions = log.list_executions().await?;
    let row = executions
        .iter()
        .find(|e| e.id == id_or_prefix || e.id.starts_with(id_or_prefix))
        .ok_or_else(|| anyhow::anyhow!("no execution matching '{id_or_prefix}'"))?;

    println!("execution {}", row.id);
    println!("  plan:    {}", row.plan_name);
    println!("  status:  {}", row.status);
    println!("  started: {}", row.started_at);
    if let Some(finished) = &row.finished_at {
        println!("  finished: {finished}");
    }

    println!("\ninvocations:");
    for invocation in log.list_invocations(&row.id).await? {
        println!(
            "  [{}] {} {} ({} in / {} out tokens, {} turns){}",
            invocation.seq,
            invocation.kind,
            invocation.status,
            invocation.input_tokens,
            invocation.output_tokens,
            invocation.turn_count,
            invocation
                .error
                .as_deref()
                .map(|e| format!(" — {e}"))
                .unwrap_or_default()
        );
    }

    println!("\nframes:");
    for frame in log.list_frames(&row.id).await? {
        println!("--- frame {} ({})", frame.frame_index, frame.created_at);
        println!("{}", frame.document);
    }
    Ok(())
}
