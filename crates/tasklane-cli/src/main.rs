//! Tasklane CLI: run, check and schedule tasks from definition files.

// CLI-specific lint allowances (CLI binary, not library)
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI uses exit codes

use chrono::{Local, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use miette::{IntoDiagnostic, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasklane::config::{load_config_file, load_task_file, load_tasks_file};
use tasklane::policy::{explain_script, ScriptExplanation};
use tasklane::{
    CronScheduler, Engine, EngineConfig, EngineError, EngineResult, ErrorCode, LiveProgress,
    MemoryStore, RunStatus, Task,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod progress;

/// Environment variable holding the log filter, e.g. `tasklane=debug`.
const LOG_ENV: &str = "TASKLANE_LOG";

/// Extra time allowed past a run's deadline before `run` gives up waiting.
const WAIT_SLACK: Duration = Duration::from_secs(10);

/// Color output mode
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Debug, Parser)]
#[command(name = "tasklane", version, about = "Cron-driven script and HTTP task runner")]
struct Cli {
    /// Control color output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one task now and wait for it to finish
    Run {
        #[arg(long, help = "Task definition file (JSON or YAML)")]
        task: PathBuf,
        #[arg(long, help = "Engine configuration file (JSON or YAML)")]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[arg(long, short = 'v', help = "Stream output lines to stderr while running")]
        verbose: bool,
    },
    /// Check a script against the safety rules without running it
    Check {
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        script: Option<String>,
        #[arg(long, help = "Read the script body from a file")]
        file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show upcoming fire times of a cron expression
    NextRun {
        expr: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long)]
        json: bool,
    },
    /// Schedule every cron-enabled task and run until interrupted
    Serve {
        #[arg(long, help = "Task list file (JSON or YAML)")]
        tasks: PathBuf,
        #[arg(long, help = "Engine configuration file (JSON or YAML)")]
        config: Option<PathBuf>,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

/// Configure color output based on CLI flag and environment
fn configure_colors(mode: ColorMode) -> bool {
    let use_color = match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            std::env::var("NO_COLOR").is_err()
                && supports_color::on(supports_color::Stream::Stderr).is_some()
        }
    };
    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(use_color)
                .unicode(use_color)
                .build(),
        )
    }))
    .ok();
    use_color
}

fn init_tracing(default_filter: &str, ansi: bool) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let use_color = configure_colors(cli.color);
    let default_filter = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    init_tracing(default_filter, use_color);

    match cli.command {
        Commands::Run {
            task,
            config,
            json,
            verbose,
        } => cmd_run(&task, config.as_deref(), json, verbose),
        Commands::Check { script, file, json } => cmd_check(script, file, json),
        Commands::NextRun { expr, count, json } => cmd_next_run(&expr, count, json),
        Commands::Serve { tasks, config } => cmd_serve(&tasks, config.as_deref()),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

/// Handle the run command.
fn cmd_run(task_path: &Path, config_path: Option<&Path>, json: bool, verbose: bool) -> Result<()> {
    let config = load_engine_config(config_path)?;
    let task = load_task_file(task_path)?;
    let runtime = build_runtime()?;
    match runtime.block_on(run_task(config, task, json, verbose))? {
        Ok(progress) => emit_run(json, &progress),
        Err(err) => emit_error(json, &err),
    }
}

async fn run_task(
    config: EngineConfig,
    task: Task,
    json: bool,
    verbose: bool,
) -> Result<EngineResult<LiveProgress>> {
    let wait = config.timeout_for(task.timeout_seconds) + config.stop_grace() + WAIT_SLACK;
    let engine = Engine::new(config, Arc::new(MemoryStore::new()));
    let run_id = match engine.dispatch(&task).await {
        Ok(run_id) => run_id,
        Err(err) => return Ok(Err(err)),
    };

    let mut interrupts = interrupt_channel()?;
    let stopper = engine.clone();
    tokio::spawn(async move {
        if interrupts.recv().await.is_some() {
            if let Err(err) = stopper.stop_run(run_id).await {
                tracing::warn!(%run_id, error = %err, "failed to stop run");
            }
        }
    });

    let finished = if json {
        engine.wait_for_terminal(run_id, wait).await
    } else {
        progress::RunSpinner::new(&task.name, verbose)
            .follow(&engine, run_id)
            .await
    };
    Ok(finished.ok_or_else(|| {
        EngineError::new(
            ErrorCode::Timeout,
            "run did not reach a terminal state",
            serde_json::json!({ "run_id": run_id.to_string() }),
        )
    }))
}

/// Handle the check command.
fn cmd_check(script: Option<String>, file: Option<PathBuf>, json: bool) -> Result<()> {
    let body = match (script, file) {
        (Some(script), _) => script,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|err| EngineError::io(format!("failed to read {}", path.display()), err))?,
        (None, None) => String::new(),
    };
    let explanation = explain_script(&body);
    emit_explanation(json, &explanation)?;
    if !explanation.allowed {
        std::process::exit(ErrorCode::UnsafeScript.exit_code());
    }
    Ok(())
}

/// Handle the next-run command.
fn cmd_next_run(expr: &str, count: usize, json: bool) -> Result<()> {
    let times = match tasklane::scheduler::upcoming(expr, Utc::now(), count.max(1)) {
        Ok(times) => times,
        Err(err) => return emit_error(json, &err),
    };
    if json {
        let payload = serde_json::json!({
            "expr": expr,
            "next": times.iter().map(chrono::DateTime::<Utc>::to_rfc3339).collect::<Vec<_>>(),
        });
        println!("{payload}");
    } else {
        for at in times {
            println!("{}", at.with_timezone(&Local).to_rfc3339());
        }
    }
    Ok(())
}

/// Handle the serve command.
fn cmd_serve(tasks_path: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = load_engine_config(config_path)?;
    let tasks = load_tasks_file(tasks_path)?;
    let runtime = build_runtime()?;
    runtime.block_on(serve(config, tasks))
}

async fn serve(config: EngineConfig, tasks: Vec<Task>) -> Result<()> {
    let grace = config.stop_grace();
    let store = MemoryStore::with_tasks(tasks).await;
    let engine = Engine::new(config, Arc::new(store.clone()));
    let scheduler = CronScheduler::new(engine.clone());
    let scheduled = scheduler.start_from_store(&store).await?;
    for entry in scheduler.entries().await {
        tracing::info!(task_id = %entry.task_id, expr = %entry.expr, "watching schedule");
    }
    eprintln!("tasklane: {scheduled} task(s) scheduled, press Ctrl-C to stop");

    let mut interrupts = interrupt_channel()?;
    interrupts.recv().await;

    scheduler.shutdown().await;
    let stopped = engine.stop_all().await;
    if stopped > 0 {
        tracing::info!(stopped, "waiting for running tasks to stop");
        let deadline = Instant::now() + grace + Duration::from_secs(1);
        while !engine.active_runs().is_empty().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    Ok(())
}

/// Handle the completions command.
#[allow(clippy::unnecessary_wraps)] // Consistent with other command handlers
fn cmd_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()
}

fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => Ok(load_config_file(path)?),
        None => Ok(EngineConfig::default()),
    }
}

/// Forward Ctrl-C presses into an async channel.
fn interrupt_channel() -> Result<mpsc::UnboundedReceiver<()>> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .into_diagnostic()?;
    Ok(rx)
}

fn emit_run(json: bool, progress: &LiveProgress) -> Result<()> {
    if json {
        let payload = serde_json::to_string(progress).into_diagnostic()?;
        println!("{payload}");
    } else {
        print!("{}", progress.output);
        if !progress.error.is_empty() {
            eprintln!("error: {}", progress.error);
        }
    }
    match progress.status {
        RunStatus::Success => Ok(()),
        _ if progress.error.contains("timeout after") => {
            std::process::exit(ErrorCode::Timeout.exit_code())
        }
        _ => std::process::exit(1),
    }
}

fn emit_error(json: bool, err: &EngineError) -> Result<()> {
    if json {
        let payload = serde_json::to_string(err).into_diagnostic()?;
        println!("{payload}");
    } else {
        eprintln!("error: {err}");
    }
    std::process::exit(err.code.exit_code());
}

fn emit_explanation(json: bool, explanation: &ScriptExplanation) -> Result<()> {
    if json {
        let payload = serde_json::to_string(explanation).into_diagnostic()?;
        println!("{payload}");
    } else if explanation.allowed {
        println!("script: allowed");
    } else {
        println!("script: denied");
        for finding in &explanation.findings {
            println!(" - {}", finding.reason);
        }
    }
    Ok(())
}
