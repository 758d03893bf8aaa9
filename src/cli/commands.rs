//! CLI command definitions for taskpilot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use uuid::Uuid;

use crate::breaker::{CircuitBreaker, CircuitBreakerState};
use crate::clients::tracker::HttpTrackerClient;
use crate::clients::vcs::HttpVcsClient;
use crate::gate::channel::{write_signal, ResponseSignal, SignalWatcher};
use crate::gate::SignalGate;
use crate::llm::client::{GuardedBackend, InferenceClient};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::orchestrator::Orchestrator;
use crate::sandbox::docker_client::DockerClient;
use crate::sandbox::service::SandboxService;
use crate::secrets::CredentialSet;

const BREAKER_STATE_FILE: &str = "breaker.json";

/// Automated work-item-to-draft-PR pipeline.
#[derive(Parser)]
#[command(name = "taskpilot")]
#[command(about = "Plan, generate, validate, and publish code changes for tracked work items")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the full pipeline for a work item.
    Run(RunArgs),

    /// Resume a checkpointed run after a crash or restart.
    Resume(ResumeArgs),

    /// List runs with a stored checkpoint.
    Runs,

    /// Answer a posted question by dropping a response signal.
    Respond(RespondArgs),

    /// Inspect or reset the generation-backend circuit breaker.
    Breaker(BreakerArgs),
}

/// Arguments for `taskpilot run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Tracker id of the work item to implement (e.g. PROJ-142).
    #[arg(short, long)]
    pub work_item: String,

    /// Output the terminal outcome as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `taskpilot resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Run identifier to resume.
    #[arg(short, long)]
    pub run: Uuid,

    /// Output the terminal outcome as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `taskpilot respond`.
#[derive(Parser, Debug)]
pub struct RespondArgs {
    /// Question identifier being answered.
    #[arg(short, long)]
    pub question: Uuid,

    /// Chosen option id.
    #[arg(short, long)]
    pub option: String,

    /// Signal directory (defaults to TASKPILOT_SIGNAL_DIR or ./signals).
    #[arg(long, env = "TASKPILOT_SIGNAL_DIR", default_value = "./signals")]
    pub signal_dir: PathBuf,
}

/// Arguments for `taskpilot breaker`.
#[derive(Parser, Debug)]
pub struct BreakerArgs {
    /// Breaker subcommand.
    #[command(subcommand)]
    pub command: BreakerSubcommand,

    /// State directory (defaults to TASKPILOT_STATE_DIR or ./state).
    #[arg(long, env = "TASKPILOT_STATE_DIR", default_value = "./state")]
    pub state_dir: PathBuf,
}

/// Breaker subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum BreakerSubcommand {
    /// Show the persisted breaker state.
    Status,

    /// Close the breaker and zero the failure counter.
    Reset,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses CLI arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline(Target::WorkItem(args.work_item), args.json).await,
        Commands::Resume(args) => run_pipeline(Target::Run(args.run), args.json).await,
        Commands::Runs => list_runs(),
        Commands::Respond(args) => respond(args),
        Commands::Breaker(args) => breaker(args),
    }
}

enum Target {
    WorkItem(String),
    Run(Uuid),
}

async fn run_pipeline(target: Target, json: bool) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("Failed to load pipeline configuration")?;

    let tracker = Arc::new(
        HttpTrackerClient::new(config.tracker_base_url.clone(), config.tracker_token.clone())
            .context("Failed to build tracker client")?,
    );
    let vcs = Arc::new(
        HttpVcsClient::new(config.vcs_base_url.clone(), config.vcs_token.clone())
            .context("Failed to build VCS client")?,
    );

    let breaker = Arc::new(load_breaker(&config.state_dir, config.breaker_threshold)?);
    let inference =
        Arc::new(InferenceClient::from_env().context("Failed to build inference client")?);
    let backend = Arc::new(GuardedBackend::new(inference, breaker.clone()));

    let docker = Arc::new(DockerClient::new().context("Failed to connect to Docker daemon")?);
    let sandbox = Arc::new(SandboxService::new(docker, config.max_concurrent_sandboxes));

    let gate = Arc::new(SignalGate::new(
        tracker.clone(),
        config.question_timeout,
        config.timeout_policy,
    ));
    let watcher = SignalWatcher::new(gate.clone(), config.signal_dir.clone());
    let watcher_handle = tokio::spawn(watcher.run());

    let credentials = CredentialSet::from_env();
    let orchestrator = Orchestrator::new(
        config.clone(),
        tracker,
        vcs,
        backend,
        breaker.clone(),
        sandbox,
        gate,
    )
    .with_credentials(credentials);

    let outcome = match target {
        Target::WorkItem(id) => orchestrator.run(&id).await,
        Target::Run(run_id) => orchestrator.resume(run_id).await,
    };

    watcher_handle.abort();
    save_breaker(&config.state_dir, &breaker.snapshot())?;

    let outcome = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.success {
        info!(
            final_phase = %outcome.final_phase,
            files = outcome.files_generated,
            pr = outcome.pr.as_ref().map(|p| p.number),
            "run succeeded"
        );
        if let Some(pr) = outcome.pr {
            println!("Draft PR #{}: {}", pr.number, pr.url);
        }
    } else {
        anyhow::bail!(
            "run failed in phase '{}': {}",
            outcome.final_phase,
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    Ok(())
}

fn list_runs() -> anyhow::Result<()> {
    let state_dir =
        std::env::var("TASKPILOT_STATE_DIR").unwrap_or_else(|_| "./state".to_string());
    let store = crate::pipeline::checkpoint::CheckpointStore::new(&state_dir);

    let ids = store.list()?;
    if ids.is_empty() {
        println!("No stored runs in {state_dir}");
        return Ok(());
    }

    for id in ids {
        match store.load(id) {
            Ok(run) => println!(
                "{id}  {}  phase={}  work_item={}",
                format!("{:?}", run.status).to_lowercase(),
                run.current_phase,
                run.work_item.id
            ),
            Err(e) => println!("{id}  <unreadable: {e}>"),
        }
    }
    Ok(())
}

fn respond(args: RespondArgs) -> anyhow::Result<()> {
    let signal = ResponseSignal {
        question_id: args.question,
        option_id: args.option,
    };
    let path = write_signal(&args.signal_dir, &signal)
        .context("Failed to write response signal")?;
    println!("Signal written to {}", path.display());
    Ok(())
}

fn breaker(args: BreakerArgs) -> anyhow::Result<()> {
    let path = args.state_dir.join(BREAKER_STATE_FILE);
    match args.command {
        BreakerSubcommand::Status => {
            let state = read_breaker_state(&args.state_dir)?
                .unwrap_or_else(|| CircuitBreaker::default().snapshot());
            println!(
                "breaker: {}  failures: {}/{}",
                if state.open { "OPEN" } else { "closed" },
                state.consecutive_failures,
                state.threshold
            );
        }
        BreakerSubcommand::Reset => {
            let threshold = read_breaker_state(&args.state_dir)?
                .map(|s| s.threshold)
                .unwrap_or(crate::breaker::DEFAULT_FAILURE_THRESHOLD);
            let breaker = CircuitBreaker::new(threshold);
            save_breaker(&args.state_dir, &breaker.snapshot())?;
            println!("breaker reset (threshold {threshold}), state at {}", path.display());
        }
    }
    Ok(())
}

fn read_breaker_state(state_dir: &std::path::Path) -> anyhow::Result<Option<CircuitBreakerState>> {
    let path = state_dir.join(BREAKER_STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let body = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&body)?))
}

fn load_breaker(state_dir: &std::path::Path, threshold: u32) -> anyhow::Result<CircuitBreaker> {
    match read_breaker_state(state_dir)? {
        Some(state) => {
            if state.open {
                tracing::warn!(
                    failures = state.consecutive_failures,
                    "circuit breaker restored in OPEN state; use 'taskpilot breaker reset'"
                );
            }
            Ok(CircuitBreaker::restore(&state))
        }
        None => Ok(CircuitBreaker::new(threshold)),
    }
}

fn save_breaker(
    state_dir: &std::path::Path,
    state: &CircuitBreakerState,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    std::fs::write(
        state_dir.join(BREAKER_STATE_FILE),
        serde_json::to_vec_pretty(state)?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_state_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = CircuitBreaker::new(3);
        breaker.record_failure();

        save_breaker(dir.path(), &breaker.snapshot()).unwrap();
        let state = read_breaker_state(dir.path()).unwrap().unwrap();
        assert_eq!(state.consecutive_failures, 1);
        assert!(!state.open);

        let restored = load_breaker(dir.path(), 3).unwrap();
        assert_eq!(restored.snapshot(), breaker.snapshot());
    }

    #[test]
    fn test_missing_breaker_state_uses_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = load_breaker(dir.path(), 7).unwrap();
        assert_eq!(breaker.snapshot().threshold, 7);
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::parse_from(["taskpilot", "run", "--work-item", "PROJ-142", "--json"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.work_item, "PROJ-142");
                assert!(args.json);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_cli_parses_respond_command() {
        let question = Uuid::new_v4();
        let cli = Cli::parse_from([
            "taskpilot",
            "respond",
            "--question",
            &question.to_string(),
            "--option",
            "approve",
        ]);
        match cli.command {
            Commands::Respond(args) => {
                assert_eq!(args.question, question);
                assert_eq!(args.option, "approve");
            }
            _ => panic!("expected respond command"),
        }
    }

    #[test]
    fn test_cli_parses_breaker_reset() {
        let cli = Cli::parse_from(["taskpilot", "breaker", "reset"]);
        match cli.command {
            Commands::Breaker(args) => {
                assert!(matches!(args.command, BreakerSubcommand::Reset));
            }
            _ => panic!("expected breaker command"),
        }
    }
}
