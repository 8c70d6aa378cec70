use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use conductor::config::Config;
use conductor::orchestration::{
    DistributionPolicy, Orchestrator, RunOptions, RunOutcome, RunReport, SessionReport, MAX_AGENTS,
};
use conductor::plan::Plan;
use conductor::state::{RunRecord, SessionStore};
use conductor::surface::SessionSurface;
use conductor::tmux::{locate_agent, Tmux, TmuxSurface};
use conductor::util::{format_duration, truncate};
use conductor::{clog, Error, Result};

/// Conductor - run several interactive coding agents against one plan
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyArg {
    Sequential,
    Bundled,
    Collaborative,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a new run
    Run {
        /// Number of agents (1-20)
        #[arg(short = 'n', long = "agents", default_value_t = 1)]
        agents: usize,

        /// Initial instruction sent to every agent
        #[arg(short = 'p', long, conflicts_with = "prompt_file", required_unless_present = "prompt_file")]
        prompt: Option<String>,

        /// Plan file: numbered text, or TOML when the extension is .toml
        #[arg(long)]
        prompt_file: Option<PathBuf>,

        /// Steps to distribute, in order (used with --prompt)
        #[arg(long, num_args = 1.., requires = "prompt")]
        steps: Vec<String>,

        /// How steps are spread over agents
        #[arg(long, value_enum, default_value = "sequential")]
        policy: PolicyArg,

        /// Steps per bundle; implies --policy bundled when above 1
        #[arg(long)]
        bundle_steps: Option<usize>,

        /// Directory the agents work in (defaults to the current directory)
        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// Show per-session state for a run (latest run if omitted)
    Status {
        run_id: Option<String>,
    },

    /// Re-enter a run that was interrupted
    Resume {
        run_id: String,
    },

    /// Ask a running run to cancel
    Cancel {
        run_id: String,
    },

    /// List known runs, newest first
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);
    if conductor::log::is_debug() {
        if let Some(path) = conductor::log::path() {
            eprintln!("Debug log: {}", path.display());
        }
    }

    let config = Config::load()?;
    let store = SessionStore::open(&config.state_dir()?)?;
    let rt = tokio::runtime::Runtime::new()?;

    let code = rt.block_on(async {
        let orchestrator = Orchestrator::new(config.clone(), store.clone());
        match cli.command {
            Command::Run {
                agents,
                prompt,
                prompt_file,
                steps,
                policy,
                bundle_steps,
                project,
            } => {
                let plan = match (prompt, prompt_file) {
                    (_, Some(path)) => Plan::load(&path)?,
                    (Some(prompt), None) => Plan::from_prompt(&prompt, &steps)?,
                    (None, None) => {
                        return Err(Error::Validation(
                            "either --prompt or --prompt-file is required".to_string(),
                        ))
                    }
                };
                let options = RunOptions {
                    agents,
                    policy: distribution(policy, bundle_steps)?,
                    project_dir: match project {
                        Some(dir) => dir,
                        None => std::env::current_dir()?,
                    },
                };
                run(&orchestrator, &config, plan, options).await
            }
            Command::Status { run_id } => status(&orchestrator, run_id).await.map(|_| 0),
            Command::Resume { run_id } => resume(&orchestrator, &config, &run_id).await,
            Command::Cancel { run_id } => {
                let record = store.find_run(&run_id).await?;
                orchestrator.cancel(record.id).await?;
                println!("Cancel requested for run {}", record.id.short());
                Ok(0)
            }
            Command::List => list(&store).await.map(|_| 0),
        }
    })?;

    std::process::exit(code);
}

fn distribution(policy: PolicyArg, bundle_steps: Option<usize>) -> Result<DistributionPolicy> {
    match (policy, bundle_steps) {
        (PolicyArg::Collaborative, _) => Ok(DistributionPolicy::Collaborative),
        (PolicyArg::Bundled, k) => Ok(DistributionPolicy::Bundled(k.unwrap_or(2))),
        (PolicyArg::Sequential, Some(0)) => Err(Error::Validation(
            "--bundle-steps must be at least 1".to_string(),
        )),
        (PolicyArg::Sequential, Some(k)) if k > 1 => Ok(DistributionPolicy::Bundled(k)),
        (PolicyArg::Sequential, _) => Ok(DistributionPolicy::Sequential),
    }
}

fn check_prerequisites(config: &Config) -> Result<()> {
    if !Tmux::is_available() {
        return Err(Error::Tmux("tmux is not installed or not on PATH".to_string()));
    }
    let agent = locate_agent(config)?;
    clog!("Agent binary: {}", agent.display());
    Ok(())
}

fn tmux_surface(config: &Config) -> impl FnOnce(&RunRecord) -> Arc<dyn SessionSurface> {
    let config = config.clone();
    move |record: &RunRecord| -> Arc<dyn SessionSurface> {
        Arc::new(TmuxSurface::new(
            &record.id.short(),
            &record.project_dir,
            &config,
        ))
    }
}

async fn run(orchestrator: &Orchestrator, config: &Config, plan: Plan, options: RunOptions) -> Result<i32> {
    check_prerequisites(config)?;
    println!("Starting run: {}", plan.name);
    println!("  Agents:  {} (max {})", options.agents, MAX_AGENTS);
    println!("  Policy:  {}", options.policy);
    println!("  Steps:   {}", plan.len());
    println!("  Project: {}", options.project_dir.display());

    let run = orchestrator
        .start(plan, options, tmux_surface(config))
        .await?;
    conductor::log::set_run(&run.id().short());
    println!("  Run ID:  {}", run.id());
    println!();
    println!("Attach to an agent with: tmux attach -t {}", Tmux::session_name(&run.id().short(), "agent-0"));
    println!("Cancel from another shell with: conductor cancel {}", run.id().short());

    drive(run).await
}

async fn resume(orchestrator: &Orchestrator, config: &Config, query: &str) -> Result<i32> {
    check_prerequisites(config)?;
    let record = orchestrator.store().find_run(query).await?;
    conductor::log::set_run(&record.id.short());
    let run = orchestrator.resume(record.id, tmux_surface(config)).await?;
    println!("Resuming run {}", run.id().short());
    drive(run).await
}

async fn drive(run: conductor::orchestration::Run) -> Result<i32> {
    let token = run.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            clog!("Ctrl-C received, cancelling run");
            eprintln!("\nCancelling... (waiting for agents to exit)");
            token.cancel();
        }
    });

    let report = run.drive().await?;
    print_report(&report);
    Ok(exit_code(report.outcome))
}

fn exit_code(outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Succeeded => 0,
        RunOutcome::Failed => 1,
        RunOutcome::PartialSuccess { .. } => 2,
        RunOutcome::Cancelled => 130,
    }
}

async fn status(orchestrator: &Orchestrator, query: Option<String>) -> Result<()> {
    let record = match query {
        Some(q) => orchestrator.store().find_run(&q).await?,
        None => match orchestrator.store().list_runs().await?.into_iter().next() {
            Some(record) => record,
            None => {
                println!("No runs found");
                return Ok(());
            }
        },
    };
    let sessions = orchestrator.status(record.id).await?;
    println!("Run {} ({}, policy {})", record.id.short(), record.plan.name, record.policy);
    print_sessions(&sessions);
    Ok(())
}

async fn list(store: &SessionStore) -> Result<()> {
    let runs = store.list_runs().await?;
    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }
    for record in runs {
        println!(
            "{}  {}  {:>2} agent(s)  {:<14} {}",
            record.id.short(),
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.agents,
            record.policy.to_string(),
            truncate(&record.plan.name, 40)
        );
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    println!("Run {} {}", report.run_id.short(), report.outcome);
    print_sessions(&report.sessions);
}

fn print_sessions(sessions: &[SessionReport]) {
    for s in sessions {
        let step = if s.current_step_index < 0 {
            "-".to_string()
        } else {
            format!("{}/{}", s.current_step_index + 1, s.assigned_steps)
        };
        let failure = s.failure.map(|f| format!("  ({})", f)).unwrap_or_default();
        println!(
            "  {}  {:<9} {:<15} step {:<6} idle {}{}",
            s.id.short(),
            s.label,
            s.state.to_string(),
            step,
            format_duration(s.idle_for),
            failure
        );
        if let Some(current) = &s.current_step {
            println!("      working on: {}", truncate(current, 60));
        }
        if !s.claims.is_empty() {
            println!("      claims: {}", s.claims.join(", "));
        }
    }
}
