//! Quest orchestrator CLI.
//!
//! Operates on the working copy in the current directory (or `--workdir`).
//! State lives in `.git/quest/`; the forge is reached through `gh`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use quest::error::{CycleError, Severity};
use quest::exit_codes;
use quest::io::config::{QuestConfig, config_path, load_config, write_config};
use quest::session::{InstanceView, PollOutcome, PollTrigger, QuestSession};

#[derive(Parser)]
#[command(name = "quest", version, about = "Quest orchestrator")]
struct Cli {
    /// Working copy of the quest repository.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,
    /// Config file (defaults to `.git/quest/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
        /// Forge repository (`owner/name`); derived from `origin` when omitted.
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        instance_id: Option<String>,
    },
    /// Print the recorded progress.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run one poll cycle.
    Poll {
        #[arg(long)]
        json: bool,
    },
    /// Classify local edits without contacting the forge.
    Check {
        #[arg(long)]
        json: bool,
    },
    /// File a hard reset delivering the current chapter's reference solution.
    ReferenceSolution,
    /// Poll on the configured interval until interrupted.
    Watch {
        /// Override `poll.interval_secs`.
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn main() -> ExitCode {
    quest::logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&cli.workdir));
    match cli.command {
        Command::Init {
            force,
            repository,
            instance_id,
        } => cmd_init(&cfg_path, force, repository, instance_id),
        Command::Status { json } => {
            let session = open_session(&cli.workdir, &cfg_path)?;
            print_view(&session.current_state(), json)?;
            Ok(exit_codes::OK)
        }
        Command::Poll { json } => {
            let session = open_session(&cli.workdir, &cfg_path)?;
            let outcome = session.trigger_poll(PollTrigger::Manual);
            report_outcome(&session, &outcome, json)
        }
        Command::Check { json } => {
            let session = open_session(&cli.workdir, &cfg_path)?;
            match session.check() {
                Ok(report) if json => {
                    let json =
                        serde_json::to_string_pretty(&report).context("serialize report")?;
                    println!("{json}");
                    Ok(exit_codes::OK)
                }
                Ok(report) => {
                    println!("verdict: {:?}", report.verdict);
                    for path in &report.drifted_paths {
                        println!("protected code changed: {path}");
                    }
                    for path in &report.game_area_paths {
                        println!("game area changed: {path}");
                    }
                    Ok(exit_codes::OK)
                }
                Err(err) => Ok(fail(&err)),
            }
        }
        Command::ReferenceSolution => {
            let session = open_session(&cli.workdir, &cfg_path)?;
            let outcome = session.request_reference_solution();
            report_outcome(&session, &outcome, false)
        }
        Command::Watch { interval } => {
            let session = open_session(&cli.workdir, &cfg_path)?;
            let every = interval
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| session.poll_interval());
            if every.is_zero() {
                bail!("--interval must be > 0");
            }
            // First poll is manual so a stale halt from a previous run is cleared.
            let mut trigger = PollTrigger::Manual;
            loop {
                let outcome = session.trigger_poll(trigger);
                report_outcome(&session, &outcome, false)?;
                trigger = PollTrigger::Timer;
                thread::sleep(every);
            }
        }
    }
}

fn cmd_init(
    cfg_path: &Path,
    force: bool,
    repository: Option<String>,
    instance_id: Option<String>,
) -> Result<i32> {
    if cfg_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", cfg_path.display());
    }
    let mut cfg = QuestConfig::default();
    cfg.forge.repository = repository;
    cfg.instance_id = instance_id;
    write_config(cfg_path, &cfg)?;
    println!("wrote {}", cfg_path.display());
    Ok(exit_codes::OK)
}

fn open_session(workdir: &Path, cfg_path: &Path) -> Result<QuestSession> {
    let cfg = load_config(cfg_path)?;
    QuestSession::open(workdir, cfg)
}

fn report_outcome(session: &QuestSession, outcome: &PollOutcome, json: bool) -> Result<i32> {
    match outcome {
        PollOutcome::Completed(report) => {
            if json {
                print_json(&PollSummary {
                    view: session.current_state(),
                    performed: &report.performed,
                })?;
            } else {
                for action in &report.performed {
                    println!("{}", serde_json::to_string(action).context("serialize action")?);
                }
                print_view(&session.current_state(), false)?;
            }
            Ok(exit_codes::OK)
        }
        PollOutcome::Failed(err) => Ok(fail(err)),
        PollOutcome::Halted => {
            eprintln!("polling is halted; run `quest poll` to retry");
            Ok(exit_codes::NEEDS_ATTENTION)
        }
    }
}

#[derive(Serialize)]
struct PollSummary<'a> {
    view: InstanceView,
    performed: &'a [quest::dispatch::Performed],
}

fn fail(err: &CycleError) -> i32 {
    eprintln!("{} ({})", err, err.kind());
    match err.severity() {
        Severity::Transient => exit_codes::TRANSIENT,
        Severity::NeedsAttention => exit_codes::NEEDS_ATTENTION,
        Severity::Internal => exit_codes::INVALID,
    }
}

fn print_view(view: &InstanceView, json: bool) -> Result<()> {
    if json {
        return print_json(view);
    }
    println!(
        "{} [{}] chapter {}/{}: {}",
        view.id,
        view.quest_id,
        view.chapter + 1,
        view.chapter_count,
        view.chapter_title.as_deref().unwrap_or("?")
    );
    println!("phase: {} (revision {})", view.phase.as_str(), view.revision);
    if let Some(verdict) = view.last_verdict {
        println!("local edits: {verdict:?}");
    }
    if let Some(wait) = view.waiting_for {
        println!("waiting for: {wait:?}");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize json")?);
    Ok(())
}
