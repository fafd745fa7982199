//! Evidence-driven task orchestrator.
//!
//! Keeps state under `.orchestrator/` and runs one bounded cycle per
//! invocation. Every command prints a JSON report to stdout; diagnostics go to
//! stderr through `RUST_LOG`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use orchestrator::cycle::{CycleDeps, Trigger, error_exit_code, run_cycle};
use orchestrator::deps::{check_dependencies, env_lookup};
use orchestrator::exit_codes;
use orchestrator::io::audit::JsonlAudit;
use orchestrator::io::config::load_config;
use orchestrator::io::context::FsContextSource;
use orchestrator::io::evaluator::GatewayEvaluator;
use orchestrator::io::gateway::ProcessDispatcher;
use orchestrator::io::init::{InitOptions, OrchestratorPaths, init_orchestrator};
use orchestrator::logging;
use orchestrator::resume::resume_session;
use orchestrator::select::select_from_root;
use orchestrator::status::status_from_root;
use orchestrator::validate::{validate_orchestrator, verify_evidence};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Evidence-driven task orchestrator"
)]
struct Cli {
    /// Project root containing `.orchestrator/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` with a default config and an empty session.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one orchestration cycle.
    Cycle {
        /// Trigger JSON file, or `-` for stdin. Omitted means an empty trigger.
        #[arg(short, long)]
        trigger: Option<String>,
    },
    /// Preview which task the next cycle would work on.
    Select,
    /// Check state documents without repairing them.
    Validate,
    /// Summarize the session and task graph.
    Status,
    /// Clear a session halt after review so cycles can run again.
    Resume,
    /// External dependency checks.
    Deps {
        #[command(subcommand)]
        command: DepsCommand,
    },
    /// Evidence log checks.
    Evidence {
        #[command(subcommand)]
        command: EvidenceCommand,
    },
}

#[derive(Subcommand)]
enum DepsCommand {
    /// Validate service credentials from the environment.
    Check,
}

#[derive(Subcommand)]
enum EvidenceCommand {
    /// Re-derive a task's evidence chain and report tampering.
    Verify { task: String },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(error_exit_code(&err));
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match &cli.command {
        Command::Init { force } => {
            let paths = init_orchestrator(root, &InitOptions { force: *force })?;
            print_json(&serde_json::json!({ "initialized": paths.dir }))?;
            Ok(exit_codes::OK)
        }
        Command::Cycle { trigger } => cmd_cycle(root, trigger.as_deref()),
        Command::Select => {
            let outcome = select_from_root(root)?;
            print_json(&outcome)?;
            Ok(outcome.exit_code())
        }
        Command::Validate => {
            let report = validate_orchestrator(root)?;
            print_json(&report)?;
            Ok(if report.ok {
                exit_codes::OK
            } else {
                exit_codes::INVALID
            })
        }
        Command::Status => {
            print_json(&status_from_root(root)?)?;
            Ok(exit_codes::OK)
        }
        Command::Resume => {
            print_json(&resume_session(root)?)?;
            Ok(exit_codes::OK)
        }
        Command::Deps {
            command: DepsCommand::Check,
        } => {
            let checks = check_dependencies(root, env_lookup)?;
            print_json(&checks)?;
            Ok(if checks.iter().all(|check| check.ok) {
                exit_codes::OK
            } else {
                exit_codes::BLOCKED
            })
        }
        Command::Evidence {
            command: EvidenceCommand::Verify { task },
        } => {
            let report = verify_evidence(root, task)?;
            print_json(&report)?;
            Ok(if report.intact {
                exit_codes::OK
            } else {
                exit_codes::INVALID
            })
        }
    }
}

fn cmd_cycle(root: &Path, trigger: Option<&str>) -> Result<i32> {
    let trigger = read_trigger(trigger)?;
    let paths = OrchestratorPaths::new(root);
    let config = load_config(&paths.config_path)?;

    let gateway = &config.gateway;
    let dispatcher = ProcessDispatcher::new(
        gateway.command.clone(),
        root,
        gateway.output_limit_bytes,
    );
    let evaluator_command = if config.escalation.evaluator_command.is_empty() {
        gateway.command.clone()
    } else {
        config.escalation.evaluator_command.clone()
    };
    let evaluator_dispatcher =
        ProcessDispatcher::new(evaluator_command, root, gateway.output_limit_bytes);
    let audit = JsonlAudit::new(&paths.gateway_audit_path);
    let evaluator = GatewayEvaluator::with_budget(
        &evaluator_dispatcher,
        &audit,
        gateway,
        Duration::from_secs(config.cycle_timeout_secs),
    )?;
    let source = FsContextSource::new(root);

    let report = run_cycle(
        root,
        &trigger,
        &CycleDeps {
            dispatcher: &dispatcher,
            evaluator: &evaluator,
            audit: &audit,
            source: &source,
        },
    )?;
    print_json(&report)?;
    Ok(report.exit_code())
}

fn read_trigger(source: Option<&str>) -> Result<Trigger> {
    let raw = match source {
        None => return Ok(Trigger::default()),
        Some("-") => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("read trigger from stdin")?;
            raw
        }
        Some(path) => fs::read_to_string(path).with_context(|| format!("read trigger {path}"))?,
    };
    if raw.trim().is_empty() {
        return Ok(Trigger::default());
    }
    serde_json::from_str(&raw).context("parse trigger json")
}

/// Print `value` as pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize report")?;
    println!("{payload}");
    Ok(())
}
