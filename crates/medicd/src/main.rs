//! medicd - runbook remediation daemon.
//!
//! Serves the engine's session control surface over HTTP, validates
//! knowledge bases, and runs one-shot diagnosis sessions from the
//! terminal.

mod config;
mod kubectl;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use medic_engine::{
    load_dir, Actor, Engine, KnowledgeBaseError, SessionStatus, StructuredSignal, SymptomSet,
};

use config::MedicdConfig;
use kubectl::KubectlContext;
use server::ServerState;

/// Runbook remediation daemon - diagnoses incidents against a runbook
/// knowledge base and drives gated fixes
#[derive(Parser)]
#[command(name = "medicd")]
#[command(about = "Runbook remediation daemon - diagnoses incidents and drives gated fixes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control surface
    Serve {
        /// Directory of runbook YAML files
        #[arg(long, default_value = "runbooks")]
        kb: PathBuf,

        /// Path to medic.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },
    /// Load and validate a knowledge base, printing the report
    CheckKb {
        /// Directory of runbook YAML files
        #[arg(long, default_value = "runbooks")]
        kb: PathBuf,
    },
    /// Run a one-shot diagnosis session from the terminal
    Diagnose {
        /// Directory of runbook YAML files
        #[arg(long, default_value = "runbooks")]
        kb: PathBuf,

        /// Path to medic.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Observed symptom tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Observed structured signal as field=value (repeatable)
        #[arg(long = "signal", value_parser = parse_signal)]
        signals: Vec<(String, String)>,

        /// Approve every proposed action on the operator's behalf
        #[arg(long)]
        approve_all: bool,

        /// Operator identity recorded for approvals
        #[arg(long, default_value = "cli")]
        operator: String,
    },
}

fn parse_signal(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected field=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "medicd=debug,medic_engine=debug"
    } else {
        "medicd=info,medic_engine=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { kb, config, addr } => serve(&kb, config.as_deref(), &addr).await,
        Commands::CheckKb { kb } => check_kb(&kb),
        Commands::Diagnose {
            kb,
            config,
            tags,
            signals,
            approve_all,
            operator,
        } => {
            diagnose(
                &kb,
                config.as_deref(),
                tags,
                signals,
                approve_all,
                &operator,
            )
            .await
        }
    }
}

async fn serve(kb_dir: &std::path::Path, config: Option<&std::path::Path>, addr: &str) -> Result<()> {
    let config = MedicdConfig::load_or_default(config)?;
    let (kb, report) = load_dir(kb_dir).context("failed to load knowledge base")?;
    if kb.is_empty() {
        return Err(KnowledgeBaseError::Empty {
            path: kb_dir.display().to_string(),
        }
        .into());
    }
    for excluded in &report.excluded {
        eprintln!(
            "{} {}: {}",
            "excluded".yellow(),
            excluded.source,
            excluded.reason
        );
    }
    println!(
        "{} {} runbook entries loaded, target cluster {}",
        "✓".green(),
        kb.len(),
        config.target.cluster
    );

    let target = Arc::new(KubectlContext::new(&config.target));
    let engine = Engine::new(kb, config.engine, target);
    let state = Arc::new(ServerState { engine });
    server::run_server(state, addr).await
}

fn check_kb(kb_dir: &std::path::Path) -> Result<()> {
    let (kb, report) = load_dir(kb_dir).context("failed to load knowledge base")?;

    for id in &report.loaded {
        println!("{} {id}", "✓".green());
    }
    for excluded in &report.excluded {
        println!("{} {}: {}", "✗".red(), excluded.source, excluded.reason);
    }
    println!(
        "\n{} loaded, {} excluded",
        kb.len(),
        report.excluded.len()
    );

    if !report.excluded.is_empty() {
        bail!("knowledge base has invalid entries");
    }
    if kb.is_empty() {
        bail!("no runbook entries found in {}", kb_dir.display());
    }
    Ok(())
}

async fn diagnose(
    kb_dir: &std::path::Path,
    config: Option<&std::path::Path>,
    tags: Vec<String>,
    signals: Vec<(String, String)>,
    approve_all: bool,
    operator: &str,
) -> Result<()> {
    let config = MedicdConfig::load_or_default(config)?;
    let (kb, _report) = load_dir(kb_dir).context("failed to load knowledge base")?;
    if kb.is_empty() {
        bail!("no runbook entries found in {}", kb_dir.display());
    }

    let target = Arc::new(KubectlContext::new(&config.target));
    let engine = Engine::new(kb, config.engine, target);

    let symptoms = SymptomSet {
        tags,
        signals: signals
            .into_iter()
            .map(|(field, value)| StructuredSignal { field, value })
            .collect(),
    };
    if symptoms.is_empty() {
        bail!("no symptoms given; pass --tag and/or --signal");
    }

    let session_id = engine.start_session(symptoms).await;
    println!("session {session_id} started");

    let mut printed_audit = 0;
    let mut handled_approval: Option<String> = None;
    loop {
        let snapshot = engine.get_status(session_id).await?;

        for record in snapshot.audit.iter().skip(printed_audit) {
            println!(
                "  {} {} → {}: {}",
                record.at.format("%H:%M:%S"),
                record.from.name().dimmed(),
                record.to.name().bold(),
                record.detail
            );
        }
        printed_audit = snapshot.audit.len();

        if let Some(pending) = &snapshot.pending_approval {
            if handled_approval.as_deref() != Some(pending.action_id.as_str()) {
                handled_approval = Some(pending.action_id.clone());
                if approve_all {
                    println!(
                        "{} approving {} (risk={}) as {operator}",
                        "→".cyan(),
                        pending.action_id,
                        pending.risk.name()
                    );
                    // The approval can race the driver moving on; a
                    // mismatch here is not fatal to the session.
                    if let Err(e) = engine
                        .approve_action(session_id, &pending.action_id, Actor::operator(operator))
                        .await
                    {
                        tracing::debug!(error = %e, "approval not accepted");
                    }
                } else {
                    println!(
                        "{} action {} (risk={}) awaiting approval; re-run with --approve-all or approve via the API",
                        "⚠".yellow(),
                        pending.action_id,
                        pending.risk.name()
                    );
                }
            }
        }

        if snapshot.is_terminal() {
            let status = snapshot.status;
            let label = match status {
                SessionStatus::Resolved => status.name().green(),
                SessionStatus::Cancelled => status.name().yellow(),
                _ => status.name().red(),
            };
            println!(
                "session {session_id} finished: {label} ({} evidence records, {} action events)",
                snapshot.evidence.len(),
                snapshot.actions.len()
            );
            if status != SessionStatus::Resolved {
                bail!("session ended {}", status.name());
            }
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
