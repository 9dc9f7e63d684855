//! Conductor CLI - issue-driven work scheduler.
//!
//! Single binary that provides:
//! - `conductor triage` - normalize an issue into the queue
//! - `conductor schedule` - run an admission pass (or loop)
//! - `conductor release` - close out admitted work
//! - `conductor status` - queue, locks, and invariant report
//! - `conductor init` - scaffold `.conductor/`

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use conductor_core::{
    adapters::{require_env, GitHubClient, GitHubSettings, NoopDispatch},
    kernel::{self, Outcome},
    observability::EventEmitter,
    state::{invariants, Board},
    CommitMode, ConductorConfig, FileStore, IssueTracker, Scheduler, WorkRequest,
};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Issue-driven work scheduler", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a work request into the queue
    Triage {
        /// Issue event payload (defaults to GITHUB_EVENT_PATH)
        #[arg(long, conflicts_with = "issue")]
        event: Option<PathBuf>,

        /// Fetch the issue from the API instead of reading an event
        #[arg(long)]
        issue: Option<u64>,
    },

    /// Run an admission pass
    Schedule {
        /// Report what would be admitted without dispatching or writing
        #[arg(long)]
        dry_run: bool,

        /// Repeat the pass every N seconds until interrupted
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },

    /// Mark admitted work finished and free its locks
    Release {
        /// Queue entry id (issue number)
        id: u64,

        /// done, failed, or requeue
        #[arg(long)]
        outcome: Outcome,
    },

    /// Show queue, locks, and invariant violations
    Status {
        /// Flag locks held longer than this many hours
        #[arg(long, default_value_t = 24)]
        stale_hours: i64,
    },

    /// Initialize a new project
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Find project root
    let project_root = match cli.project {
        Some(p) => p,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    match cli.command {
        Commands::Triage { event, issue } => triage(&project_root, event, issue).await,
        Commands::Schedule { dry_run, every } => schedule(&project_root, dry_run, every).await,
        Commands::Release { id, outcome } => release(&project_root, id, outcome),
        Commands::Status { stale_hours } => show_status(&project_root, stale_hours),
        Commands::Init => init_project(&project_root),
    }
}

fn open_store(config: &ConductorConfig) -> FileStore {
    FileStore::new(&config.queue_path, &config.locks_path)
}

fn github(config: &ConductorConfig) -> Result<GitHubClient> {
    let settings = GitHubSettings::from_env()?;
    Ok(GitHubClient::new(settings, &config.dispatch.event_type)?)
}

async fn triage(project_root: &Path, event: Option<PathBuf>, issue: Option<u64>) -> Result<()> {
    let config = ConductorConfig::load_from_project(project_root)?;
    let client = github(&config)?;

    let request = match issue {
        Some(id) => client.fetch_issue(id).await?,
        None => {
            let path = match event {
                Some(p) => p,
                None => PathBuf::from(require_env("GITHUB_EVENT_PATH")?),
            };
            WorkRequest::from_event_file(&path)?
        }
    };

    let store = open_store(&config);
    let outcome = kernel::run_triage(&store, &client, &config, &request).await?;
    EventEmitter::new(&config.events_path).triaged(&outcome)?;

    let entry = &outcome.entry;
    println!(
        "Triaged #{}: component={} complexity={} priority={} status={}",
        entry.id, entry.component, entry.complexity, entry.priority, entry.status
    );

    Ok(())
}

async fn schedule(project_root: &Path, dry_run: bool, every: Option<u64>) -> Result<()> {
    let config = ConductorConfig::load_from_project(project_root)?;
    let store = open_store(&config);
    let events = EventEmitter::new(&config.events_path);

    let mut scheduler = Scheduler::new(&config);
    if dry_run {
        scheduler = scheduler.with_commit_mode(CommitMode::DryRun);
    }

    let noop;
    let client;
    let dispatcher: &dyn conductor_core::Dispatch = if scheduler.commit_mode() == CommitMode::DryRun {
        noop = NoopDispatch::new(&config.dispatch.event_type);
        &noop
    } else {
        client = github(&config)?;
        &client
    };

    tracing::info!(
        project = %project_root.display(),
        parallel_agents = config.parallel_agents,
        commit = ?scheduler.commit_mode(),
        "Starting scheduler"
    );

    loop {
        let report = scheduler.run_pass(&store, dispatcher).await?;
        if !report.dry_run {
            events.pass(&report)?;
        }
        println!("{}", report.summary());
        for id in &report.admitted {
            println!("  admitted  #{id}");
        }
        for blocked in &report.blocked {
            println!("  blocked   #{} (held by {:?})", blocked.id, blocked.owners);
        }
        for id in &report.deferred {
            println!("  deferred  #{id}");
        }

        let Some(secs) = every else {
            break;
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping");
                break;
            }
        }
    }

    Ok(())
}

fn release(project_root: &Path, id: u64, outcome: Outcome) -> Result<()> {
    let config = ConductorConfig::load_from_project(project_root)?;
    let store = open_store(&config);

    let release = kernel::release(&store, id, outcome)?;
    EventEmitter::new(&config.events_path).released(&release)?;

    println!(
        "Released #{}: {} -> {} ({} lock(s) freed)",
        release.id, release.previous, release.status, release.locks_released
    );

    Ok(())
}

fn show_status(project_root: &Path, stale_hours: i64) -> Result<()> {
    let config = ConductorConfig::load_from_project(project_root)?;
    let store = open_store(&config);
    let board = Board::load(&store)?;
    let events = EventEmitter::new(&config.events_path);

    let now = Utc::now();
    let threshold = chrono::Duration::hours(stale_hours);
    let entries = board.queue.entries();
    let in_progress = board.queue.in_progress_count();

    println!("Conductor Status");
    println!("================");
    println!();
    println!("Project: {}", project_root.display());
    println!("Agents: {}/{} busy", in_progress, config.parallel_agents);
    println!();
    println!("Queue: {} entries", entries.len());
    for entry in entries {
        println!(
            "  #{:<6} {:>5}  {:<11} {:<12} {}",
            entry.id,
            entry.priority,
            entry.status.as_str(),
            entry.component,
            entry.title
        );
    }
    println!();
    println!("Locks: {}", board.locks.len());
    for lock in &board.locks {
        let age = lock.age(now);
        let stale = if lock.is_stale(now, threshold) { "  STALE" } else { "" };
        println!(
            "  #{:<6} {}h{:02}m  {}{}",
            lock.owner,
            age.num_hours(),
            age.num_minutes() % 60,
            lock.files.join(", "),
            stale
        );
    }

    let violations = invariants::check(entries, &board.locks);
    if !violations.is_empty() {
        println!();
        println!("Violations:");
        for violation in &violations {
            println!("  - {violation}");
        }
    }

    let recent_events = events.read_recent(5);
    println!();
    println!("Recent events:");
    for event in &recent_events {
        println!(
            "  {} [{}] {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.message
        );
    }

    Ok(())
}

fn init_project(project_root: &Path) -> Result<()> {
    let conductor_dir = project_root.join(".conductor");
    std::fs::create_dir_all(&conductor_dir)?;

    // Create default config
    let config_path = conductor_dir.join("config.yaml");
    if ConductorConfig::find(project_root).is_none() {
        let default_config = r#"# Conductor configuration

# Component key -> glob patterns that component owns
components: {}

labels:
  triaged: triaged

# Maximum units of work in progress at once
parallelAgents: 1

# Issue-form headings read by triage
sections:
  component: Component
  complexity: Complexity
  hints: Files

dispatch:
  event_type: agent-task

# end-of-pass | per-admission
commit: end-of-pass
"#;
        std::fs::write(&config_path, default_config)?;
    }

    // Create empty state documents
    for name in ["queue.json", "locks.json"] {
        let path = conductor_dir.join(name);
        if !path.exists() {
            std::fs::write(&path, "[]\n")?;
        }
    }

    println!("Initialized conductor project at {}", project_root.display());
    println!();
    println!("Created:");
    println!("  .conductor/config.yaml - scheduler configuration");
    println!("  .conductor/queue.json  - work queue");
    println!("  .conductor/locks.json  - file locks");
    println!();
    println!("Next steps:");
    println!("  1. Map components to globs in .conductor/config.yaml");
    println!("  2. Run: conductor triage --issue <n>");

    Ok(())
}
