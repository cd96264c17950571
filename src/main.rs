use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

use claude_squad::clipboard::SystemClipboard;
use claude_squad::daemon::Daemon;
use claude_squad::instance::{ensure_unique, SystemAdapters};
use claude_squad::{Config, Instance, InstanceOptions, Status, Storage};

#[derive(Parser)]
#[command(
    name = "claude-squad",
    about = "Supervisor for parallel AI coding agents in tmux sessions on isolated git worktrees"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start a new agent instance in the current repository
    New {
        /// Instance title (also the tmux session name)
        title: String,
        /// Program to run (defaults to config default_program)
        #[arg(short, long)]
        program: Option<String>,
        /// Auto-submit enter when the agent is waiting for input
        #[arg(long)]
        autoyes: bool,
        /// Seed prior Claude conversations into the worktree
        #[arg(long)]
        resume: bool,
    },
    /// List instances
    Ls,
    /// Attach the terminal to an instance's session
    Attach { title: String },
    /// Send a prompt to an instance
    Send { title: String, prompt: String },
    /// Pause an instance: commit, release session and worktree, keep branch
    Pause { title: String },
    /// Resume a paused instance
    Resume { title: String },
    /// Commit and push an instance's branch to origin
    Push { title: String },
    /// Kill an instance and delete its branch
    Kill { title: String },
    /// Run the AutoYes daemon in the foreground
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    check_dependencies().await?;

    match cli.command {
        Commands::New {
            title,
            program,
            autoyes,
            resume,
        } => cmd_new(title, program, autoyes, resume).await,
        Commands::Ls => cmd_ls().await,
        Commands::Attach { title } => cmd_attach(&title).await,
        Commands::Send { title, prompt } => cmd_send(&title, &prompt).await,
        Commands::Pause { title } => cmd_pause(&title).await,
        Commands::Resume { title } => cmd_resume(&title).await,
        Commands::Push { title } => cmd_push(&title).await,
        Commands::Kill { title } => cmd_kill(&title).await,
        Commands::Daemon => cmd_daemon().await,
    }
}

/// The engine drives tmux, git, and gh as subprocesses; a missing binary is
/// a fatal startup error.
async fn check_dependencies() -> Result<()> {
    for (bin, flag) in [("tmux", "-V"), ("git", "--version"), ("gh", "--version")] {
        let found = matches!(
            Command::new(bin).arg(flag).output().await,
            Ok(output) if output.status.success()
        );
        if !found {
            bail!("required binary '{bin}' not found on PATH");
        }
    }
    Ok(())
}

struct Host {
    config: Arc<Config>,
    storage: Arc<Storage>,
    instances: Vec<Instance>,
}

async fn load_host() -> Result<Host> {
    let config = Arc::new(Config::load()?);
    let storage = Arc::new(Storage::new());
    let outcome = storage
        .load(
            Arc::clone(&config),
            Arc::new(SystemAdapters),
            Arc::new(SystemClipboard),
        )
        .await?;
    for (title, err) in &outcome.failures {
        eprintln!("warning: failed to load instance '{title}': {err:#}");
    }
    Ok(Host {
        config,
        storage,
        instances: outcome.instances,
    })
}

fn find<'a>(instances: &'a mut [Instance], title: &str) -> Result<&'a mut Instance> {
    instances
        .iter_mut()
        .find(|i| i.title == title)
        .with_context(|| format!("no instance titled '{title}'"))
}

async fn cmd_new(title: String, program: Option<String>, autoyes: bool, resume: bool) -> Result<()> {
    let mut host = load_host().await?;
    let path = std::env::current_dir().context("failed to get current directory")?;
    let program = program.unwrap_or_else(|| host.config.default_program.clone());
    let auto_yes = autoyes || host.config.auto_yes;

    let mut instance = Instance::new(
        InstanceOptions {
            title,
            path,
            program,
            auto_yes,
            seed_conversations: resume,
        },
        Arc::clone(&host.config),
    )?;
    ensure_unique(&host.instances, &instance)?;

    instance.start(true).await?;
    println!(
        "Started '{}' on branch {} ({})",
        instance.title,
        instance.branch,
        instance
            .worktree()
            .map(|wt| wt.worktree_path().display().to_string())
            .unwrap_or_default()
    );

    host.instances.push(instance);
    host.storage.save(&host.instances).await
}

async fn cmd_ls() -> Result<()> {
    let mut host = load_host().await?;
    if host.instances.is_empty() {
        println!("No instances");
        return Ok(());
    }
    for instance in host.instances.iter_mut() {
        if let Err(e) = instance.update_diff_stats().await {
            tracing::warn!("diff stats for '{}': {e:#}", instance.title);
        }
    }
    for instance in &host.instances {
        let status = match instance.status {
            Status::Running => "running",
            Status::Ready => "ready",
            Status::Loading => "loading",
            Status::Paused => "paused",
        };
        let diff = instance
            .diff_stats()
            .map(|d| format!(" +{} -{}", d.added, d.removed))
            .unwrap_or_default();
        println!("{:<24} {:<8} {}{}", instance.title, status, instance.branch, diff);
    }
    host.storage.save(&host.instances).await
}

async fn cmd_attach(title: &str) -> Result<()> {
    let mut host = load_host().await?;
    let instance = find(&mut host.instances, title)?;
    if !instance.tmux_alive().await {
        bail!("session for '{title}' is not running");
    }
    let detached = instance.attach().await?;
    // Blocks until the user detaches (or the session dies).
    let _ = detached.await;
    host.storage.save(&host.instances).await
}

async fn cmd_send(title: &str, prompt: &str) -> Result<()> {
    let mut host = load_host().await?;
    let instance = find(&mut host.instances, title)?;
    instance.send_prompt(prompt).await?;
    host.storage.save(&host.instances).await
}

async fn cmd_pause(title: &str) -> Result<()> {
    let mut host = load_host().await?;
    let instance = find(&mut host.instances, title)?;
    instance.pause().await?;
    println!("Paused '{title}' (branch {} kept)", instance.branch);
    host.storage.save(&host.instances).await
}

async fn cmd_resume(title: &str) -> Result<()> {
    let mut host = load_host().await?;
    let instance = find(&mut host.instances, title)?;
    instance.resume().await?;
    println!("Resumed '{title}'");
    host.storage.save(&host.instances).await
}

async fn cmd_push(title: &str) -> Result<()> {
    let mut host = load_host().await?;
    let instance = find(&mut host.instances, title)?;
    instance.push_changes().await?;
    println!("Pushed branch {}", instance.branch);
    host.storage.save(&host.instances).await
}

async fn cmd_kill(title: &str) -> Result<()> {
    let mut host = load_host().await?;
    let idx = host
        .instances
        .iter()
        .position(|i| i.title == title)
        .with_context(|| format!("no instance titled '{title}'"))?;
    let mut instance = host.instances.remove(idx);
    let result = instance.kill().await;
    // The record is removed even when cleanup partially failed; the error
    // still surfaces below.
    host.storage.save(&host.instances).await?;
    result?;
    println!("Killed '{title}'");
    Ok(())
}

async fn cmd_daemon() -> Result<()> {
    let host = load_host().await?;
    let interval = Duration::from_millis(host.config.daemon_poll_interval);
    let instances = Arc::new(Mutex::new(host.instances));
    let daemon = Daemon::spawn(Arc::clone(&instances), Arc::clone(&host.storage), interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    daemon.stop().await;

    let guard = instances.lock().await;
    host.storage.save(&guard).await
}
