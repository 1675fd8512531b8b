use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dh_agents::events::TaskEvent;
use dh_agents::lifecycle::ContainerLifecycle;
use dh_agents::prelaunch::{self, CooldownChoice, PreLaunch};
use dh_agents::runtime::DockerCli;
use dh_agents::scheduler::TaskScheduler;
use dh_agents::supervisor::{TaskResult, TaskSupervisor};
use dh_core::config::Config;
use dh_core::types::{Task, TaskStatus};
use dh_harness::classifier::ErrorClassifier;
use tracing::{info, warn};

use super::{open_artifacts, open_cooldowns};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub environment_id: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub branch: Option<String>,
    pub on_cooldown: Option<CooldownChoice>,
    pub json: bool,
}

/// Run one task to completion. Returns whether it succeeded.
pub async fn run(cfg: &Config, opts: RunOptions) -> anyhow::Result<bool> {
    let env = cfg
        .environment(&opts.environment_id)
        .with_context(|| format!("unknown environment '{}'", opts.environment_id))?;
    if !opts.workdir.is_dir() {
        anyhow::bail!("workdir does not exist: {}", opts.workdir.display());
    }

    let tracker = Arc::new(open_cooldowns(cfg)?);
    let mut chain = cfg.chain_for(&opts.environment_id);
    if chain.is_empty() {
        anyhow::bail!(
            "environment '{}' has no usable agents (primary '{}' is not configured)",
            opts.environment_id,
            env.primary_agent
        );
    }

    if let PreLaunch::OnCooldown {
        agent_id,
        seconds_remaining,
        reason,
        fallback_available,
        ..
    } = prelaunch::check(&tracker, &chain)
    {
        eprintln!(
            "{agent_id} is cooling down for another {:.0}s{}",
            seconds_remaining,
            reason.map(|r| format!(" ({r})")).unwrap_or_default()
        );
        let Some(choice) = opts.on_cooldown else {
            let options = if fallback_available {
                "fallback|bypass|cancel"
            } else {
                "bypass|cancel"
            };
            anyhow::bail!("rerun with --on-cooldown {options}");
        };
        match prelaunch::resolve_choice(&tracker, &chain, choice).context("applying cooldown choice")? {
            Some(picked) => chain = picked,
            None => {
                eprintln!("task not started");
                return Ok(false);
            }
        }
    }

    let runtime = Arc::new(DockerCli::new(cfg.container.engine.clone()));
    let lifecycle = ContainerLifecycle::new(
        runtime,
        cfg.container.clone(),
        cfg.environments.clone(),
        cfg.staging_dir(),
    );
    let classifier = ErrorClassifier::from_config(&cfg.rate_limits).context("compiling rate limit patterns")?;
    let supervisor = Arc::new(
        TaskSupervisor::new(Arc::new(lifecycle), classifier, tracker, open_artifacts(cfg))
            .with_default_cooldown(cfg.rate_limits.default_cooldown()),
    );

    let mut task = Task::new(
        opts.prompt,
        opts.environment_id.clone(),
        env.name.clone(),
        opts.workdir,
        chain,
    );
    if let Some(branch) = opts.branch {
        task = task.with_branch(branch);
    }
    info!(task_id = %task.id, environment = %opts.environment_id, "submitting task");

    let scheduler = TaskScheduler::new(cfg.scheduler.max_concurrent);
    let (tx, rx) = flume::unbounded::<TaskEvent>();
    let handle = scheduler.submit(supervisor, task, cfg.supervisor.clone(), Arc::new(tx));

    let stop = handle.stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping task");
            stop.trigger();
        }
    });

    // Ends once the supervisor drops its sender.
    while let Ok(event) = rx.recv_async().await {
        if opts.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }

    let (task, result) = handle.wait().await?;
    if opts.json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        print_summary(&task, &result);
    }
    Ok(result.succeeded())
}

fn print_event(event: &TaskEvent) {
    match event {
        TaskEvent::LogLine { line, .. } => println!("{line}"),
        TaskEvent::StateChanged { to, .. } => match to {
            TaskStatus::Launch | TaskStatus::Completed(_) => eprintln!("[dockhand] {to}"),
            _ => {}
        },
        TaskEvent::RetryScheduled {
            attempt,
            agent_id,
            delay_ms,
            ..
        } => eprintln!(
            "[dockhand] retrying {agent_id} as attempt {attempt} in {:.1}s",
            *delay_ms as f64 / 1000.0
        ),
        TaskEvent::AgentSwitched { from, to, .. } => {
            eprintln!("[dockhand] {from} exhausted, switching to {to}")
        }
    }
}

fn print_summary(task: &Task, result: &TaskResult) {
    let meta = &result.metadata;
    println!();
    println!("task {}  {}", task.id, result.outcome);
    println!("{}", "-".repeat(40));
    println!("Agent:      {}", meta.agent_used.as_deref().unwrap_or("-"));
    println!("Attempts:   {}", meta.attempt_count);
    println!("Retries:    {}", meta.retry_count);
    println!("Fallbacks:  {}", meta.fallback_count);
    if let Some(code) = result.exit_code {
        println!("Exit code:  {code}");
    }
    if let Some(error) = &result.error {
        println!("Error:      {error}");
    }
    if !result.artifacts.is_empty() {
        println!("Artifacts:");
        for artifact in &result.artifacts {
            println!(
                "  {}  {}  ({} bytes)",
                artifact.id, artifact.meta.original_name, artifact.meta.size_bytes
            );
        }
    }
}
