mod cli;
mod shutdown;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scribe_core::stubs::{
    FsOutputRenderer, PathHashAudioMetadata, SimulatedAcceleratorDriver,
    SimulatedTranscriptionEngine,
};
use scribe_core::{
    start_orchestrator, Collaborators, Language, OutputFormat, ServerEvent, TaskId, TaskSpec,
    TaskStatus,
};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

/// Render one event as a single printable line, or `None` for events this
/// demo doesn't surface (heartbeats, compaction notices).
fn format_event_line(event: &ServerEvent) -> Option<String> {
    match event {
        ServerEvent::TaskUpdate { id, status, progress, message, error, results, .. } => {
            Some(match status {
                TaskStatus::Completed => {
                    format!("task {id:>3}  completed, {} file(s) rendered", results.len())
                }
                TaskStatus::Failed => {
                    let detail = error.as_ref().map(|(_, d)| d.as_str()).unwrap_or(message);
                    format!("task {id:>3}  failed: {detail}")
                }
                TaskStatus::Processing => {
                    format!("task {id:>3}  {status:?} [{:.0}%] {message}", progress * 100.0)
                }
                _ => format!("task {id:>3}  {status:?} {message}"),
            })
        }
        ServerEvent::DownloadProgress { task_id, model_name, progress, message } => {
            Some(format!("task {task_id:>3}  loading {model_name} [{progress}] {message}"))
        }
        ServerEvent::Heartbeat { .. } | ServerEvent::Compaction { .. } => None,
    }
}

/// Extract the id of a task that just reached a *terminal* state, if this
/// event marks one.
fn terminal_task_id(event: &ServerEvent) -> Option<TaskId> {
    match event {
        ServerEvent::TaskUpdate { id, status, .. }
            if matches!(status, TaskStatus::Completed | TaskStatus::Failed) =>
        {
            Some(*id)
        }
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = scribe_config::load_from_env()?;
    config.max_concurrent_tasks_default =
        cli.concurrency.clamp(1, scribe_config::HARD_CONCURRENCY_LIMIT);
    config.validate()?;

    let collaborators = Collaborators::new(
        Arc::new(SimulatedTranscriptionEngine {
            load_delay: Duration::from_millis(200),
            transcribe_delay: Duration::from_millis(300),
        }),
        Arc::new(FsOutputRenderer),
        Arc::new(PathHashAudioMetadata),
        Arc::new(SimulatedAcceleratorDriver::new(cli.simulated_gpus.max(1), 16.0)),
    );

    let handle = start_orchestrator(config, collaborators);

    let files = if cli.files.is_empty() {
        vec!["demo-clip-1.wav".to_string(), "demo-clip-2.wav".to_string()]
    } else {
        cli.files.clone()
    };
    for file in &files {
        if !std::path::Path::new(file).exists() {
            std::fs::write(file, []).map_err(|e| anyhow::anyhow!("create demo file {file}: {e}"))?;
        }
    }
    let formats: Vec<OutputFormat> = cli.formats.iter().map(|f| (*f).into()).collect();

    println!(
        "scribe {} — starting at {}",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    let mut pending = HashSet::new();
    for file in &files {
        let id = handle.submit(TaskSpec {
            files: vec![file.clone()],
            model: cli.model.clone(),
            language: Language::Auto,
            formats: formats.clone(),
            priority: cli.priority.into(),
            preferred_gpu: None,
        })?;
        info!(task_id = id, file, "task submitted");
        println!("task {id:>3}  requested   file={file}");
        pending.insert(id);
    }

    let mut events = handle.subscribe();
    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    let mut immediate_exit = false;
    while !pending.is_empty() {
        tokio::select! {
            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!(
                            "stop requested — finishing in-flight tasks (press CTRL+C again to exit immediately)"
                        );
                        handle.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        warn!("immediate shutdown requested, abandoning in-flight tasks");
                        eprintln!("stop requested again — exiting immediately");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break; };
                if let Some(id) = terminal_task_id(&event) {
                    pending.remove(&id);
                }
                if let Some(line) = format_event_line(&event) {
                    println!("{line}");
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    handle.request_stop();
    handle.wait().await?;
    Ok(())
}
