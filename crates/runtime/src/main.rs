// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use orbitmesh::config::Config;
use orbitmesh::event::EventPayload;
use orbitmesh::executor::Executor;
use orbitmesh::registry::{CommandEntry, CommandRegistry, RegistryMode};
use orbitmesh::session::{AgentCommand, SessionConfig, SessionState};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    match run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / ORBITMESH_LOG_LEVEL > RUST_LOG > default.
    let filter = if std::env::var("ORBITMESH_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
    };
    drop(result);
}

/// Run one session end to end: events stream to stdout as JSON lines,
/// stdin lines become session input.
async fn run(config: Config) -> anyhow::Result<i32> {
    let registry = build_registry(&config)?;
    let executor = Arc::new(Executor::new(config.clone(), registry)?);

    match executor.recover() {
        Ok(0) => {}
        Ok(n) => info!(count = n, "recovered persisted sessions"),
        Err(e) => warn!(error = %e, "session recovery failed"),
    }

    let working_dir = match &config.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut session_config = SessionConfig::new(&config.provider, working_dir);
    if let Some(ref task) = config.task {
        session_config = session_config.with_task(task.clone());
    }
    if let Some(agent) = agent_command(&config) {
        session_config = session_config.with_command(agent);
    }

    let mut events = executor.subscribe(1024);
    let snapshot = executor.create(session_config)?;
    let id = snapshot.id.clone();
    executor.start(&id).await?;
    info!(session = %id, provider = %config.provider, "session running");

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut interrupted = false;
    let mut failed = false;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.session_id != id {
                    continue;
                }
                if let Ok(json) = serde_json::to_string(&event) {
                    println!("{json}");
                }
                if let EventPayload::StatusChange { new_state: SessionState::Idle, reason, .. } =
                    &event.payload
                {
                    failed = reason.as_deref() == Some("failed");
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(mut text)) => {
                        text.push('\n');
                        if let Err(e) = executor.send_input(&id, &text).await {
                            warn!(error = %e, "input rejected");
                        }
                    }
                    // stdin closed: let the session run on.
                    Ok(None) => stdin_open = false,
                    Err(e) => warn!(error = %e, "stdin read failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
            _ = sigterm.recv() => {
                interrupted = true;
                break;
            }
        }
    }

    executor.shutdown(config.stop_grace()).await;

    if interrupted {
        return Ok(130);
    }
    Ok(if failed { 1 } else { 0 })
}

/// Registry per config; strict mode pre-registers the commands the CLI
/// session will actually spawn.
fn build_registry(config: &Config) -> anyhow::Result<CommandRegistry> {
    let mode = config.registry_mode_enum()?;
    let mut registry =
        CommandRegistry::new(mode).with_caps(config.max_args, config.max_arg_len);

    if mode == RegistryMode::Strict {
        registry.register(CommandEntry::new("bash", "/bin/bash"))?;
        if let Some(agent) = agent_command(config) {
            registry.register(CommandEntry::new(agent.name.clone(), agent.command.clone()))?;
        }
    }

    Ok(registry)
}

/// The agent command given after `--`, if any.
fn agent_command(config: &Config) -> Option<AgentCommand> {
    let (command, args) = config.command.split_first()?;
    let command = PathBuf::from(command);
    let name = command
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "agent".to_owned());
    Some(AgentCommand { name, command, args: args.to_vec() })
}
