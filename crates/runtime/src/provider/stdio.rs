// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stdio-JSON provider: launches an agent binary that speaks one JSON
//! document per line on stdout. Lines are assembled incrementally with a
//! hard byte cap, so arbitrarily large agent lines cannot wedge the run.

use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{Event, EventPayload};
use crate::registry::{CommandRegistry, SpawnRequest};
use crate::session::{AgentCommand, SessionConfig};

use super::parse::{encode_input, LineParser};
use super::{
    prepare_command, Provider, ProviderSettings, ProviderState, ProviderStatus, StatusCell,
};

/// Agent subprocess speaking the JSON line protocol over pipes.
pub struct StdioProvider {
    registry: Arc<CommandRegistry>,
    settings: ProviderSettings,
    status: StatusCell,
    events_tx: Option<mpsc::Sender<Event>>,
    events_rx: Option<mpsc::Receiver<Event>>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    child_pid: Arc<AtomicI32>,
}

impl StdioProvider {
    pub fn new(registry: Arc<CommandRegistry>, settings: ProviderSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.channel_capacity);
        Self {
            registry,
            settings,
            status: StatusCell::default(),
            events_tx: Some(tx),
            events_rx: Some(rx),
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            child_pid: Arc::new(AtomicI32::new(0)),
        }
    }
}

/// Pick and validate the agent command a line-protocol provider spawns.
pub(crate) fn agent_command<'a>(
    registry: &CommandRegistry,
    config: &'a SessionConfig,
) -> Result<&'a AgentCommand> {
    let command = config
        .commands
        .first()
        .ok_or_else(|| Error::ProviderStart("no agent command configured".to_owned()))?;
    registry.validate(&SpawnRequest {
        name: &command.name,
        command: &command.command,
        args: &command.args,
    })?;
    Ok(command)
}

#[async_trait]
impl Provider for StdioProvider {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    async fn start(&mut self, cancel: &CancellationToken, config: &SessionConfig) -> Result<()> {
        let agent = agent_command(&self.registry, config)?;

        let mut cmd = tokio::process::Command::new(&agent.command);
        cmd.args(&agent.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        prepare_command(&mut cmd, config);

        let mut child = cmd.spawn().map_err(|e| Error::ProviderStart(e.to_string()))?;
        if let Some(pid) = child.id() {
            self.child_pid.store(pid as i32, Ordering::Release);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProviderStart("agent stdout not captured".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ProviderStart("agent stderr not captured".to_owned()))?;
        *self.stdin.lock().await = child.stdin.take();

        let Some(tx) = self.events_tx.take() else {
            return Err(Error::ProviderStart("agent already started".to_owned()));
        };

        self.status.set_state(ProviderState::Active);

        tokio::spawn(pump_lines(
            stdout,
            tx.clone(),
            self.status.clone(),
            self.settings.max_line_bytes,
        ));
        tokio::spawn(pump_stderr(stderr, tx.clone(), self.status.clone()));
        tokio::spawn(supervise(child, cancel.clone(), tx, self.status.clone()));

        Ok(())
    }

    async fn send_input(&self, cancel: &CancellationToken, text: &str) -> Result<()> {
        let mut line = encode_input(text);
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(Error::ProviderIo("agent stdin closed".to_owned()));
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            } => written.map_err(|e| Error::ProviderIo(e.to_string())),
        }
    }

    async fn stop(&self, _cancel: &CancellationToken) -> Result<()> {
        // EOF on stdin is the protocol's shutdown signal; SIGTERM covers
        // agents that ignore it.
        self.stdin.lock().await.take();
        let pid = self.child_pid.load(Ordering::Acquire);
        if pid != 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let pid = self.child_pid.load(Ordering::Acquire);
        if pid != 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        Ok(())
    }

    fn status(&self) -> ProviderStatus {
        self.status.snapshot()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.take()
    }
}

/// Mirror a parsed event into the provider status cell.
pub(crate) fn track_status(status: &StatusCell, event: &Event) {
    match &event.payload {
        EventPayload::Output { content } => status.record_output(content),
        EventPayload::Metric { tokens_in, tokens_out, request_count } => {
            status.add_metrics(*tokens_in, *tokens_out, *request_count);
        }
        EventPayload::Error { message, .. } => status.record_error(message),
        _ => {}
    }
}

/// Parse agent stdout into domain events until EOF.
async fn pump_lines(
    mut stdout: ChildStdout,
    tx: mpsc::Sender<Event>,
    status: StatusCell,
    max_line_bytes: usize,
) {
    let mut parser = LineParser::new(max_line_bytes);
    let mut buf = vec![0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for event in parser.feed(&buf[..n]) {
                    track_status(&status, &event);
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.send(Event::fatal("", format!("agent read failed: {err}"))).await;
                return;
            }
        }
    }
    if let Some(event) = parser.finish() {
        track_status(&status, &event);
        let _ = tx.send(event).await;
    }
}

/// Agent diagnostics on stderr pass through as raw output.
pub(crate) async fn pump_stderr(
    mut stderr: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<Event>,
    status: StatusCell,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let content = String::from_utf8_lossy(&buf[..n]).into_owned();
                status.record_output(&content);
                if tx.send(Event::output("", content)).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
    status: StatusCell,
) {
    let exit = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("agent run cancelled, killing child");
            let _ = child.start_kill();
            child.wait().await
        }
        exit = child.wait() => exit,
    };

    match exit {
        Ok(exit_status) => {
            status.set_state(ProviderState::Exited);
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                exit_status.signal()
            };
            let _ = tx
                .send(Event::metadata(
                    "",
                    "exit_code",
                    serde_json::json!({ "code": exit_status.code(), "signal": signal }),
                ))
                .await;
        }
        Err(err) => {
            status.set_state(ProviderState::Failed);
            status.record_error(&err.to_string());
            let _ = tx.send(Event::fatal("", format!("agent wait failed: {err}"))).await;
        }
    }
}

#[cfg(test)]
#[path = "stdio_tests.rs"]
mod tests;
