// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shell provider: an interactive `bash` over plain pipes. Raw reads
//! become `Output` events; the exit status surfaces as metadata.

use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::registry::{CommandRegistry, SpawnRequest};
use crate::session::SessionConfig;

use super::{
    prepare_command, Provider, ProviderSettings, ProviderState, ProviderStatus, StatusCell,
};

const BASH: &str = "/bin/bash";

/// Interactive shell over stdio pipes. Does not support suspend.
pub struct ShellProvider {
    registry: Arc<CommandRegistry>,
    status: StatusCell,
    events_tx: Option<mpsc::Sender<Event>>,
    events_rx: Option<mpsc::Receiver<Event>>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    child_pid: Arc<AtomicI32>,
}

impl ShellProvider {
    pub fn new(registry: Arc<CommandRegistry>, settings: ProviderSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.channel_capacity);
        Self {
            registry,
            status: StatusCell::default(),
            events_tx: Some(tx),
            events_rx: Some(rx),
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            child_pid: Arc::new(AtomicI32::new(0)),
        }
    }
}

#[async_trait]
impl Provider for ShellProvider {
    fn kind(&self) -> &'static str {
        "shell"
    }

    async fn start(&mut self, cancel: &CancellationToken, config: &SessionConfig) -> Result<()> {
        let args = vec!["-i".to_owned()];
        self.registry.validate(&SpawnRequest {
            name: "bash",
            command: std::path::Path::new(BASH),
            args: &args,
        })?;

        let mut cmd = tokio::process::Command::new(BASH);
        cmd.args(&args)
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
            .ok_or_else(|| Error::ProviderStart("shell stdout not captured".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ProviderStart("shell stderr not captured".to_owned()))?;
        *self.stdin.lock().await = child.stdin.take();

        let Some(tx) = self.events_tx.take() else {
            return Err(Error::ProviderStart("shell already started".to_owned()));
        };

        self.status.set_state(ProviderState::Active);

        tokio::spawn(pump_raw(stdout, tx.clone(), self.status.clone()));
        tokio::spawn(pump_raw(stderr, tx.clone(), self.status.clone()));
        tokio::spawn(supervise(child, cancel.clone(), tx, self.status.clone()));

        Ok(())
    }

    async fn send_input(&self, cancel: &CancellationToken, text: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(Error::ProviderIo("shell stdin closed".to_owned()));
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            written = async {
                stdin.write_all(text.as_bytes()).await?;
                stdin.flush().await
            } => written.map_err(|e| Error::ProviderIo(e.to_string())),
        }
    }

    async fn stop(&self, _cancel: &CancellationToken) -> Result<()> {
        // Closing stdin lets an interactive bash exit on EOF; the HUP
        // covers shells wedged in a foreground job.
        self.stdin.lock().await.take();
        let pid = self.child_pid.load(Ordering::Acquire);
        if pid != 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGHUP);
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

    fn supports_suspend(&self) -> bool {
        false
    }
}

/// Forward raw reads from one pipe as `Output` events until EOF.
async fn pump_raw(
    mut pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<Event>,
    status: StatusCell,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let content = String::from_utf8_lossy(&buf[..n]).into_owned();
                status.record_output(&content);
                if tx.send(Event::output("", content)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(Event::fatal("", format!("shell read failed: {err}"))).await;
                break;
            }
        }
    }
}

/// Wait for the child, killing it if the run scope is cancelled first.
async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
    status: StatusCell,
) {
    let exit = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("shell run cancelled, killing child");
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
            let _ = tx.send(Event::fatal("", format!("shell wait failed: {err}"))).await;
        }
    }
}

#[cfg(test)]
#[path = "shell_tests.rs"]
mod tests;
