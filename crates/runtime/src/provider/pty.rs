// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY provider: the JSON line protocol over a pseudo-terminal, for
//! agent binaries that refuse to run without a TTY.

use std::ffi::CString;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::registry::CommandRegistry;
use crate::session::SessionConfig;

use super::parse::{encode_input, LineParser};
use super::stdio::{agent_command, track_status};
use super::{Provider, ProviderSettings, ProviderState, ProviderStatus, StatusCell};

const DEFAULT_COLS: u16 = 200;
const DEFAULT_ROWS: u16 = 50;

/// Non-blocking handle to the PTY master, shared between the reader
/// task and the input path. Owns the fd for the life of the run.
struct PtyMaster {
    afd: AsyncFd<OwnedFd>,
}

impl PtyMaster {
    /// Take ownership of the master fd, flipping it non-blocking before
    /// registering it with the reactor.
    fn new(master: OwnedFd) -> io::Result<Self> {
        let flags = fcntl(&master, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(&master, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(Self { afd: AsyncFd::new(master)? })
    }

    /// Read whatever the child has written, waiting for readiness.
    async fn read_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.afd.readable().await?;
            match guard
                .try_io(|afd| nix::unistd::read(afd, buf).map_err(io::Error::from))
            {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one protocol line to the child, newline-terminated, in as
    /// many partial writes as the PTY buffer demands.
    async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        let mut written = 0;
        while written < data.len() {
            let mut guard = self.afd.writable().await?;
            match guard
                .try_io(|afd| nix::unistd::write(afd, &data[written..]).map_err(io::Error::from))
            {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

/// Agent subprocess on a pseudo-terminal, speaking the line protocol.
pub struct PtyProvider {
    registry: Arc<CommandRegistry>,
    settings: ProviderSettings,
    status: StatusCell,
    events_tx: Option<mpsc::Sender<Event>>,
    events_rx: Option<mpsc::Receiver<Event>>,
    master: Option<Arc<PtyMaster>>,
    child_pid: Arc<AtomicI32>,
}

impl PtyProvider {
    pub fn new(registry: Arc<CommandRegistry>, settings: ProviderSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.channel_capacity);
        Self {
            registry,
            settings,
            status: StatusCell::default(),
            events_tx: Some(tx),
            events_rx: Some(rx),
            master: None,
            child_pid: Arc::new(AtomicI32::new(0)),
        }
    }
}

/// Terminal size from the provider options bag, falling back to defaults.
fn winsize_from(config: &SessionConfig) -> Winsize {
    let dim = |key: &str, default: u16| {
        config
            .options
            .get(key)
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(default)
    };
    Winsize {
        ws_col: dim("cols", DEFAULT_COLS),
        ws_row: dim("rows", DEFAULT_ROWS),
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

#[async_trait]
impl Provider for PtyProvider {
    fn kind(&self) -> &'static str {
        "pty"
    }

    // forkpty requires unsafe: the post-fork child is partially initialized
    #[allow(unsafe_code)]
    async fn start(&mut self, cancel: &CancellationToken, config: &SessionConfig) -> Result<()> {
        let agent = agent_command(&self.registry, config)?;
        let winsize = winsize_from(config);

        let mut argv = vec![agent.command.display().to_string()];
        argv.extend(agent.args.iter().cloned());

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. The child only adjusts
        // env/cwd and execs.
        let result = unsafe { forkpty(&winsize, None) }
            .map_err(|e| Error::ProviderStart(format!("forkpty failed: {e}")))?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                if std::env::set_current_dir(&config.working_dir).is_err() {
                    std::process::exit(126);
                }
                for (key, value) in &config.environment {
                    std::env::set_var(key, value);
                }

                let Ok(c_args) = argv
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<std::result::Result<Vec<_>, _>>()
                else {
                    std::process::exit(127);
                };
                let _ = execvp(&c_args[0], &c_args);
                std::process::exit(127);
            }
            ForkptyResult::Parent { child, master } => {
                let master = PtyMaster::new(master)
                    .map_err(|e| Error::ProviderStart(format!("pty master: {e}")))?;
                let master = Arc::new(master);

                self.child_pid.store(child.as_raw(), Ordering::Release);
                self.master = Some(Arc::clone(&master));

                let Some(tx) = self.events_tx.take() else {
                    return Err(Error::ProviderStart("pty agent already started".to_owned()));
                };

                self.status.set_state(ProviderState::Active);

                tokio::spawn(pump_master(
                    master,
                    child,
                    cancel.clone(),
                    tx,
                    self.status.clone(),
                    self.settings.max_line_bytes,
                ));

                Ok(())
            }
        }
    }

    async fn send_input(&self, cancel: &CancellationToken, text: &str) -> Result<()> {
        let Some(master) = self.master.as_ref() else {
            return Err(Error::ProviderIo("pty not started".to_owned()));
        };
        let line = encode_input(text);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            written = master.write_line(&line) => {
                written.map_err(|e| Error::ProviderIo(e.to_string()))
            }
        }
    }

    async fn stop(&self, _cancel: &CancellationToken) -> Result<()> {
        let pid = self.child_pid.load(Ordering::Acquire);
        if pid != 0 {
            // The forkpty child leads its own session; signal the group.
            let _ = kill(Pid::from_raw(-pid), Signal::SIGHUP);
        }
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let pid = self.child_pid.load(Ordering::Acquire);
        if pid != 0 {
            let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
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

/// Read the PTY master until the child hangs up, then reap it.
async fn pump_master(
    master: Arc<PtyMaster>,
    child: Pid,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
    status: StatusCell,
    max_line_bytes: usize,
) {
    let mut parser = LineParser::new(max_line_bytes);
    let mut buf = vec![0u8; 8192];
    let mut killed = false;

    'read: loop {
        tokio::select! {
            _ = cancel.cancelled(), if !killed => {
                debug!("pty run cancelled, killing child group");
                killed = true;
                let _ = kill(Pid::from_raw(-child.as_raw()), Signal::SIGKILL);
                // Keep reading so the final bytes drain before EIO.
            }
            read = master.read_into(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for event in parser.feed(&buf[..n]) {
                            track_status(&status, &event);
                            if tx.send(event).await.is_err() {
                                break 'read;
                            }
                        }
                    }
                    // EIO is the PTY master's EOF once the child exits.
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                    Err(e) => {
                        let _ = tx.send(Event::fatal("", format!("pty read failed: {e}"))).await;
                        break;
                    }
                }
            }
        }
    }

    if let Some(event) = parser.finish() {
        track_status(&status, &event);
        let _ = tx.send(event).await;
    }

    // Reap on a blocking thread to keep the runtime free.
    let reaped = tokio::task::spawn_blocking(move || wait_for_exit(child)).await;
    match reaped {
        Ok(Ok((code, signal))) => {
            status.set_state(ProviderState::Exited);
            let _ = tx
                .send(Event::metadata(
                    "",
                    "exit_code",
                    serde_json::json!({ "code": code, "signal": signal }),
                ))
                .await;
        }
        Ok(Err(err)) => {
            status.set_state(ProviderState::Failed);
            status.record_error(&err);
            let _ = tx.send(Event::fatal("", err)).await;
        }
        Err(join_err) => {
            status.set_state(ProviderState::Failed);
            let _ = tx.send(Event::fatal("", format!("pty reap task failed: {join_err}"))).await;
        }
    }
}

/// Block until the child exits, returning `(code, signal)`.
fn wait_for_exit(pid: Pid) -> std::result::Result<(Option<i32>, Option<i32>), String> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok((Some(code), None)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok((None, Some(sig as i32))),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(format!("waitpid failed: {e}")),
        }
    }
}

#[cfg(test)]
#[path = "pty_tests.rs"]
mod tests;
