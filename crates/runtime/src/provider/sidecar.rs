// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sidecar provider: spawns an agent subprocess that dials back over a
//! loopback WebSocket and exchanges framed line-protocol messages.

use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::registry::CommandRegistry;
use crate::session::SessionConfig;

use super::parse::{encode_input, LineParser};
use super::stdio::{agent_command, track_status};
use super::{
    prepare_command, Provider, ProviderSettings, ProviderState, ProviderStatus, StatusCell,
};

/// Environment variable telling the sidecar where to dial back.
pub const SIDECAR_ADDR_ENV: &str = "ORBITMESH_SIDECAR_ADDR";

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Agent subprocess connected over a loopback WebSocket.
pub struct SidecarProvider {
    registry: Arc<CommandRegistry>,
    settings: ProviderSettings,
    status: StatusCell,
    events_tx: Option<mpsc::Sender<Event>>,
    events_rx: Option<mpsc::Receiver<Event>>,
    writer: Arc<tokio::sync::Mutex<Option<WsWriter>>>,
    child_pid: Arc<AtomicI32>,
}

impl SidecarProvider {
    pub fn new(registry: Arc<CommandRegistry>, settings: ProviderSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.channel_capacity);
        Self {
            registry,
            settings,
            status: StatusCell::default(),
            events_tx: Some(tx),
            events_rx: Some(rx),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            child_pid: Arc::new(AtomicI32::new(0)),
        }
    }
}

#[async_trait]
impl Provider for SidecarProvider {
    fn kind(&self) -> &'static str {
        "sidecar"
    }

    async fn start(&mut self, cancel: &CancellationToken, config: &SessionConfig) -> Result<()> {
        let agent = agent_command(&self.registry, config)?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::ProviderStart(format!("sidecar listener: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::ProviderStart(format!("sidecar listener: {e}")))?;

        let mut cmd = tokio::process::Command::new(&agent.command);
        cmd.args(&agent.args)
            .env(SIDECAR_ADDR_ENV, addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        prepare_command(&mut cmd, config);

        let mut child = cmd.spawn().map_err(|e| Error::ProviderStart(e.to_string()))?;
        if let Some(pid) = child.id() {
            self.child_pid.store(pid as i32, Ordering::Release);
        }
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ProviderStart("sidecar stderr not captured".to_owned()))?;

        // The subprocess must dial back before the handshake deadline.
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(self.settings.handshake_timeout) => {
                let _ = child.start_kill();
                return Err(Error::ProviderStart(format!(
                    "sidecar did not dial back within {:?}",
                    self.settings.handshake_timeout
                )));
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) =
            accepted.map_err(|e| Error::ProviderStart(format!("sidecar accept: {e}")))?;
        debug!(%peer, "sidecar dialed back");

        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::ProviderStart(format!("sidecar handshake: {e}")))?;
        let (writer, reader) = ws.split();
        *self.writer.lock().await = Some(writer);

        let Some(tx) = self.events_tx.take() else {
            return Err(Error::ProviderStart("sidecar already started".to_owned()));
        };

        self.status.set_state(ProviderState::Active);

        tokio::spawn(pump_frames(
            reader,
            cancel.clone(),
            tx.clone(),
            self.status.clone(),
            self.settings.max_line_bytes,
        ));
        tokio::spawn(super::stdio::pump_stderr(stderr, tx.clone(), self.status.clone()));
        tokio::spawn(supervise(child, cancel.clone(), tx, self.status.clone()));

        Ok(())
    }

    async fn send_input(&self, cancel: &CancellationToken, text: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::ProviderIo("sidecar socket closed".to_owned()));
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = writer.send(Message::Text(encode_input(text).into())) => {
                sent.map_err(|e| Error::ProviderIo(e.to_string()))
            }
        }
    }

    async fn stop(&self, _cancel: &CancellationToken) -> Result<()> {
        if let Some(writer) = self.writer.lock().await.as_mut() {
            let _ = writer.send(Message::Close(None)).await;
        }
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

/// Translate incoming frames into domain events until the socket closes.
async fn pump_frames(
    mut reader: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
    status: StatusCell,
    max_line_bytes: usize,
) {
    // Each frame is one complete line-protocol document.
    let mut parser = LineParser::new(max_line_bytes);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = reader.next() => msg,
        };
        let frame = match msg {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue, // ping/pong
            Some(Err(e)) => {
                let _ = tx.send(Event::fatal("", format!("sidecar socket error: {e}"))).await;
                break;
            }
        };
        let mut framed = frame.into_bytes();
        framed.push(b'\n');
        for event in parser.feed(&framed) {
            track_status(&status, &event);
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

async fn supervise(
    mut child: tokio::process::Child,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
    status: StatusCell,
) {
    let exit = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("sidecar run cancelled, killing child");
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
            let _ = tx.send(Event::fatal("", format!("sidecar wait failed: {err}"))).await;
        }
    }
}

#[cfg(test)]
#[path = "sidecar_tests.rs"]
mod tests;
