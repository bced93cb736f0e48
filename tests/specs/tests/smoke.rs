// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Smoke tests that spawn the real `orbitmesh` binary and drive one
//! session over its stdin/stdout JSONL surface.

use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use orbitmesh_specs::orbitmesh_binary;

const TIMEOUT: Duration = Duration::from_secs(20);

fn spawn_shell_session(data_dir: &std::path::Path) -> anyhow::Result<std::process::Child> {
    let child = Command::new(orbitmesh_binary())
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--log-format")
        .arg("text")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child)
}

#[test]
fn binary_streams_events_for_a_shell_session() -> anyhow::Result<()> {
    let data_dir = tempfile::tempdir()?;
    let mut child = spawn_shell_session(data_dir.path())?;

    let mut stdin =
        child.stdin.take().ok_or_else(|| anyhow::anyhow!("child stdin not captured"))?;
    let stdout =
        child.stdout.take().ok_or_else(|| anyhow::anyhow!("child stdout not captured"))?;
    let mut lines = BufReader::new(stdout).lines();

    stdin.write_all(b"echo smoke-marker\n")?;
    stdin.flush()?;

    // Every stdout line is one serialised event; wait for our output.
    let deadline = Instant::now() + TIMEOUT;
    let mut saw_marker = false;
    while Instant::now() < deadline {
        let Some(line) = lines.next() else { break };
        let line = line?;
        let Ok(event) = serde_json::from_str::<serde_json::Value>(&line) else {
            anyhow::bail!("non-JSON line on stdout: {line}");
        };
        if event["type"] == "output"
            && event["data"]["content"].as_str().is_some_and(|c| c.contains("smoke-marker"))
        {
            saw_marker = true;
            break;
        }
    }
    assert!(saw_marker, "binary never echoed the marker event");

    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    let _ = child.wait();
    Ok(())
}

#[test]
fn interrupt_exits_with_130() -> anyhow::Result<()> {
    let data_dir = tempfile::tempdir()?;
    let mut child = spawn_shell_session(data_dir.path())?;

    // Give the runtime a moment to start its session.
    std::thread::sleep(Duration::from_millis(800));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT)?;

    let deadline = Instant::now() + TIMEOUT;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            anyhow::bail!("binary did not exit after SIGINT");
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    assert_eq!(status.code(), Some(130));
    Ok(())
}

#[test]
fn session_state_lands_on_disk() -> anyhow::Result<()> {
    let data_dir = tempfile::tempdir()?;
    let mut child = spawn_shell_session(data_dir.path())?;

    // Wait for the session directory to appear.
    let sessions = data_dir.path().join("sessions");
    let deadline = Instant::now() + TIMEOUT;
    let session_file = loop {
        if let Ok(entries) = std::fs::read_dir(&sessions) {
            if let Some(entry) = entries.flatten().next() {
                let candidate = entry.path().join("session.json");
                if candidate.exists() {
                    break candidate;
                }
            }
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            anyhow::bail!("no session was persisted");
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(session_file)?)?;
    assert_eq!(value["config"]["provider"], "shell");

    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    let _ = child.wait();
    Ok(())
}
