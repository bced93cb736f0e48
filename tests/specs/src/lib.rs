// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end executor and binary smoke tests.
//!
//! Builds real executors over temp directories and drives real
//! subprocesses (`bash`) through the provider variants.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use orbitmesh::broadcast::Subscription;
use orbitmesh::config::Config;
use orbitmesh::event::{Event, EventPayload};
use orbitmesh::executor::Executor;
use orbitmesh::registry::{CommandRegistry, RegistryMode};
use orbitmesh::session::{AgentCommand, SessionConfig, SessionState};

/// Parse a runtime config rooted at `data_dir` with extra CLI args.
pub fn test_config(data_dir: &Path, extra: &[&str]) -> Config {
    let mut args =
        vec!["orbitmesh".to_owned(), "--data-dir".to_owned(), data_dir.display().to_string()];
    args.extend(extra.iter().map(|s| (*s).to_owned()));
    Config::parse_from(args)
}

/// An executor rooted in its own temp directory.
pub struct TestRuntime {
    pub executor: Executor,
    pub data_dir: tempfile::TempDir,
}

impl TestRuntime {
    /// Permissive-registry runtime; `extra_args` tune breaker/stop knobs.
    pub fn new(extra_args: &[&str]) -> anyhow::Result<Self> {
        let data_dir = tempfile::tempdir()?;
        let config = test_config(data_dir.path(), extra_args);
        let registry = CommandRegistry::new(RegistryMode::Permissive);
        let executor = Executor::new(config, registry)?;
        Ok(Self { executor, data_dir })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.path().join("sessions")
    }

    /// A shell session rooted in the data dir.
    pub fn shell_config(&self) -> SessionConfig {
        SessionConfig::new("shell", self.data_dir.path())
    }

    /// A stdio session whose agent is `bash -c <script>`.
    pub fn bash_agent_config(&self, script: &str) -> SessionConfig {
        SessionConfig::new("stdio", self.data_dir.path()).with_command(AgentCommand {
            name: "bash".to_owned(),
            command: "/bin/bash".into(),
            args: vec!["-c".to_owned(), script.to_owned()],
        })
    }
}

/// Wait for an event matching the predicate, draining everything else.
pub async fn wait_for_event(
    sub: &mut Subscription,
    timeout: Duration,
    mut pred: impl FnMut(&Event) -> bool,
) -> Option<Event> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, sub.recv()).await {
            Ok(Some(event)) if pred(&event) => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Matcher: an Output event for `id` whose content contains `needle`.
pub fn output_containing<'a>(id: &'a str, needle: &'a str) -> impl FnMut(&Event) -> bool + 'a {
    move |event: &Event| {
        event.session_id == id
            && matches!(&event.payload, EventPayload::Output { content } if content.contains(needle))
    }
}

/// Matcher: a StatusChange into `to` with the given reason.
pub fn status_into<'a>(
    id: &'a str,
    to: SessionState,
    reason: &'a str,
) -> impl FnMut(&Event) -> bool + 'a {
    move |event: &Event| {
        event.session_id == id
            && matches!(
                &event.payload,
                EventPayload::StatusChange { new_state, reason: r, .. }
                    if *new_state == to && r.as_deref() == Some(reason)
            )
    }
}

/// Resolve the path to the compiled `orbitmesh` binary.
pub fn orbitmesh_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("orbitmesh")
}
