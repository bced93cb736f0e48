// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end lifecycle scenarios driving real subprocesses through the
//! executor: shell round trips, invalid transitions, breaker cooldowns,
//! persistence, and ordered shutdown.

use std::time::Duration;

use orbitmesh::error::Error;
use orbitmesh::session::SessionState;
use orbitmesh_specs::{output_containing, status_into, wait_for_event, TestRuntime};

const WAIT: Duration = Duration::from_secs(15);

// -- scenario: Idle → Running → Idle ------------------------------------------

#[tokio::test]
async fn shell_session_round_trip() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[])?;
    let mut sub = rt.executor.subscribe(256);

    let id = rt.executor.create(rt.shell_config())?.id;
    rt.executor.start(&id).await?;
    assert_eq!(rt.executor.get(&id)?.state, SessionState::Running);

    rt.executor.send_input(&id, "echo round-trip-$((6 * 7))\n").await?;
    let hit = wait_for_event(&mut sub, WAIT, output_containing(&id, "round-trip-42")).await;
    assert!(hit.is_some(), "echo output never reached the subscriber");

    rt.executor.stop(&id, Duration::from_secs(5)).await?;
    let stopped =
        wait_for_event(&mut sub, WAIT, status_into(&id, SessionState::Idle, "stopped")).await;
    assert!(stopped.is_some(), "missing running→idle transition with reason=stopped");

    let snapshot = rt.executor.get(&id)?;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.output.contains("round-trip-42"));
    Ok(())
}

// -- scenario: invalid transition ---------------------------------------------

#[tokio::test]
async fn suspend_before_start_is_rejected() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[])?;
    let id = rt.executor.create(rt.shell_config())?.id;

    let err = rt.executor.suspend(&id, "too early").await;
    assert!(matches!(
        err,
        Err(Error::InvalidTransition { from: SessionState::Idle, to: SessionState::Suspended })
    ));
    assert_eq!(rt.executor.get(&id)?.state, SessionState::Idle);
    assert!(rt.executor.get(&id)?.transitions.is_empty());
    Ok(())
}

// -- scenario: shell rejects suspend ------------------------------------------

#[tokio::test]
async fn shell_sessions_cannot_suspend() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[])?;
    let id = rt.executor.create(rt.shell_config())?.id;
    rt.executor.start(&id).await?;

    let err = rt.executor.suspend(&id, "pause").await;
    assert!(matches!(err, Err(Error::NotSupported { operation: "suspend", .. })));
    assert_eq!(rt.executor.get(&id)?.state, SessionState::Running);

    rt.executor.kill(&id).await?;
    Ok(())
}

// -- scenario: circuit breaker ------------------------------------------------

#[tokio::test]
async fn breaker_blocks_flapping_starts_until_cooldown() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[
        "--breaker-threshold",
        "3",
        "--breaker-cooldown-ms",
        "100",
    ])?;

    let mut config = rt.bash_agent_config("true");
    // Point the agent at a binary that cannot spawn.
    config.commands[0].command = "/nonexistent/agent".into();
    let id = rt.executor.create(config)?.id;

    for attempt in 0..3 {
        let err = rt.executor.start(&id).await;
        assert!(matches!(err, Err(Error::ProviderStart(_))), "attempt {attempt}: {err:?}");
    }

    // Tripped on the third consecutive failure.
    let err = rt.executor.start(&id).await;
    let Err(Error::BreakerOpen { retry_in }) = err else {
        anyhow::bail!("expected BreakerOpen, got {err:?}");
    };
    assert!(retry_in <= Duration::from_millis(100));

    // After the cooldown the executor talks to the provider again.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let err = rt.executor.start(&id).await;
    assert!(matches!(err, Err(Error::ProviderStart(_))), "cooldown did not lift: {err:?}");
    Ok(())
}

// -- persistence --------------------------------------------------------------

#[tokio::test]
async fn snapshots_and_activity_survive_on_disk() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[])?;
    let mut sub = rt.executor.subscribe(256);

    let id = rt.executor.create(rt.shell_config())?.id;
    let session_file = rt.sessions_dir().join(&id).join("session.json");
    assert!(session_file.exists(), "create must persist the snapshot");

    rt.executor.start(&id).await?;
    rt.executor.send_input(&id, "echo persisted-marker\n").await?;
    assert!(wait_for_event(&mut sub, WAIT, output_containing(&id, "persisted-marker"))
        .await
        .is_some());
    rt.executor.stop(&id, Duration::from_secs(5)).await?;

    // On-disk snapshot reflects the settled state.
    let raw = std::fs::read_to_string(&session_file)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(value["state"], "idle");
    assert_eq!(value["id"], id.as_str());

    // The activity log holds the transition history, newest last.
    let tail = rt.executor.store().tail_activity(&id, 4)?;
    assert!(!tail.is_empty());
    let last: serde_json::Value = serde_json::from_str(tail.last().map(String::as_str).unwrap_or("{}"))?;
    assert_eq!(last["type"], "status_change");
    assert_eq!(last["data"]["new_state"], "idle");

    // A fresh executor over the same directory recovers the session.
    let config = orbitmesh_specs::test_config(rt.data_dir.path(), &[]);
    let registry = orbitmesh::registry::CommandRegistry::new(
        orbitmesh::registry::RegistryMode::Permissive,
    );
    let recovered = orbitmesh::executor::Executor::new(config, registry)?;
    assert_eq!(recovered.recover()?, 1);
    assert_eq!(recovered.get(&id)?.state, SessionState::Idle);
    Ok(())
}

// -- stdio agent through the executor -----------------------------------------

#[tokio::test]
async fn stdio_agent_metrics_accumulate_into_the_session() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[])?;
    let mut sub = rt.executor.subscribe(256);

    let script = r#"
        printf '{"type":"output","content":"agent says hi"}\n'
        printf '{"type":"metric","tokens_in":11,"tokens_out":7,"request_count":2}\n'
        printf '{"type":"metadata","key":"task","value":"summarise"}\n'
    "#;
    let id = rt.executor.create(rt.bash_agent_config(script))?.id;
    rt.executor.start(&id).await?;

    let done =
        wait_for_event(&mut sub, WAIT, status_into(&id, SessionState::Idle, "completed")).await;
    assert!(done.is_some(), "agent run never completed");

    let snapshot = rt.executor.get(&id)?;
    assert!(snapshot.output.contains("agent says hi"));
    assert_eq!(snapshot.metrics.tokens_in, 11);
    assert_eq!(snapshot.metrics.tokens_out, 7);
    assert_eq!(snapshot.metrics.request_count, 2);
    assert_eq!(snapshot.task.as_deref(), Some("summarise"));
    Ok(())
}

// -- ordered shutdown ----------------------------------------------------------

#[tokio::test]
async fn shutdown_terminates_live_runs_and_closes_subscribers() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[])?;
    let mut sub = rt.executor.subscribe(256);

    let a = rt.executor.create(rt.shell_config())?.id;
    let b = rt.executor.create(rt.bash_agent_config("sleep 30"))?.id;
    rt.executor.start(&a).await?;
    rt.executor.start(&b).await?;

    rt.executor.shutdown(Duration::from_secs(2)).await;

    for id in [&a, &b] {
        assert_eq!(rt.executor.get(id)?.state, SessionState::Idle, "session {id} still live");
    }

    // The subscriber drains and then observes end-of-stream.
    let closed = tokio::time::timeout(WAIT, async {
        while sub.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "broadcaster never closed");

    assert!(matches!(rt.executor.create(rt.shell_config()), Err(Error::Cancelled)));
    Ok(())
}

// -- event wire format ---------------------------------------------------------

#[tokio::test]
async fn broadcast_events_serialise_to_the_wire_format() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[])?;
    let mut sub = rt.executor.subscribe(256);

    let id = rt.executor.create(rt.shell_config())?.id;
    rt.executor.start(&id).await?;

    let started =
        wait_for_event(&mut sub, WAIT, status_into(&id, SessionState::Running, "started"))
            .await
            .ok_or_else(|| anyhow::anyhow!("no started event"))?;

    let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&started)?)?;
    assert_eq!(value["type"], "status_change");
    assert_eq!(value["session_id"], id.as_str());
    assert_eq!(value["data"]["old_state"], "idle");
    assert_eq!(value["data"]["new_state"], "running");
    assert!(value["timestamp"].is_string());

    rt.executor.kill(&id).await?;
    Ok(())
}

// -- input buffering under suspension -------------------------------------------

#[tokio::test]
async fn suspended_stdio_session_resumes_into_a_fresh_run() -> anyhow::Result<()> {
    let rt = TestRuntime::new(&[])?;
    let mut sub = rt.executor.subscribe(256);

    // An agent that stays alive until stdin closes.
    let id = rt.executor.create(rt.bash_agent_config("while read line; do :; done"))?.id;
    rt.executor.start(&id).await?;

    rt.executor.suspend(&id, "user paused").await?;
    assert_eq!(rt.executor.get(&id)?.state, SessionState::Suspended);
    let suspended =
        wait_for_event(&mut sub, WAIT, status_into(&id, SessionState::Suspended, "user paused"))
            .await;
    assert!(suspended.is_some());

    // Input while suspended is rejected: the session is not Running.
    assert!(rt.executor.send_input(&id, "queued\n").await.is_err());

    // Let the stopped provider's run settle so resume replaces it.
    tokio::time::sleep(Duration::from_millis(500)).await;
    rt.executor.resume(&id).await?;
    assert_eq!(rt.executor.get(&id)?.state, SessionState::Running);

    rt.executor.stop(&id, Duration::from_secs(5)).await?;
    assert_eq!(rt.executor.get(&id)?.state, SessionState::Idle);
    Ok(())
}
