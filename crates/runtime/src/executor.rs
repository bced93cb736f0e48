// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session executor: owns the map of live sessions, drives lifecycles,
//! pumps provider events into session state, persistence, and the
//! broadcaster, and applies the per-session circuit breaker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::broadcast::{EventBroadcaster, Subscription};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventPayload};
use crate::input::InputBuffer;
use crate::persist::SessionStore;
use crate::provider::{Provider, ProviderFactory, ProviderSettings};
use crate::registry::CommandRegistry;
use crate::run::Run;
use crate::session::{Session, SessionConfig, SessionSnapshot, SessionState};

/// Bound on how long a kill escalation waits for the event pump.
const KILL_GRACE: Duration = Duration::from_secs(2);

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    run: Option<Arc<Run>>,
    input: Option<Arc<InputBuffer>>,
    breaker: Arc<CircuitBreaker>,
}

/// The agent session runtime.
///
/// Lock order is fixed: the session map first, then a session's own
/// lock. Neither is ever held across a provider, subscriber-channel, or
/// persistence call that can block.
pub struct Executor {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    store: SessionStore,
    broadcaster: Arc<EventBroadcaster>,
    factory: ProviderFactory,
    config: Config,
    shutdown: CancellationToken,
    accepting: AtomicBool,
}

impl Executor {
    /// Build an executor over the given registry. The registry is an
    /// explicit startup value so tests stay deterministic.
    pub fn new(config: Config, registry: CommandRegistry) -> Result<Self> {
        let store = SessionStore::new(&config.data_dir)?;
        let settings = ProviderSettings {
            max_line_bytes: config.max_line_bytes,
            handshake_timeout: config.handshake_timeout(),
            channel_capacity: 256,
        };
        let factory = ProviderFactory::with_defaults(Arc::new(registry), settings);
        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            broadcaster: Arc::new(EventBroadcaster::new()),
            factory,
            config,
            shutdown: CancellationToken::new(),
            accepting: AtomicBool::new(true),
        })
    }

    /// Register an additional provider kind. Intended for embedders and
    /// tests; call before the executor is shared.
    pub fn register_provider(
        &mut self,
        kind: impl Into<String>,
        ctor: impl Fn() -> Box<dyn Provider> + Send + Sync + 'static,
    ) {
        self.factory.register(kind, ctor);
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Subscribe to the event stream of every session.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        self.broadcaster.subscribe(capacity)
    }

    /// Allocate and persist a new session. Does not start a run.
    pub fn create(&self, config: SessionConfig) -> Result<SessionSnapshot> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        if !self.factory.contains(&config.provider) {
            return Err(Error::ProviderStart(format!(
                "unknown provider kind: {}",
                config.provider
            )));
        }

        let id = Uuid::new_v4().to_string();
        let provider = config.provider.clone();
        let session = Session::new(&id, config, self.config.output_cap);
        let snapshot = session.snapshot();
        self.store.save_session(&snapshot)?;

        let entry = SessionEntry {
            session: Arc::new(Mutex::new(session)),
            run: None,
            input: None,
            breaker: Arc::new(CircuitBreaker::new(
                self.config.breaker_threshold,
                self.config.breaker_cooldown(),
            )),
        };
        self.sessions.lock().insert(id.clone(), entry);

        info!(session = %id, %provider, "session created");
        Ok(snapshot)
    }

    /// Restore persisted sessions into the map. Sessions that were
    /// Running or Suspended when the process died are reconciled to
    /// Idle — their runs did not survive.
    pub fn recover(&self) -> Result<usize> {
        let snapshots = self.store.list_sessions()?;
        let mut recovered = 0;

        for snapshot in snapshots {
            if self.sessions.lock().contains_key(&snapshot.id) {
                continue;
            }
            let id = snapshot.id.clone();
            let mut session = Session::from_snapshot(snapshot, self.config.output_cap);
            if session.state() != SessionState::Idle {
                if let Ok(transition) = session.transition_to(SessionState::Idle, "recovered") {
                    debug!(session = %id, from = %transition.from, "reconciled stale session");
                }
                self.store.save_session(&session.snapshot())?;
            }
            let entry = SessionEntry {
                session: Arc::new(Mutex::new(session)),
                run: None,
                input: None,
                breaker: Arc::new(CircuitBreaker::new(
                    self.config.breaker_threshold,
                    self.config.breaker_cooldown(),
                )),
            };
            self.sessions.lock().insert(id, entry);
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Start a run for an idle session.
    pub async fn start(&self, id: &str) -> Result<()> {
        let (session, run, _, breaker) = self.entry_parts(id)?;

        if breaker.is_in_cooldown() {
            return Err(Error::BreakerOpen { retry_in: breaker.cooldown_remaining() });
        }
        if let Some(run) = run {
            if !run.is_terminal() {
                let from = session.lock().state();
                return Err(Error::InvalidTransition { from, to: SessionState::Running });
            }
        }

        // Reserve the session before touching the provider.
        let (transition, snapshot) = {
            let mut session = session.lock();
            if session.state() != SessionState::Idle {
                return Err(Error::InvalidTransition {
                    from: session.state(),
                    to: SessionState::Running,
                });
            }
            let transition = session.transition_to(SessionState::Running, "started")?;
            (transition, session.snapshot())
        };
        self.persist_and_announce(id, &snapshot, &transition);

        if let Err(e) = self.spawn_run(id).await {
            self.rollback_failed_start(id, &session, &breaker);
            return Err(e);
        }
        Ok(())
    }

    /// Deliver input to a running session through its input buffer.
    pub async fn send_input(&self, id: &str, text: &str) -> Result<()> {
        let (session, run, input, _) = self.entry_parts(id)?;
        {
            let session = session.lock();
            if session.state() != SessionState::Running {
                let from = session.state();
                return Err(Error::InvalidTransition { from, to: from });
            }
        }
        let (Some(run), Some(input)) = (run, input) else {
            return Err(Error::ProviderIo("session has no active run".to_owned()));
        };
        input.send(run.cancel_token(), text.to_owned()).await
    }

    /// Suspend a running session: pause input, stop the provider
    /// best-effort, keep the session resumable.
    pub async fn suspend(&self, id: &str, reason: &str) -> Result<()> {
        let (session, run, input, _) = self.entry_parts(id)?;

        {
            let session = session.lock();
            if session.state() != SessionState::Running {
                return Err(Error::InvalidTransition {
                    from: session.state(),
                    to: SessionState::Suspended,
                });
            }
        }
        let Some(run) = run else {
            return Err(Error::ProviderIo("session has no active run".to_owned()));
        };
        if !run.provider().supports_suspend() {
            return Err(Error::NotSupported {
                provider: run.provider().kind().to_owned(),
                operation: "suspend",
            });
        }

        let (transition, snapshot) = {
            let mut session = session.lock();
            let transition = session.transition_to(SessionState::Suspended, reason)?;
            (transition, session.snapshot())
        };
        self.persist_and_announce(id, &snapshot, &transition);

        if let Some(input) = input {
            input.pause();
        }
        run.set_stop_reason("suspended");
        if let Err(e) = run.provider().stop(run.cancel_token()).await {
            warn!(session = %id, error = %e, "provider stop during suspend failed");
        }
        Ok(())
    }

    /// Resume a suspended session, starting a fresh run if the previous
    /// one already terminated.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let (session, run, input, breaker) = self.entry_parts(id)?;

        let (transition, snapshot) = {
            let mut session = session.lock();
            if session.state() != SessionState::Suspended {
                return Err(Error::InvalidTransition {
                    from: session.state(),
                    to: SessionState::Running,
                });
            }
            let transition = session.transition_to(SessionState::Running, "resumed")?;
            (transition, session.snapshot())
        };
        self.persist_and_announce(id, &snapshot, &transition);

        let live = run.as_ref().is_some_and(|r| !r.is_terminal());
        if live {
            if let Some(input) = input {
                input.resume();
            }
            return Ok(());
        }

        if let Err(e) = self.spawn_run(id).await {
            self.rollback_failed_start(id, &session, &breaker);
            return Err(e);
        }
        Ok(())
    }

    /// Graceful stop with a deadline, escalating to kill past it.
    /// Idempotent on sessions without a live run.
    pub async fn stop(&self, id: &str, deadline: Duration) -> Result<()> {
        let (session, run, _, _) = self.entry_parts(id)?;

        if let Some(run) = run {
            if !run.is_drained() {
                run.set_stop_reason("stopped");
                if let Err(e) = run.provider().stop(run.cancel_token()).await {
                    warn!(session = %id, error = %e, "provider stop failed");
                }
                tokio::select! {
                    _ = run.wait_drained() => {}
                    _ = tokio::time::sleep(deadline) => {
                        warn!(session = %id, "stop deadline passed, escalating to kill");
                        run.cancel_token().cancel();
                        let _ = run.provider().kill();
                        tokio::select! {
                            _ = run.wait_drained() => {}
                            _ = tokio::time::sleep(KILL_GRACE) => {
                                warn!(session = %id, "event pump did not drain after kill");
                            }
                        }
                    }
                }
            }
        }

        self.settle_to_idle(id, &session, "stopped");
        Ok(())
    }

    /// Immediate termination. Idempotent.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let (session, run, _, _) = self.entry_parts(id)?;

        if let Some(run) = run {
            if !run.is_drained() {
                run.set_stop_reason("killed");
                run.cancel_token().cancel();
                run.provider().kill()?;
                tokio::select! {
                    _ = run.wait_drained() => {}
                    _ = tokio::time::sleep(KILL_GRACE) => {
                        warn!(session = %id, "event pump did not drain after kill");
                    }
                }
            }
        }

        self.settle_to_idle(id, &session, "killed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<SessionSnapshot> {
        let (session, _, _, _) = self.entry_parts(id)?;
        let snapshot = session.lock().snapshot();
        Ok(snapshot)
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Mutex<Session>>> =
            self.sessions.lock().values().map(|e| Arc::clone(&e.session)).collect();
        let mut snapshots: Vec<SessionSnapshot> =
            sessions.iter().map(|s| s.lock().snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Destroy a session whose run is terminal, removing it from the map
    /// and from durable storage.
    pub fn remove(&self, id: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.lock();
            let entry = sessions.get(id).ok_or_else(|| Error::NotFound(id.to_owned()))?;
            if entry.run.as_ref().is_some_and(|r| !r.is_terminal()) {
                let from = entry.session.lock().state();
                return Err(Error::InvalidTransition { from, to: SessionState::Idle });
            }
            sessions.remove(id);
        }
        self.store.delete_session(id)?;
        info!(session = %id, "session removed");
        Ok(())
    }

    /// Ordered teardown: refuse new work, stop every session within the
    /// deadline, kill stragglers, close the broadcaster.
    pub async fn shutdown(&self, deadline: Duration) {
        self.accepting.store(false, Ordering::Release);
        info!("executor shutting down");

        let entries: Vec<(String, Arc<Run>)> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter_map(|(id, e)| {
                    e.run.as_ref().filter(|r| !r.is_drained()).map(|r| (id.clone(), Arc::clone(r)))
                })
                .collect()
        };

        let stops = entries.iter().map(|(id, run)| async move {
            run.set_stop_reason("stopped");
            if let Err(e) = run.provider().stop(run.cancel_token()).await {
                debug!(session = %id, error = %e, "provider stop during shutdown failed");
            }
        });
        futures_util::future::join_all(stops).await;

        let drains = entries.iter().map(|(_, run)| run.wait_drained());
        let all_drained = futures_util::future::join_all(drains);
        tokio::select! {
            _ = all_drained => {}
            _ = tokio::time::sleep(deadline) => {
                for (id, run) in entries.iter().filter(|(_, r)| !r.is_drained()) {
                    warn!(session = %id, "shutdown deadline passed, killing run");
                    run.cancel_token().cancel();
                    let _ = run.provider().kill();
                }
                let drains = entries.iter().map(|(_, run)| run.wait_drained());
                tokio::select! {
                    _ = futures_util::future::join_all(drains) => {}
                    _ = tokio::time::sleep(KILL_GRACE) => {
                        warn!("some event pumps did not drain before shutdown");
                    }
                }
            }
        }

        self.shutdown.cancel();
        self.broadcaster.close();
        info!("executor shut down");
    }

    // -- internals ----------------------------------------------------------

    #[allow(clippy::type_complexity)]
    fn entry_parts(
        &self,
        id: &str,
    ) -> Result<(
        Arc<Mutex<Session>>,
        Option<Arc<Run>>,
        Option<Arc<InputBuffer>>,
        Arc<CircuitBreaker>,
    )> {
        let sessions = self.sessions.lock();
        let entry = sessions.get(id).ok_or_else(|| Error::NotFound(id.to_owned()))?;
        Ok((
            Arc::clone(&entry.session),
            entry.run.as_ref().map(Arc::clone),
            entry.input.as_ref().map(Arc::clone),
            Arc::clone(&entry.breaker),
        ))
    }

    /// Construct, start, and wire up a provider for a session already in
    /// Running state.
    async fn spawn_run(&self, id: &str) -> Result<()> {
        let (session, _, _, breaker) = self.entry_parts(id)?;
        let config = session.lock().config().clone();

        let mut provider = self.factory.build(&config.provider)?;
        let run_cancel = self.shutdown.child_token();
        provider.start(&run_cancel, &config).await?;
        let events = provider
            .take_events()
            .ok_or_else(|| Error::ProviderStart("provider yielded no event stream".to_owned()))?;
        let provider: Arc<dyn Provider> = Arc::from(provider);

        let run = Arc::new(Run::new(Arc::clone(&provider), run_cancel.clone()));
        let input = Arc::new(InputBuffer::new(
            self.config.input_capacity,
            self.config.input_overflow_cap,
        ));
        let Some(input_rx) = input.take_receiver() else {
            return Err(Error::ProviderStart("input buffer already consumed".to_owned()));
        };

        {
            let mut sessions = self.sessions.lock();
            let entry =
                sessions.get_mut(id).ok_or_else(|| Error::NotFound(id.to_owned()))?;
            entry.run = Some(Arc::clone(&run));
            entry.input = Some(Arc::clone(&input));
        }

        self.spawn_input_pump(id.to_owned(), Arc::clone(&provider), run_cancel, input_rx);

        let ctx = PumpContext {
            id: id.to_owned(),
            session,
            store: self.store.clone(),
            broadcaster: Arc::clone(&self.broadcaster),
            run: Arc::clone(&run),
            breaker,
            input,
            output_cap: self.config.output_cap,
        };
        let watchdog = ctx.watchdog_handles();
        let pump = tokio::spawn(event_pump(ctx, events));

        // Task-boundary failure isolation: a panicking pump still
        // terminalizes the run and closes out its session.
        tokio::spawn(async move {
            let Err(join_err) = pump.await else { return };
            let (id, session, store, broadcaster, run, input) = watchdog;
            error!(session = %id, error = %join_err, "event pump aborted");
            let message = format!("event pump aborted: {join_err}");
            {
                let mut session = session.lock();
                session.record_error(&message);
                let _ = session.transition_to(SessionState::Idle, "failed");
            }
            let snapshot = session.lock().snapshot();
            if let Err(e) = store.save_session(&snapshot) {
                warn!(session = %id, error = %e, "failed to persist after pump abort");
            }
            broadcaster.broadcast(&Event::fatal(&id, message.clone()));
            run.finish_failed(message);
            input.close();
            run.mark_drained();
        });

        info!(session = %id, provider = %config.provider, "run started");
        Ok(())
    }

    /// Drain the input buffer into the provider until either side closes.
    fn spawn_input_pump(
        &self,
        id: String,
        provider: Arc<dyn Provider>,
        cancel: CancellationToken,
        mut input_rx: mpsc::Receiver<String>,
    ) {
        tokio::spawn(async move {
            while let Some(text) = input_rx.recv().await {
                if let Err(e) = provider.send_input(&cancel, &text).await {
                    if !matches!(e, Error::Cancelled) {
                        warn!(session = %id, error = %e, "input delivery failed");
                    }
                    break;
                }
            }
        });
    }

    /// Roll a session that failed to start its run back to Idle and feed
    /// the circuit breaker.
    fn rollback_failed_start(
        &self,
        id: &str,
        session: &Arc<Mutex<Session>>,
        breaker: &CircuitBreaker,
    ) {
        let rolled_back = {
            let mut session = session.lock();
            session.transition_to(SessionState::Idle, "start_failed").ok().map(|t| {
                (t, session.snapshot())
            })
        };
        if let Some((transition, snapshot)) = rolled_back {
            self.persist_and_announce(id, &snapshot, &transition);
        }
        if breaker.record_failure() {
            warn!(session = %id, "circuit breaker tripped");
        }
    }

    /// Bring a session that is no longer Running (suspended, or its pump
    /// already settled) to Idle, if it isn't there yet.
    fn settle_to_idle(&self, id: &str, session: &Arc<Mutex<Session>>, reason: &str) {
        let settled = {
            let mut session = session.lock();
            if session.state() == SessionState::Idle {
                None
            } else {
                session
                    .transition_to(SessionState::Idle, reason)
                    .ok()
                    .map(|t| (t, session.snapshot()))
            }
        };
        if let Some((transition, snapshot)) = settled {
            self.persist_and_announce(id, &snapshot, &transition);
        }
    }

    /// Persist a snapshot and broadcast the transition that produced it.
    /// State is durable before any subscriber observes the change.
    fn persist_and_announce(
        &self,
        id: &str,
        snapshot: &SessionSnapshot,
        transition: &crate::session::Transition,
    ) {
        if let Err(e) = self.store.save_session(snapshot) {
            warn!(session = %id, error = %e, "failed to persist session");
        }
        let event = Event::status_change(
            id,
            transition.from,
            transition.to,
            Some(transition.reason.clone()),
        );
        if let Err(e) = self.store.append_activity(id, &event) {
            warn!(session = %id, error = %e, "failed to append activity");
        }
        self.broadcaster.broadcast(&event);
    }
}

/// Everything the per-run event pump needs.
struct PumpContext {
    id: String,
    session: Arc<Mutex<Session>>,
    store: SessionStore,
    broadcaster: Arc<EventBroadcaster>,
    run: Arc<Run>,
    breaker: Arc<CircuitBreaker>,
    input: Arc<InputBuffer>,
    output_cap: usize,
}

impl PumpContext {
    /// Clones the watchdog needs if the pump task dies.
    #[allow(clippy::type_complexity)]
    fn watchdog_handles(
        &self,
    ) -> (String, Arc<Mutex<Session>>, SessionStore, Arc<EventBroadcaster>, Arc<Run>, Arc<InputBuffer>)
    {
        (
            self.id.clone(),
            Arc::clone(&self.session),
            self.store.clone(),
            Arc::clone(&self.broadcaster),
            Arc::clone(&self.run),
            Arc::clone(&self.input),
        )
    }

    fn persist(&self) {
        let snapshot = self.session.lock().snapshot();
        if let Err(e) = self.store.save_session(&snapshot) {
            warn!(session = %self.id, error = %e, "failed to persist session");
        }
    }
}

/// One pump per run: consume the provider stream, fold events into the
/// session, persist material changes, log activity, broadcast.
///
/// The pump closes no external resources itself — teardown runs through
/// the run's cancellation scope; the pump only reports that it drained.
async fn event_pump(ctx: PumpContext, mut events: mpsc::Receiver<Event>) {
    ctx.run.set_active();
    let mut fatal: Option<String> = None;
    let mut output_dirty = false;

    while let Some(mut event) = events.recv().await {
        if event.session_id.is_empty() {
            event.session_id = ctx.id.clone();
        }

        // Minimal normalisation: clip oversized output payloads.
        if let EventPayload::Output { content } = &mut event.payload {
            if content.len() > ctx.output_cap {
                let mut cut = ctx.output_cap;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
        }

        // State accumulation is synchronous with event arrival; only
        // output persistence is batched.
        let material = match &event.payload {
            EventPayload::Output { content } => {
                ctx.session.lock().append_output(content);
                output_dirty = true;
                false
            }
            EventPayload::StatusChange { new_state, reason, .. } => {
                let applied = {
                    let mut session = ctx.session.lock();
                    session.transition_to(*new_state, reason.clone().unwrap_or_default())
                };
                match applied {
                    Ok(transition) => {
                        // Rewrite the provider's claimed old state with the
                        // transition that actually applied.
                        event.payload = EventPayload::StatusChange {
                            old_state: transition.from,
                            new_state: transition.to,
                            reason: reason.clone(),
                        };
                        true
                    }
                    Err(e) => {
                        warn!(session = %ctx.id, error = %e, "discarding invalid provider transition");
                        continue;
                    }
                }
            }
            EventPayload::Error { message, .. } => {
                ctx.session.lock().record_error(message);
                if event.is_fatal() {
                    fatal = Some(message.clone());
                }
                true
            }
            EventPayload::Metric { tokens_in, tokens_out, request_count } => {
                ctx.session.lock().add_metrics(*tokens_in, *tokens_out, *request_count);
                true
            }
            EventPayload::Metadata { key, value } => {
                if key == "task" {
                    if let Some(task) = value.as_str() {
                        ctx.session.lock().set_task(task);
                    }
                    true
                } else {
                    false
                }
            }
        };

        // Output rides along with the next materially visible change
        // instead of forcing one snapshot write per chunk.
        if material {
            ctx.persist();
            output_dirty = false;
        }
        if let Err(e) = ctx.store.append_activity(&ctx.id, &event) {
            warn!(session = %ctx.id, error = %e, "failed to append activity");
        }
        ctx.broadcaster.broadcast(&event);
    }

    if output_dirty {
        ctx.persist();
    }

    // Stream closed: settle the run and mirror the outcome into the
    // session. A suspended session stays suspended — its run ended
    // because suspend stopped the provider.
    let reason = match (&fatal, ctx.run.stop_reason()) {
        (Some(_), _) => "failed".to_owned(),
        (None, Some(reason)) => reason,
        (None, None) => "completed".to_owned(),
    };
    let settled = {
        let mut session = ctx.session.lock();
        if session.state() == SessionState::Running {
            session.transition_to(SessionState::Idle, reason).ok().map(|t| (t, session.snapshot()))
        } else {
            None
        }
    };
    if let Some((transition, snapshot)) = settled {
        if let Err(e) = ctx.store.save_session(&snapshot) {
            warn!(session = %ctx.id, error = %e, "failed to persist session");
        }
        let event = Event::status_change(
            &ctx.id,
            transition.from,
            transition.to,
            Some(transition.reason.clone()),
        );
        if let Err(e) = ctx.store.append_activity(&ctx.id, &event) {
            warn!(session = %ctx.id, error = %e, "failed to append activity");
        }
        ctx.broadcaster.broadcast(&event);
    }

    match fatal {
        Some(message) => {
            ctx.run.finish_failed(message);
            if ctx.breaker.record_failure() {
                warn!(session = %ctx.id, "circuit breaker tripped");
            }
        }
        None => ctx.run.finish_done(),
    }

    ctx.input.close();
    ctx.run.mark_drained();
    debug!(session = %ctx.id, "event pump drained");
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
