use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::bus::stream::{EventStream, StreamEvent, StreamHandle, StreamOptions, StreamState};
use crate::bus::types::{AuditEntry, Message};
use crate::bus::{BusApi, HttpBusClient};
use crate::config::Config;
use crate::discovery::{self, LocalSession};
use crate::filter::RowFilter;
use crate::mailbox;
use crate::registry::{AgentRegistry, HeartbeatHandle};
use crate::router::{MessageRouter, WorkerSpawner};
use crate::security::SecurityPipeline;

/// Concurrent in-flight deliveries.
const DISPATCH_CONCURRENCY: usize = 32;
/// In-flight plus queued; beyond this, messages are dropped with an audit
/// entry rather than piling up behind a stuck worker.
const DISPATCH_MAX_PENDING: usize = DISPATCH_CONCURRENCY + 256;

const AGENT_CAPABILITIES: &[&str] = &["chat", "code"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

struct Inner {
    /// session id → session; an entry always carries a non-null agent id.
    sessions: HashMap<String, LocalSession>,
    /// agent id → heartbeat handle; exactly one per registered agent.
    heartbeats: HashMap<String, HeartbeatHandle>,
    /// Long-lived loops: signals, discovery poll, audit flush, JWT refresh,
    /// stream classifier.
    tasks: Vec<JoinHandle<()>>,
    stream: Option<StreamHandle>,
    token: Option<String>,
}

/// Wires discovery, registry, stream, filter, security, router, and mailbox
/// into one lifecycle.
pub struct Daemon {
    config: Config,
    /// Concrete client for the SSE subscription and the JWT header bag;
    /// absent in tests that drive the classifier directly.
    http: Option<Arc<HttpBusClient>>,
    registry: AgentRegistry,
    router: Arc<MessageRouter>,
    security: Option<Arc<SecurityPipeline>>,
    filter: Arc<RowFilter>,
    state_tx: watch::Sender<DaemonState>,
    dispatch_gate: Arc<Semaphore>,
    dispatch_pending: AtomicUsize,
    inner: Mutex<Inner>,
}

impl Daemon {
    pub fn new(
        config: Config,
        bus: Arc<dyn BusApi>,
        http: Option<Arc<HttpBusClient>>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Arc<Self> {
        let security = config
            .security
            .as_ref()
            .map(|cfg| Arc::new(SecurityPipeline::new(cfg, &config.machine_id, bus.clone())));
        let router = Arc::new(MessageRouter::new(
            bus.clone(),
            security.clone(),
            spawner,
            &config.machine_id,
        ));
        let filter = Arc::new(RowFilter::new(&config.machine_id));
        let (state_tx, _) = watch::channel(DaemonState::Stopped);

        Arc::new(Self {
            registry: AgentRegistry::new(bus),
            http,
            router,
            security,
            filter,
            state_tx,
            dispatch_gate: Arc::new(Semaphore::new(DISPATCH_CONCURRENCY)),
            dispatch_pending: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                heartbeats: HashMap::new(),
                tasks: Vec::new(),
                stream: None,
                token: None,
            }),
            config,
        })
    }

    pub fn state(&self) -> DaemonState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions (the status callback surface).
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: DaemonState) {
        if *self.state_tx.borrow() != next {
            tracing::info!(state = ?next, "daemon state");
            // send_replace: transitions must land even with no subscribers.
            self.state_tx.send_replace(next);
        }
    }

    /// Channel membership for the row filter; replaces the previous set.
    pub fn update_memberships(&self, channels: HashSet<String>) {
        self.filter.update_memberships(channels);
    }

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.state() != DaemonState::Stopped {
            return Ok(());
        }
        self.set_state(DaemonState::Starting);

        // Signals first, so an early interrupt still shuts down cleanly.
        self.spawn_signal_task().await;

        // Mint the daemon token and keep it fresh.
        if let Some(security) = &self.security {
            let capabilities: Vec<String> =
                AGENT_CAPABILITIES.iter().map(|c| c.to_string()).collect();
            let token = match security.tokens().create_token(&self.config.machine_id, &capabilities)
            {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "failed to mint startup token");
                    self.set_state(DaemonState::Error);
                    return Err(e);
                }
            };
            if let Some(http) = &self.http {
                http.set_header("X-Agent-Token", &token);
            }
            {
                let mut inner = self.inner.lock().await;
                inner.token = Some(token);
            }
            self.spawn_jwt_refresh_task().await;

            let flush = security.start_audit_flush();
            self.inner.lock().await.tasks.push(flush);
        }

        // First discovery cycle registers everything already alive.
        self.reconcile().await;

        // The stream's failure never blocks startup; it reconnects on its
        // own schedule.
        if let Some(http) = &self.http {
            let (handle, rx) = EventStream::new(
                http.clone(),
                &self.config.machine_id,
                StreamOptions::default(),
            )
            .spawn();
            let classifier = {
                let daemon = self.clone();
                tokio::spawn(async move {
                    let mut rx = rx;
                    while let Some(event) = rx.recv().await {
                        daemon.handle_stream_event(event).await;
                    }
                })
            };
            let mut inner = self.inner.lock().await;
            inner.stream = Some(handle);
            inner.tasks.push(classifier);
        }

        self.spawn_discovery_loop().await;

        self.set_state(DaemonState::Running);
        Ok(())
    }

    /// Graceful teardown; safe to call more than once.
    pub async fn stop(&self) {
        // Atomic claim of the Stopping transition; a concurrent stop
        // (signal task racing the caller) becomes a no-op.
        let claimed = self.state_tx.send_if_modified(|state| {
            if matches!(*state, DaemonState::Stopping | DaemonState::Stopped) {
                false
            } else {
                *state = DaemonState::Stopping;
                true
            }
        });
        if !claimed {
            return;
        }
        tracing::info!(state = ?DaemonState::Stopping, "daemon state");

        let (tasks, stream, agents) = {
            let mut inner = self.inner.lock().await;
            let tasks = std::mem::take(&mut inner.tasks);
            let stream = inner.stream.take();
            // Dropping the handles cancels every heartbeat loop.
            inner.heartbeats.clear();
            let agents: Vec<String> = inner
                .sessions
                .drain()
                .filter_map(|(_, s)| s.agent_id)
                .collect();
            inner.token = None;
            (tasks, stream, agents)
        };

        for task in tasks {
            task.abort();
        }
        if let Some(stream) = stream {
            stream.stop().await;
        }
        for agent_id in agents {
            self.registry.deregister(&agent_id).await;
        }
        if let Some(security) = &self.security {
            security.shutdown().await;
        }
        if let Some(http) = &self.http {
            http.remove_header("X-Agent-Token");
        }

        self.filter.update_session_ids(HashSet::new());
        self.filter.update_agent_ids(HashSet::new());
        self.set_state(DaemonState::Stopped);
    }

    /// Block until the daemon reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow() != DaemonState::Stopped {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    // -- long-lived loops ---------------------------------------------------

    async fn spawn_signal_task(self: &Arc<Self>) {
        let daemon = self.clone();
        let task = tokio::spawn(async move {
            let terminate = async {
                #[cfg(unix)]
                {
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(mut sig) => {
                            sig.recv().await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to install SIGTERM handler");
                            std::future::pending::<()>().await;
                        }
                    }
                }
                #[cfg(not(unix))]
                std::future::pending::<()>().await;
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, shutting down");
                }
                _ = terminate => {
                    tracing::info!("terminate received, shutting down");
                }
            }
            // Teardown runs detached: stop() aborts the task list, which
            // includes this listener.
            tokio::spawn(async move { daemon.stop().await });
        });
        self.inner.lock().await.tasks.push(task);
    }

    async fn spawn_jwt_refresh_task(self: &Arc<Self>) {
        let Some(security) = self.security.clone() else {
            return;
        };
        let rotation = self
            .config
            .security
            .as_ref()
            .map(|c| c.jwt.rotation_interval_ms)
            .unwrap_or(0);
        // Check at half the rotation interval so a due token is replaced
        // promptly.
        let period = std::time::Duration::from_millis((rotation / 2).max(1000));
        let daemon = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                daemon.refresh_token(&security).await;
            }
        });
        self.inner.lock().await.tasks.push(task);
    }

    /// Sole writer of the `X-Agent-Token` header.
    async fn refresh_token(&self, security: &SecurityPipeline) {
        let current = self.inner.lock().await.token.clone();
        let Some(current) = current else {
            return;
        };
        let replacement = match security.tokens().refresh_token(&current) {
            Some(token) => token,
            None => {
                // Current token went bad (revoked mid-flight); mint fresh.
                let capabilities: Vec<String> =
                    AGENT_CAPABILITIES.iter().map(|c| c.to_string()).collect();
                match security.tokens().create_token(&self.config.machine_id, &capabilities) {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to re-mint token");
                        return;
                    }
                }
            }
        };
        if replacement != current {
            tracing::info!("rotated agent token");
            if let Some(http) = &self.http {
                http.set_header("X-Agent-Token", &replacement);
            }
            self.inner.lock().await.token = Some(replacement);
        }
    }

    async fn spawn_discovery_loop(self: &Arc<Self>) {
        let daemon = self.clone();
        let period = self.config.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                daemon.reconcile().await;
                daemon.watchdog().await;
            }
        });
        self.inner.lock().await.tasks.push(task);
    }

    /// If the stream sits disconnected, shortcut its backoff. Kicking a
    /// connection attempt in flight would abort a healthy connect, so
    /// `Connecting` is left alone.
    async fn watchdog(&self) {
        let inner = self.inner.lock().await;
        if let Some(stream) = &inner.stream {
            match stream.state() {
                StreamState::Disconnected | StreamState::Reconnecting => {
                    tracing::debug!(
                        cursor = stream.cursor().as_deref().unwrap_or("-"),
                        "stream not connected, kicking"
                    );
                    stream.kick();
                }
                _ => {}
            }
        }
    }

    // -- discovery reconciliation -------------------------------------------

    /// One discovery cycle: register appeared sessions, drop vanished ones,
    /// and sync the filter's identity sets.
    async fn reconcile(&self) {
        let discovered =
            discovery::discover_sessions(&self.config.claude_dir, self.config.active_window);
        let discovered_ids: HashSet<String> =
            discovered.iter().map(|s| s.session_id.clone()).collect();

        let mut inner = self.inner.lock().await;

        for session in discovered {
            if inner.sessions.contains_key(&session.session_id) {
                continue;
            }
            let capabilities: Vec<String> =
                AGENT_CAPABILITIES.iter().map(|c| c.to_string()).collect();
            match self
                .registry
                .register(&self.config.machine_id, &session, capabilities)
                .await
            {
                Ok(agent) => {
                    let heartbeat = self
                        .registry
                        .start_heartbeat_loop(&agent.id, self.config.heartbeat_interval);
                    inner.heartbeats.insert(agent.id.clone(), heartbeat);
                    let mut session = session;
                    session.agent_id = Some(agent.id);
                    inner.sessions.insert(session.session_id.clone(), session);
                }
                Err(e) => {
                    // No dangling map entry on failure; retried next tick.
                    tracing::warn!(
                        session_id = %session.session_id,
                        error = %e,
                        "failed to register session"
                    );
                }
            }
        }

        let gone: Vec<String> = inner
            .sessions
            .keys()
            .filter(|id| !discovered_ids.contains(*id))
            .cloned()
            .collect();
        let mut departed_agents = Vec::new();
        for session_id in gone {
            if let Some(session) = inner.sessions.remove(&session_id) {
                if let Some(agent_id) = session.agent_id {
                    inner.heartbeats.remove(&agent_id);
                    departed_agents.push(agent_id);
                }
            }
        }

        self.filter
            .update_session_ids(inner.sessions.keys().cloned().collect());
        self.filter.update_agent_ids(
            inner
                .sessions
                .values()
                .filter_map(|s| s.agent_id.clone())
                .collect(),
        );
        drop(inner);

        for agent_id in departed_agents {
            self.registry.deregister(&agent_id).await;
        }
    }

    // -- incoming message classification ------------------------------------

    async fn handle_stream_event(self: &Arc<Self>, event: StreamEvent) {
        match event {
            StreamEvent::Insert(message) => self.classify(message).await,
            StreamEvent::Status(connected) => {
                tracing::info!(connected, "stream status changed");
            }
            StreamEvent::Error(e) => {
                tracing::warn!(error = %e, "stream error");
            }
        }
    }

    async fn classify(self: &Arc<Self>, message: Message) {
        if !self.filter.should_deliver(&message) {
            tracing::debug!(message_id = %message.id, "filtered out");
            return;
        }

        match message.delivery_mode() {
            Some("broadcast") => {
                // Memos are read via REST on demand, never pushed.
                tracing::debug!(message_id = %message.id, "broadcast memo, discarding");
            }
            Some("pull") => self.store_in_mailbox(&message).await,
            _ => self.dispatch(message).await,
        }
    }

    async fn store_in_mailbox(&self, message: &Message) {
        let agent_id = {
            let inner = self.inner.lock().await;
            let mut sessions: Vec<&LocalSession> = inner.sessions.values().collect();
            sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            sessions
                .iter()
                .find(|s| message.target_address.contains(&s.session_id))
                .or_else(|| sessions.first())
                .and_then(|s| s.agent_id.clone())
        };
        let Some(agent_id) = agent_id else {
            tracing::warn!(message_id = %message.id, "no agent for pull message, dropping");
            return;
        };
        match mailbox::append(&self.config.claude_dir, &agent_id, message) {
            Ok(path) => {
                tracing::info!(message_id = %message.id, path = %path.display(), "mailboxed")
            }
            Err(e) => tracing::warn!(message_id = %message.id, error = %e, "mailbox write failed"),
        }
    }

    /// Fire-and-forget handoff to the router; the stream consumer is never
    /// blocked by a slow worker.
    async fn dispatch(self: &Arc<Self>, message: Message) {
        let pending = self.dispatch_pending.fetch_add(1, Ordering::SeqCst);
        if pending >= DISPATCH_MAX_PENDING {
            self.dispatch_pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(message_id = %message.id, pending, "dispatch queue full, dropping");
            if let Some(security) = &self.security {
                security
                    .audit(AuditEntry::blocked(
                        &message.sender_id,
                        "message",
                        "dispatch_queue_full",
                    ))
                    .await;
            }
            return;
        }

        let sessions: Vec<LocalSession> =
            self.inner.lock().await.sessions.values().cloned().collect();
        let daemon = self.clone();
        tokio::spawn(async move {
            let _permit = match daemon.dispatch_gate.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let outcome = daemon.router.route(&message, &sessions).await;
            daemon.dispatch_pending.fetch_sub(1, Ordering::SeqCst);
            if outcome.ok {
                tracing::info!(message_id = %outcome.message_id, "delivered");
            } else {
                tracing::warn!(
                    message_id = %outcome.message_id,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "delivery failed"
                );
            }
        });
    }

    #[cfg(test)]
    async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    #[cfg(test)]
    async fn heartbeat_handle_count(&self) -> usize {
        self.inner.lock().await.heartbeats.len()
    }
}
