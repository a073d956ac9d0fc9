//! Session Controller
//!
//! The state machine behind a VPN session. One tokio task owns all
//! session state; control calls and engine reports are queued on the same
//! channel and handled strictly in arrival order, so no lock ever guards
//! the session.
//!
//! ```text
//!  Idle/Disconnected/Error ──connect──▶ Connecting ──auth──▶ Authenticating
//!                                          │                     │
//!                                          └──────connected──────┴──▶ Connected
//!  Connecting/Authenticating/Connected ──error──▶ Error
//!  Connected ──disconnect──▶ Disconnecting ──disconnected──▶ Disconnected
//!  any ──dispose──▶ Idle
//! ```

use crate::config::SessionConfig;
use crate::engine::{
    EngineContext, EngineError, EngineEvent, EngineEventSender, EngineKind, EngineStatus,
    TunnelEngine,
};
use crate::error::SessionError;
use crate::profile::{self, ConnectRequest, ServerInfo};
use crate::stats::StatsCounter;
use crate::status::{ConnectionStats, SessionState, StatusSink, StatusSnapshot};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Everything the session actor can be asked to do
pub(crate) enum SessionCommand {
    Connect {
        request: ConnectRequest,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Stats {
        reply: oneshot::Sender<Option<ConnectionStats>>,
    },
    Snapshot {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Subscribe {
        sink: Box<dyn StatusSink>,
    },
    Unsubscribe,
    /// Status report from the engine running `attempt`
    Engine {
        attempt: u64,
        event: EngineEvent,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// What woke the actor up
enum Step {
    Command(SessionCommand),
    Poll,
    TeardownTimeout,
    Closed,
}

/// Session state, owned by the actor task
struct Session {
    config: SessionConfig,
    engines: Vec<Box<dyn TunnelEngine>>,
    /// Index into `engines` for the current attempt
    active: Option<usize>,
    commands: mpsc::WeakUnboundedSender<SessionCommand>,
    counters: Arc<StatsCounter>,
    sink: Option<Box<dyn StatusSink>>,

    state: SessionState,
    server: Option<ServerInfo>,
    local_address: Option<String>,
    connected_at: Option<Instant>,
    connected_at_ms: Option<u64>,
    last_message: String,
    last_error: Option<String>,

    attempt: u64,
    live_attempt: Option<u64>,
    poll: Option<Interval>,
    teardown_deadline: Option<Instant>,
}

impl Session {
    fn new(
        config: SessionConfig,
        engines: Vec<Box<dyn TunnelEngine>>,
        commands: mpsc::WeakUnboundedSender<SessionCommand>,
        counters: Arc<StatsCounter>,
    ) -> Self {
        Self {
            config,
            engines,
            active: None,
            commands,
            counters,
            sink: None,
            state: SessionState::Idle,
            server: None,
            local_address: None,
            connected_at: None,
            connected_at_ms: None,
            last_message: String::new(),
            last_error: None,
            attempt: 0,
            live_attempt: None,
            poll: None,
            teardown_deadline: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        debug!("Session actor started");

        loop {
            let step = tokio::select! {
                biased;
                cmd = rx.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => Step::Closed,
                },
                _ = next_tick(&mut self.poll) => Step::Poll,
                _ = deadline(self.teardown_deadline) => Step::TeardownTimeout,
            };

            match step {
                Step::Command(SessionCommand::Dispose { reply }) => {
                    self.dispose();
                    let _ = reply.send(());
                    break;
                }
                Step::Command(cmd) => self.handle(cmd),
                Step::Poll => self.poll_stats(),
                Step::TeardownTimeout => self.teardown_timed_out(),
                Step::Closed => {
                    self.dispose();
                    break;
                }
            }
        }

        debug!("Session actor stopped");
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect { request, reply } => {
                let _ = reply.send(self.connect(request));
            }
            SessionCommand::Disconnect { reply } => {
                let _ = reply.send(self.disconnect());
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.connection_stats());
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Subscribe { sink } => {
                if self.sink.replace(sink).is_some() {
                    debug!("Previous status subscriber detached");
                }
            }
            SessionCommand::Unsubscribe => {
                self.sink = None;
            }
            SessionCommand::Engine { attempt, event } => self.engine_event(attempt, event),
            SessionCommand::Dispose { .. } => {}
        }
    }

    fn connect(&mut self, request: ConnectRequest) -> Result<(), SessionError> {
        if !self.state.accepts_connect() {
            warn!("Connect rejected: session is {}", self.state);
            return Err(SessionError::AlreadyActive);
        }
        request.validate()?;

        let index = self.select_engine()?;
        let events = self
            .commands
            .upgrade()
            .ok_or_else(|| SessionError::InternalFault("session queue closed".into()))?;

        self.attempt += 1;
        let attempt = self.attempt;
        let server = profile::parse_with_default_port(&request.profile, self.config.default_port);
        let display_name = request
            .display_name
            .clone()
            .unwrap_or_else(|| self.config.session_name.clone());

        info!(
            "Connect attempt {} to {} via {} engine",
            attempt,
            server,
            self.engines[index].kind()
        );

        let ctx = EngineContext {
            events: EngineEventSender::new(attempt, events),
            counters: self.counters.clone(),
            server: server.clone(),
            display_name,
        };

        self.counters.reset();
        self.last_error = None;
        self.local_address = None;
        self.server = Some(server);
        self.active = Some(index);
        self.live_attempt = Some(attempt);
        self.transition(SessionState::Connecting, "Establishing VPN connection...");

        if let Err(e) = self.engines[index].connect(&request, ctx) {
            error!("Engine failed to start: {}", e);
            self.live_attempt = None;
            self.active = None;
            self.enter_error(format!("Failed to start VPN: {}", e));
            return Err(e.into());
        }
        Ok(())
    }

    /// First available engine in configured order
    fn select_engine(&self) -> Result<usize, SessionError> {
        for kind in &self.config.engine_order {
            let Some(index) = self.engines.iter().position(|e| e.kind() == *kind) else {
                continue;
            };
            if self.engines[index].availability() {
                return Ok(index);
            }
            debug!("{} engine not available", kind);
        }

        warn!("No tunnel engine available");
        Err(SessionError::EngineUnavailable)
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle | SessionState::Disconnected | SessionState::Disconnecting => {
                debug!("Disconnect ignored: session is {}", self.state);
            }
            SessionState::Error => {
                self.finish_disconnect("Disconnected");
            }
            SessionState::Connecting | SessionState::Authenticating | SessionState::Connected => {
                self.poll = None;
                self.connected_at = None;
                self.connected_at_ms = None;
                self.transition(SessionState::Disconnecting, "Disconnecting...");

                let result = match self.active {
                    Some(index) => self.engines[index].disconnect(),
                    None => Err(EngineError::NotConnected),
                };

                match result {
                    Ok(()) => {
                        let timeout = self.config.teardown_timeout();
                        self.teardown_deadline = Some(Instant::now() + timeout);
                    }
                    Err(e) => {
                        warn!("Engine teardown failed: {}", e);
                        self.finish_disconnect(format!(
                            "Disconnected (engine teardown failed: {})",
                            e
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn engine_event(&mut self, attempt: u64, event: EngineEvent) {
        if self.live_attempt != Some(attempt) {
            debug!("Discarding '{}' from stale attempt {}", event.status, attempt);
            return;
        }

        let EngineEvent { status, message } = event;
        debug!("Engine reported {}: {}", status, message);

        match (self.state, status) {
            (SessionState::Connecting, EngineStatus::Authenticating) => {
                self.transition(SessionState::Authenticating, message);
            }
            (SessionState::Connecting | SessionState::Authenticating, EngineStatus::Connected) => {
                self.enter_connected(message);
            }
            (state, EngineStatus::Error) if state.is_active() => {
                self.enter_error(message);
            }
            (state, EngineStatus::Disconnected) if state.is_active() => {
                info!("Tunnel closed by engine");
                self.finish_disconnect(message);
            }
            (SessionState::Disconnecting, EngineStatus::Disconnected) => {
                self.finish_disconnect(message);
            }
            (SessionState::Disconnecting, EngineStatus::Error) => {
                warn!("Engine error during teardown: {}", message);
                self.finish_disconnect(format!("Disconnected ({})", message));
            }
            (state, _) if state.is_active() => self.progress(message),
            (state, status) => {
                debug!("Ignoring '{}' while {}", status, state);
            }
        }
    }

    fn enter_connected(&mut self, message: String) {
        self.connected_at = Some(Instant::now());
        self.connected_at_ms = Some(epoch_millis());
        self.counters.reset();
        self.refresh_from_engine();

        let period = self.config.poll_interval();
        let mut poll = tokio::time::interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll = Some(poll);

        self.transition(SessionState::Connected, message);
    }

    fn enter_error(&mut self, message: String) {
        self.poll = None;
        self.connected_at = None;
        self.connected_at_ms = None;
        self.live_attempt = None;

        if let Some(index) = self.active.take() {
            if let Err(e) = self.engines[index].disconnect() {
                debug!("Engine cleanup after error: {}", e);
            }
        }

        warn!("VPN error: {}", message);
        self.last_error = Some(message.clone());
        self.transition(SessionState::Error, message);
    }

    fn finish_disconnect(&mut self, message: impl Into<String>) {
        self.poll = None;
        self.teardown_deadline = None;
        self.live_attempt = None;
        self.active = None;
        self.counters.reset();
        self.server = None;
        self.local_address = None;
        self.connected_at = None;
        self.connected_at_ms = None;
        self.last_error = None;
        self.transition(SessionState::Disconnected, message);
    }

    fn teardown_timed_out(&mut self) {
        self.teardown_deadline = None;
        if self.state != SessionState::Disconnecting {
            return;
        }

        warn!(
            "Engine did not confirm teardown within {}ms",
            self.config.teardown_timeout_ms
        );
        self.finish_disconnect("Disconnected (engine did not confirm teardown)");
    }

    fn poll_stats(&mut self) {
        if self.state != SessionState::Connected {
            self.poll = None;
            return;
        }
        self.refresh_from_engine();
        self.emit();
    }

    /// Pull counters and addresses the engine keeps itself
    fn refresh_from_engine(&mut self) {
        let Some(stats) = self.active.and_then(|i| self.engines[i].current_stats()) else {
            return;
        };

        self.counters.observe_totals(stats.bytes_in, stats.bytes_out);
        if stats.local_address.is_some() {
            self.local_address = stats.local_address;
        }
    }

    fn connection_stats(&mut self) -> Option<ConnectionStats> {
        if self.state != SessionState::Connected {
            return None;
        }
        self.refresh_from_engine();

        Some(ConnectionStats {
            bytes_in: self.counters.bytes_in(),
            bytes_out: self.counters.bytes_out(),
            duration_seconds: StatsCounter::elapsed_seconds(self.connected_at),
            server_ip: self
                .server
                .as_ref()
                .map(|s| s.host.clone())
                .unwrap_or_else(|| profile::UNKNOWN_HOST.to_string()),
            local_ip: self.local_address.clone(),
        })
    }

    fn dispose(&mut self) {
        if let Some(index) = self.active.take() {
            if let Err(e) = self.engines[index].disconnect() {
                debug!("Engine teardown on dispose: {}", e);
            }
        }

        self.poll = None;
        self.teardown_deadline = None;
        self.live_attempt = None;
        self.engines.clear();
        self.counters.reset();
        self.server = None;
        self.local_address = None;
        self.connected_at = None;
        self.connected_at_ms = None;
        self.last_error = None;

        self.transition(SessionState::Idle, "Disposed");
        self.sink = None;
        info!("VPN session disposed");
    }

    fn progress(&mut self, message: String) {
        if message == self.last_message {
            return;
        }
        self.last_message = message;
        self.emit();
    }

    fn transition(&mut self, state: SessionState, message: impl Into<String>) {
        let from = self.state;
        self.state = state;
        self.last_message = message.into();
        info!("Session {} -> {}: {}", from, state, self.last_message);
        self.emit();
    }

    fn snapshot(&self) -> StatusSnapshot {
        let connected = self.state == SessionState::Connected;

        StatusSnapshot {
            state: self.state,
            message: self.last_message.clone(),
            server_ip: self.server.as_ref().map(|s| s.host.clone()),
            local_ip: self.local_address.clone(),
            bytes_in: connected.then(|| self.counters.bytes_in()),
            bytes_out: connected.then(|| self.counters.bytes_out()),
            duration: StatsCounter::elapsed_seconds(self.connected_at),
            connected_at: self.connected_at_ms,
            error_message: match self.state {
                SessionState::Error => self.last_error.clone(),
                _ => None,
            },
        }
    }

    fn emit(&mut self) {
        let snapshot = self.snapshot();
        if let Some(sink) = &mut self.sink {
            if !sink.send(snapshot) {
                debug!("Status subscriber gone");
                self.sink = None;
            }
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running session actor
///
/// Engines hold their own senders into the actor queue, so dropping every
/// handle does not stop the actor. It runs until a `Dispose` is queued;
/// [`VpnSession`](crate::VpnSession) does that on `dispose` and on drop.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
    counters: Arc<StatsCounter>,
}

impl SessionHandle {
    /// Start the session actor. Must be called within a Tokio runtime.
    pub(crate) fn spawn(config: SessionConfig, engines: Vec<Box<dyn TunnelEngine>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(StatsCounter::new());

        let kinds: Vec<EngineKind> = engines.iter().map(|e| e.kind()).collect();
        info!("Starting VPN session with engines {:?}", kinds);

        let session = Session::new(config, engines, tx.downgrade(), counters.clone());
        tokio::spawn(session.run(rx));

        Self { tx, counters }
    }

    /// Byte counters of the current connection, for the packet path
    pub fn counters(&self) -> Arc<StatsCounter> {
        self.counters.clone()
    }

    /// Start a connect attempt. `Ok` means the attempt started; its
    /// outcome arrives on the status stream.
    pub async fn connect(&self, request: ConnectRequest) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Connect { request, reply })?;
        rx.await.map_err(|_| SessionError::Disposed)?
    }

    /// Start teardown. A no-op when nothing is connected.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Disconnect { reply })?;
        rx.await.map_err(|_| SessionError::Disposed)?
    }

    /// Statistics of the current connection; `None` unless connected.
    pub async fn connection_stats(&self) -> Result<Option<ConnectionStats>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Stats { reply })?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    /// Current status
    pub async fn snapshot(&self) -> Result<StatusSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply })?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    /// Replace the status sink. The previous one stops receiving.
    pub fn set_sink(&self, sink: Box<dyn StatusSink>) -> Result<(), SessionError> {
        self.send(SessionCommand::Subscribe { sink })
    }

    pub fn unsubscribe(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Unsubscribe)
    }

    /// Release engines and stop the actor.
    pub async fn dispose(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::Dispose { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Queue a dispose without waiting for it.
    pub(crate) fn dispose_detached(&self) {
        let (reply, _) = oneshot::channel();
        let _ = self.send(SessionCommand::Dispose { reply });
    }

    /// Has the actor stopped?
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(cmd).map_err(|_| SessionError::Disposed)
    }
}
