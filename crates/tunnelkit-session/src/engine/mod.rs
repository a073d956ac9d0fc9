//! Tunnel Engines
//!
//! An engine is the strategy that actually brings a tunnel up. Three
//! variants exist, probed in priority order at connect time:
//!
//! 1. **Native**: an external tunnel library behind an opaque handle
//! 2. **OS framework**: the platform's own VPN manager
//! 3. **Simulated**: local loopback, no real tunnel
//!
//! # Status vocabulary
//!
//! Every engine speaks its own dialect (library event names, OS status
//! codes). Adapters translate that dialect into the five-value
//! [`EngineStatus`] before anything reaches the session; nothing past
//! this module ever interprets a platform string.
//!
//! # Threading
//!
//! `connect` must return promptly. Engines do their work on a background
//! thread and report progress through [`EngineEventSender`], which is
//! safe to call from any thread.

mod native;
mod os_framework;
mod simulated;

pub use native::{
    NativeCallback, NativeClient, NativeConfig, NativeEngine, NativeEvent, NativeLibrary,
    NativeNotice, NativeTransportStats, UnavailableLibrary,
};
pub use os_framework::{
    NoPlatformVpn, OsFrameworkEngine, PlatformStatusObserver, PlatformVpnManager,
    PlatformVpnStatus, TunnelConfiguration,
};
pub use simulated::{LoopbackPort, SimulatedEngine};

use crate::error::SessionError;
use crate::profile::{ConnectRequest, ServerInfo};
use crate::session::SessionCommand;
use crate::stats::StatsCounter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Engine variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Native,
    OsFramework,
    Simulated,
}

impl EngineKind {
    /// Default probing order
    pub fn priority_order() -> &'static [EngineKind] {
        &[EngineKind::Native, EngineKind::OsFramework, EngineKind::Simulated]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Native => "native",
            EngineKind::OsFramework => "os_framework",
            EngineKind::Simulated => "simulated",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized engine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    /// Reaching the server
    Connecting,
    /// Exchanging credentials / pulling configuration
    Authenticating,
    /// Tunnel is up
    Connected,
    /// Tunnel is down
    Disconnected,
    /// Attempt or tunnel failed
    Error,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Connecting => "connecting",
            EngineStatus::Authenticating => "authenticating",
            EngineStatus::Connected => "connected",
            EngineStatus::Disconnected => "disconnected",
            EngineStatus::Error => "error",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(EngineStatus::Connecting),
            "authenticating" => Ok(EngineStatus::Authenticating),
            "connected" => Ok(EngineStatus::Connected),
            "disconnected" => Ok(EngineStatus::Disconnected),
            "error" => Ok(EngineStatus::Error),
            other => Err(EngineError::UnknownStatus(other.to_string())),
        }
    }
}

/// One status report from an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub status: EngineStatus,
    pub message: String,
}

impl EngineEvent {
    pub fn new(status: EngineStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Engine-reported connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Bytes received through the tunnel
    pub bytes_in: u64,
    /// Bytes sent through the tunnel
    pub bytes_out: u64,
    /// Address assigned to our end of the tunnel
    pub local_address: Option<String>,
    /// Address of the server as the engine sees it
    pub server_address: Option<String>,
}

/// Callback channel from an engine back to its session.
///
/// Each sender is bound to one connect attempt. Reports for an attempt
/// the session has already left behind are dropped by the session, and
/// reports sent after the session is gone are dropped here.
#[derive(Clone)]
pub struct EngineEventSender {
    attempt: u64,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl EngineEventSender {
    pub(crate) fn new(attempt: u64, tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { attempt, tx }
    }

    /// Connect attempt this sender belongs to
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Report a status. Returns false if the session no longer exists.
    pub fn send(&self, status: EngineStatus, message: impl Into<String>) -> bool {
        let event = EngineEvent::new(status, message);
        let cmd = SessionCommand::Engine {
            attempt: self.attempt,
            event,
        };

        match self.tx.send(cmd) {
            Ok(()) => true,
            Err(mpsc::error::SendError(cmd)) => {
                if let SessionCommand::Engine { event, .. } = cmd {
                    let fault = SessionError::InternalFault(format!(
                        "engine reported '{}' after session disposal",
                        event.status
                    ));
                    warn!("{} (discarded)", fault);
                }
                false
            }
        }
    }
}

impl fmt::Debug for EngineEventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEventSender")
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Everything an engine gets for one connect attempt
#[derive(Debug, Clone)]
pub struct EngineContext {
    /// Progress reports go here
    pub events: EngineEventSender,
    /// Session byte counters, for engines that count locally
    pub counters: Arc<StatsCounter>,
    /// Server identity parsed from the profile
    pub server: ServerInfo,
    /// Label for the tunnel
    pub display_name: String,
}

/// Capability set shared by all engine variants
pub trait TunnelEngine: Send {
    /// Which variant this is
    fn kind(&self) -> EngineKind;

    /// Can this engine be used at all on this platform/build?
    fn availability(&self) -> bool;

    /// Start connecting. Must not block; the outcome is reported
    /// through `ctx.events`.
    fn connect(&mut self, request: &ConnectRequest, ctx: EngineContext) -> Result<(), EngineError>;

    /// Request teardown. Completion is reported as `Disconnected`
    /// through the attempt's event sender.
    fn disconnect(&mut self) -> Result<(), EngineError>;

    /// Is the tunnel currently up?
    fn is_connected(&self) -> bool;

    /// Raw statistics, if the engine keeps any
    fn current_stats(&self) -> Option<EngineStats>;
}

/// Engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine unavailable")]
    Unavailable,

    #[error("Engine busy: {0}")]
    Busy(String),

    #[error("Engine not connected")]
    NotConnected,

    #[error("Native library error: {0}")]
    Native(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Unknown engine status: {0}")]
    UnknownStatus(String),
}

#[cfg(test)]
pub(crate) fn test_sender(
    attempt: u64,
) -> (EngineEventSender, mpsc::UnboundedReceiver<SessionCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EngineEventSender::new(attempt, tx), rx)
}

#[cfg(test)]
pub(crate) fn test_context(
    attempt: u64,
) -> (EngineContext, mpsc::UnboundedReceiver<SessionCommand>) {
    let (events, rx) = test_sender(attempt);
    let ctx = EngineContext {
        events,
        counters: Arc::new(StatsCounter::new()),
        server: ServerInfo {
            host: "vpn.example.com".into(),
            port: 443,
        },
        display_name: "Test".into(),
    };
    (ctx, rx)
}

/// Pull the next engine event out of a test channel.
#[cfg(test)]
pub(crate) fn expect_event(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> EngineEvent {
    match rx.try_recv() {
        Ok(SessionCommand::Engine { event, .. }) => event,
        other => panic!("expected engine event, got {:?}", other.map(|_| "other command")),
    }
}

/// Like [`expect_event`] but waits for events sent from a worker thread.
#[cfg(test)]
pub(crate) fn wait_event(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> EngineEvent {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        match rx.try_recv() {
            Ok(SessionCommand::Engine { event, .. }) => return event,
            Ok(_) => panic!("expected engine event"),
            Err(mpsc::error::TryRecvError::Empty) if std::time::Instant::now() < deadline => {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(e) => panic!("no engine event: {e}"),
        }
    }
}
