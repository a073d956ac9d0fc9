//! Session state and status reporting
//!
//! Snapshots are what observers see. The session emits one per
//! transition and one per poll tick while connected, in order, to at
//! most one sink at a time.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Not yet used, or disposed
    #[default]
    Idle,
    /// Engine selected, tunnel coming up
    Connecting,
    /// Server reached, credentials/config exchange in progress
    Authenticating,
    /// Tunnel is up
    Connected,
    /// Teardown requested, waiting for the engine
    Disconnecting,
    /// Tunnel is down
    Disconnected,
    /// Attempt or tunnel failed
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        }
    }

    /// Can a new connect attempt start from here?
    pub fn accepts_connect(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Disconnected | SessionState::Error)
    }

    /// Connect attempt or tunnel in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Authenticating | SessionState::Connected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    /// Only while connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<u64>,
    /// Only while connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
    /// Connected time in whole seconds
    pub duration: u64,
    /// Unix epoch milliseconds, only while connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<u64>,
    /// Only in the error state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusSnapshot {
    /// Encode for the event channel.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Statistics for the current connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_seconds: u64,
    pub server_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
}

/// Receiver of status snapshots.
///
/// `send` returns false once the receiving side is gone; the session
/// then detaches the sink.
pub trait StatusSink: Send {
    fn send(&mut self, snapshot: StatusSnapshot) -> bool;
}

impl StatusSink for mpsc::UnboundedSender<StatusSnapshot> {
    fn send(&mut self, snapshot: StatusSnapshot) -> bool {
        mpsc::UnboundedSender::send(self, snapshot).is_ok()
    }
}

impl StatusSink for crossbeam_channel::Sender<StatusSnapshot> {
    fn send(&mut self, snapshot: StatusSnapshot) -> bool {
        crossbeam_channel::Sender::send(self, snapshot).is_ok()
    }
}

/// Sink backed by a closure, for shells that push into their own event loop
pub struct FnSink<F>(pub F);

impl<F> StatusSink for FnSink<F>
where
    F: FnMut(StatusSnapshot) -> bool + Send,
{
    fn send(&mut self, snapshot: StatusSnapshot) -> bool {
        (self.0)(snapshot)
    }
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct StatusStream {
    rx: mpsc::UnboundedReceiver<StatusSnapshot>,
}

impl StatusStream {
    /// New stream plus the sink that feeds it
    pub fn channel() -> (mpsc::UnboundedSender<StatusSnapshot>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next snapshot; `None` once the session has detached this stream.
    pub async fn recv(&mut self) -> Option<StatusSnapshot> {
        self.rx.recv().await
    }

    /// Next snapshot if one is already queued
    pub fn try_recv(&mut self) -> Option<StatusSnapshot> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued
    pub fn drain(&mut self) -> Vec<StatusSnapshot> {
        let mut out = Vec::new();
        while let Ok(s) = self.rx.try_recv() {
            out.push(s);
        }
        out
    }
}
