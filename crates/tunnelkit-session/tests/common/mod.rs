//! Shared test engines

#![allow(dead_code)]

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tunnelkit_session::{
    ConnectRequest, EngineContext, EngineError, EngineEventSender, EngineKind, EngineStats,
    EngineStatus, NativeCallback, NativeClient, NativeConfig, NativeEvent, NativeLibrary,
    NativeNotice, NativeTransportStats, SessionState, StatusSnapshot, StatusStream, TunnelEngine,
};

pub const PROFILE: &str = "client\ndev tun\nremote vpn.example.com 443\n";

#[derive(Default)]
struct ControlState {
    events: Option<EngineEventSender>,
    connects: usize,
    disconnects: usize,
}

/// Test-side handle to a [`ScriptedEngine`]
#[derive(Clone, Default)]
pub struct EngineControl {
    inner: Arc<Mutex<ControlState>>,
}

impl EngineControl {
    /// Report a status as the engine would from its worker thread.
    pub fn fire(&self, status: EngineStatus, message: &str) -> bool {
        let sender = self.inner.lock().unwrap().events.clone();
        match sender {
            Some(sender) => sender.send(status, message),
            None => false,
        }
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.inner.lock().unwrap().disconnects
    }
}

/// Engine driven entirely by the test
pub struct ScriptedEngine {
    kind: EngineKind,
    available: bool,
    on_connect: Vec<(EngineStatus, &'static str)>,
    fail_connect: Option<EngineError>,
    confirm_disconnect: bool,
    control: EngineControl,
}

impl ScriptedEngine {
    pub fn new(kind: EngineKind) -> (Self, EngineControl) {
        let control = EngineControl::default();
        let engine = Self {
            kind,
            available: true,
            on_connect: Vec::new(),
            fail_connect: None,
            confirm_disconnect: true,
            control: control.clone(),
        };
        (engine, control)
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Report these right after `connect` returns.
    pub fn on_connect(mut self, status: EngineStatus, message: &'static str) -> Self {
        self.on_connect.push((status, message));
        self
    }

    pub fn failing_connect(mut self, err: EngineError) -> Self {
        self.fail_connect = Some(err);
        self
    }

    /// Never report `Disconnected` after a disconnect request.
    pub fn silent_teardown(mut self) -> Self {
        self.confirm_disconnect = false;
        self
    }

    pub fn boxed(self) -> Box<dyn TunnelEngine> {
        Box::new(self)
    }
}

impl TunnelEngine for ScriptedEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn availability(&self) -> bool {
        self.available
    }

    fn connect(
        &mut self,
        _request: &ConnectRequest,
        ctx: EngineContext,
    ) -> Result<(), EngineError> {
        let mut state = self.control.inner.lock().unwrap();
        state.connects += 1;

        if let Some(err) = self.fail_connect.clone() {
            return Err(err);
        }

        for (status, message) in &self.on_connect {
            ctx.events.send(*status, *message);
        }
        state.events = Some(ctx.events);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        let mut state = self.control.inner.lock().unwrap();
        state.disconnects += 1;

        if self.confirm_disconnect {
            if let Some(events) = &state.events {
                events.send(EngineStatus::Disconnected, "Disconnected");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn current_stats(&self) -> Option<EngineStats> {
        None
    }
}

/// Native client that replays a script, then blocks until stopped.
pub struct ReplayClient {
    script: Vec<NativeNotice>,
    linger: Duration,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl NativeClient for ReplayClient {
    fn run(&self, _config: &NativeConfig, callback: NativeCallback) -> Result<(), String> {
        for notice in &self.script {
            callback(notice.clone());
        }
        let _ = self.stop_rx.recv();
        callback(NativeNotice::Event(NativeEvent::new("DISCONNECTED", "")));
        std::thread::sleep(self.linger);
        Ok(())
    }

    fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    fn transport_stats(&self) -> NativeTransportStats {
        NativeTransportStats {
            bytes_in: 4096,
            bytes_out: 1024,
        }
    }

    fn destroy(&self) {}
}

/// Native library whose clients replay a fixed script
pub struct ReplayLibrary {
    pub script: Vec<NativeNotice>,
    /// Time `run` keeps going after it announced `DISCONNECTED`
    pub linger: Duration,
}

impl ReplayLibrary {
    /// A typical successful bring-up
    pub fn happy_path() -> Arc<Self> {
        Arc::new(Self::bring_up(Duration::ZERO))
    }

    /// Like [`ReplayLibrary::happy_path`], but `run` returns `linger`
    /// after reporting the tunnel down.
    pub fn lingering(linger: Duration) -> Arc<Self> {
        Arc::new(Self::bring_up(linger))
    }

    fn bring_up(linger: Duration) -> Self {
        let event = |name: &str| NativeNotice::Event(NativeEvent::new(name, ""));
        Self {
            linger,
            script: vec![
                event("CONNECTING"),
                event("WAIT"),
                event("AUTH"),
                event("GET_CONFIG"),
                NativeNotice::Log("[ifconfig] [10.8.0.6] [255.255.255.0]".into()),
                event("ASSIGN_IP"),
                event("CONNECTED"),
            ],
        }
    }
}

impl NativeLibrary for ReplayLibrary {
    fn is_available(&self) -> bool {
        true
    }

    fn create_client(&self) -> Option<Box<dyn NativeClient>> {
        let (stop_tx, stop_rx) = bounded(1);
        Some(Box::new(ReplayClient {
            script: self.script.clone(),
            linger: self.linger,
            stop_tx,
            stop_rx,
        }))
    }
}

/// Wait for the next snapshot, failing the test if none arrives.
pub async fn next(stream: &mut StatusStream) -> StatusSnapshot {
    tokio::time::timeout(Duration::from_secs(30), stream.recv())
        .await
        .expect("timed out waiting for a snapshot")
        .expect("status stream closed")
}

/// Skip snapshots until one in `state` arrives.
pub async fn wait_for(stream: &mut StatusStream, state: SessionState) -> StatusSnapshot {
    loop {
        let snap = next(stream).await;
        if snap.state == state {
            return snap;
        }
    }
}
