//! Simulated engine
//!
//! Last-resort fallback when no real engine exists: reports Connected
//! immediately and loops packets back through a worker thread, so the
//! UI has a working demo path.
//!
//! Every looped packet is counted once as outbound (read from the device
//! side) and once as inbound (written back).

use super::{
    EngineContext, EngineError, EngineEventSender, EngineKind, EngineStats, EngineStatus,
    TunnelEngine,
};
use crate::profile::ConnectRequest;
use crate::stats::StatsCounter;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Messages handled by the loopback worker
enum LoopbackMessage {
    Packet(Vec<u8>),
    Shutdown,
}

/// Device-side end of the loopback path.
///
/// Packets written here come back out of [`LoopbackPort::recv_timeout`] while the
/// simulated tunnel is up.
#[derive(Clone)]
pub struct LoopbackPort {
    packets: Sender<LoopbackMessage>,
    echoes: Receiver<Vec<u8>>,
}

impl LoopbackPort {
    /// Hand a packet to the tunnel. Returns false if the engine is gone.
    pub fn send(&self, packet: Vec<u8>) -> bool {
        self.packets.send(LoopbackMessage::Packet(packet)).is_ok()
    }

    /// Wait for the next echoed packet.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Vec<u8>> {
        self.echoes.recv_timeout(timeout).ok()
    }

    /// Take an echoed packet if one is ready.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.echoes.try_recv().ok()
    }
}

/// Loopback engine
pub struct SimulatedEngine {
    local_address: String,
    packets_tx: Sender<LoopbackMessage>,
    packets_rx: Receiver<LoopbackMessage>,
    echoes_tx: Sender<Vec<u8>>,
    echoes_rx: Receiver<Vec<u8>>,
    worker: Option<thread::JoinHandle<()>>,
    events: Option<EngineEventSender>,
    counters: Option<Arc<StatsCounter>>,
    server_address: Option<String>,
}

impl SimulatedEngine {
    pub fn new(local_address: impl Into<String>) -> Self {
        let (packets_tx, packets_rx) = unbounded();
        let (echoes_tx, echoes_rx) = unbounded();

        Self {
            local_address: local_address.into(),
            packets_tx,
            packets_rx,
            echoes_tx,
            echoes_rx,
            worker: None,
            events: None,
            counters: None,
            server_address: None,
        }
    }

    /// Device-side port for feeding packets through the loopback.
    pub fn port(&self) -> LoopbackPort {
        LoopbackPort {
            packets: self.packets_tx.clone(),
            echoes: self.echoes_rx.clone(),
        }
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.packets_tx.send(LoopbackMessage::Shutdown);
            if worker.join().is_err() {
                warn!("Loopback worker panicked");
            }
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new("10.8.0.2")
    }
}

impl TunnelEngine for SimulatedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Simulated
    }

    fn availability(&self) -> bool {
        true
    }

    fn connect(
        &mut self,
        _request: &ConnectRequest,
        ctx: EngineContext,
    ) -> Result<(), EngineError> {
        self.stop_worker();

        // Packets queued while no tunnel was up are dropped
        while self.packets_rx.try_recv().is_ok() {}

        let rx = self.packets_rx.clone();
        let tx = self.echoes_tx.clone();
        let counters = ctx.counters.clone();

        let worker = thread::Builder::new()
            .name(format!("loopback-{}", ctx.events.attempt()))
            .spawn(move || run_loopback(rx, tx, counters))
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        info!("Simulated tunnel up for {}", ctx.server);
        self.worker = Some(worker);
        self.counters = Some(ctx.counters);
        self.server_address = Some(ctx.server.host);
        ctx.events.send(EngineStatus::Connected, "Connected to VPN (simulation)");
        self.events = Some(ctx.events);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        self.stop_worker();
        self.counters = None;

        match self.events.take() {
            Some(events) => {
                events.send(EngineStatus::Disconnected, "Disconnected");
                Ok(())
            }
            None => Err(EngineError::NotConnected),
        }
    }

    fn is_connected(&self) -> bool {
        self.worker.is_some()
    }

    fn current_stats(&self) -> Option<EngineStats> {
        let counters = self.counters.as_ref()?;
        let snapshot = counters.snapshot();

        Some(EngineStats {
            bytes_in: snapshot.bytes_in,
            bytes_out: snapshot.bytes_out,
            local_address: Some(self.local_address.clone()),
            server_address: self.server_address.clone(),
        })
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn run_loopback(rx: Receiver<LoopbackMessage>, tx: Sender<Vec<u8>>, counters: Arc<StatsCounter>) {
    debug!("Loopback worker started");

    loop {
        let packet = match rx.recv() {
            Ok(LoopbackMessage::Packet(p)) => p,
            Ok(LoopbackMessage::Shutdown) | Err(_) => break,
        };

        let len = packet.len() as u64;
        counters.add_out(len);

        if tx.send(packet).is_err() {
            break;
        }
        counters.add_in(len);
    }

    debug!("Loopback worker stopped");
}
