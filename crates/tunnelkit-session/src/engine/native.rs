//! Native tunnel library adapter
//!
//! Wraps an external tunnel library (an OpenVPN-style client core) that
//! is only reachable through an opaque handle. The library's `run` call
//! blocks for the whole life of the tunnel and reports progress through
//! a callback, so it is driven from a dedicated thread.
//!
//! # Handle lifecycle
//!
//! The handle is created once, on first use, and destroyed exactly once
//! when the last owner lets go of it: the engine on dispose, or the
//! tunnel thread if it is still unwinding at that point.

use super::{
    EngineContext, EngineError, EngineEventSender, EngineKind, EngineStats, EngineStatus,
    TunnelEngine,
};
use crate::profile::ConnectRequest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long `connect` waits for a previous tunnel thread that is already unwinding
const UNWIND_WAIT: Duration = Duration::from_secs(2);

/// Raw event from the library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeEvent {
    /// Event name, e.g. `CONNECTED`
    pub name: String,
    /// Free-form detail, often empty
    pub info: String,
    /// Library flagged this event as an error
    pub error: bool,
}

impl NativeEvent {
    pub fn new(name: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            info: info.into(),
            error: false,
        }
    }

    pub fn error(name: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            error: true,
            ..Self::new(name, info)
        }
    }
}

/// Anything the library pushes through its callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeNotice {
    Event(NativeEvent),
    Log(String),
}

/// Callback registered with the library for one tunnel run
pub type NativeCallback = Arc<dyn Fn(NativeNotice) + Send + Sync>;

/// Transport counters kept by the library
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeTransportStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// What the library needs to bring a tunnel up
#[derive(Clone)]
pub struct NativeConfig {
    pub profile: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub display_name: String,
}

impl std::fmt::Debug for NativeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeConfig")
            .field("display_name", &self.display_name)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// One client instance inside the library
pub trait NativeClient: Send + Sync {
    /// Bring the tunnel up and keep it up. Blocks until the tunnel ends;
    /// `Err` carries the library's failure text.
    fn run(&self, config: &NativeConfig, callback: NativeCallback) -> Result<(), String>;

    /// Ask a running `run` call to return.
    fn stop(&self);

    /// Transport counters for the current tunnel.
    fn transport_stats(&self) -> NativeTransportStats;

    /// Free library resources. Called exactly once.
    fn destroy(&self);
}

/// Entry points of the library itself
pub trait NativeLibrary: Send + Sync {
    /// Was the library linked into this build?
    fn is_available(&self) -> bool;

    /// Create a client instance.
    fn create_client(&self) -> Option<Box<dyn NativeClient>>;
}

/// Library stand-in for builds without a native tunnel core
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableLibrary;

impl NativeLibrary for UnavailableLibrary {
    fn is_available(&self) -> bool {
        false
    }

    fn create_client(&self) -> Option<Box<dyn NativeClient>> {
        None
    }
}

/// Owning wrapper around the library handle
struct NativeHandle {
    client: Box<dyn NativeClient>,
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        debug!("Destroying native tunnel handle");
        self.client.destroy();
    }
}

/// State shared with the tunnel thread
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    stop_requested: AtomicBool,
    /// The library already reported the end of the tunnel
    ended: AtomicBool,
    local_address: Mutex<Option<String>>,
}

impl Shared {
    fn set_local_address(&self, addr: Option<String>) {
        *self.local_address.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    fn local_address(&self) -> Option<String> {
        self.local_address.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Engine backed by the native tunnel library
pub struct NativeEngine {
    library: Arc<dyn NativeLibrary>,
    handle: Option<Arc<NativeHandle>>,
    worker: Option<thread::JoinHandle<()>>,
    shared: Arc<Shared>,
    server_address: Option<String>,
}

impl NativeEngine {
    pub fn new(library: Arc<dyn NativeLibrary>) -> Self {
        Self {
            library,
            handle: None,
            worker: None,
            shared: Arc::new(Shared::default()),
            server_address: None,
        }
    }

    /// Engine for builds without a native core; never available.
    pub fn unavailable() -> Self {
        Self::new(Arc::new(UnavailableLibrary))
    }

    fn ensure_handle(&mut self) -> Result<Arc<NativeHandle>, EngineError> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }

        let client = self
            .library
            .create_client()
            .ok_or_else(|| EngineError::Native("failed to create client".into()))?;

        info!("Native tunnel client created");
        let handle = Arc::new(NativeHandle { client });
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Join the previous tunnel thread before starting another one.
    ///
    /// The library reports `DISCONNECTED` from inside `run`, so a thread
    /// can still be unwinding after the session saw the tunnel end. Such a
    /// thread is waited for; one whose tunnel is still live is not.
    fn reap_worker(&mut self) -> Result<(), EngineError> {
        if self.worker_running() {
            let stopping = self.shared.stop_requested.load(Ordering::Relaxed);
            if !stopping && !self.shared.ended.load(Ordering::Relaxed) {
                return Err(EngineError::Busy("tunnel already running".into()));
            }

            debug!("Waiting for previous native tunnel thread to return");
            if !stopping {
                if let Some(handle) = &self.handle {
                    self.shared.stop_requested.store(true, Ordering::Relaxed);
                    handle.client.stop();
                }
            }

            let deadline = Instant::now() + UNWIND_WAIT;
            while self.worker_running() {
                if Instant::now() >= deadline {
                    warn!("Previous native tunnel did not return within {:?}", UNWIND_WAIT);
                    return Err(EngineError::Busy("previous tunnel still shutting down".into()));
                }
                thread::sleep(Duration::from_millis(5));
            }
        }

        if let Some(done) = self.worker.take() {
            let _ = done.join();
        }
        Ok(())
    }
}

impl TunnelEngine for NativeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    fn availability(&self) -> bool {
        self.library.is_available()
    }

    fn connect(&mut self, request: &ConnectRequest, ctx: EngineContext) -> Result<(), EngineError> {
        if !self.availability() {
            return Err(EngineError::Unavailable);
        }
        self.reap_worker()?;

        let handle = self.ensure_handle()?;

        self.shared.connected.store(false, Ordering::Relaxed);
        self.shared.stop_requested.store(false, Ordering::Relaxed);
        self.shared.ended.store(false, Ordering::Relaxed);
        self.shared.set_local_address(None);
        self.server_address = Some(ctx.server.host.clone());

        if request.credentials.username.is_some() && !request.credentials.is_complete() {
            debug!("Native tunnel started with a username but no password");
        }

        let config = NativeConfig {
            profile: request.profile.clone(),
            username: request.credentials.username.clone(),
            password: request.credentials.password.clone(),
            display_name: ctx.display_name.clone(),
        };

        let events = ctx.events.clone();
        let shared = self.shared.clone();
        let callback: NativeCallback = {
            let events = events.clone();
            let shared = shared.clone();
            Arc::new(move |notice| translate(notice, &events, &shared))
        };

        let worker = thread::Builder::new()
            .name(format!("native-tunnel-{}", events.attempt()))
            .spawn(move || {
                events.send(EngineStatus::Connecting, "Initializing tunnel engine...");

                let result = handle.client.run(&config, callback);
                let was_connected = shared.connected.swap(false, Ordering::Relaxed);
                shared.set_local_address(None);

                match result {
                    Err(e) => {
                        error!("Native tunnel failed: {}", e);
                        events.send(EngineStatus::Error, format!("Connection failed: {}", e));
                    }
                    Ok(()) if shared.stop_requested.load(Ordering::Relaxed) => {
                        events.send(EngineStatus::Disconnected, "Disconnected");
                    }
                    Ok(()) if was_connected => {
                        events.send(EngineStatus::Disconnected, "Tunnel closed by server");
                    }
                    Ok(()) => {
                        events.send(
                            EngineStatus::Disconnected,
                            "Connection ended before tunnel came up",
                        );
                    }
                }
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        let Some(handle) = &self.handle else {
            return Err(EngineError::NotConnected);
        };

        if !self.worker_running() {
            return Err(EngineError::NotConnected);
        }

        info!("Stopping native tunnel");
        self.shared.stop_requested.store(true, Ordering::Relaxed);
        handle.client.stop();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    fn current_stats(&self) -> Option<EngineStats> {
        let handle = self.handle.as_ref()?;
        if !self.is_connected() {
            return None;
        }

        let transport = handle.client.transport_stats();
        Some(EngineStats {
            bytes_in: transport.bytes_in,
            bytes_out: transport.bytes_out,
            local_address: self.shared.local_address(),
            server_address: self.server_address.clone(),
        })
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        if self.worker_running() {
            if let Some(handle) = &self.handle {
                self.shared.stop_requested.store(true, Ordering::Relaxed);
                handle.client.stop();
            }
        }
        // The tunnel thread keeps its own reference; the handle is
        // destroyed once that thread has returned too.
        self.handle = None;
    }
}

/// Map one library notice onto the session vocabulary.
fn translate(notice: NativeNotice, events: &EngineEventSender, shared: &Shared) {
    match notice {
        NativeNotice::Log(text) => {
            if let Some(ip) = parse_ifconfig(&text) {
                debug!("Native tunnel assigned address {}", ip);
                shared.set_local_address(Some(ip));
            }
        }
        NativeNotice::Event(ev) => {
            debug!("Native event: {} - {} (error={})", ev.name, ev.info, ev.error);

            let Some((status, fallback)) = classify(&ev) else {
                debug!("Ignoring native event {}", ev.name);
                return;
            };

            match status {
                EngineStatus::Connected => shared.connected.store(true, Ordering::Relaxed),
                EngineStatus::Disconnected | EngineStatus::Error => {
                    shared.connected.store(false, Ordering::Relaxed);
                    shared.ended.store(true, Ordering::Relaxed);
                }
                _ => {}
            }

            let message = if ev.info.is_empty() { fallback } else { ev.info };
            events.send(status, message);
        }
    }
}

/// Status and default text for a library event, or `None` to ignore it.
fn classify(ev: &NativeEvent) -> Option<(EngineStatus, String)> {
    let (status, text) = match ev.name.as_str() {
        "CONNECTING" => (EngineStatus::Connecting, "Connecting to server..."),
        "WAIT" => (EngineStatus::Connecting, "Waiting for server..."),
        "RECONNECTING" => (EngineStatus::Connecting, "Reconnecting..."),
        "PAUSE" => (EngineStatus::Connecting, "Connection paused, retrying..."),
        "AUTH" => (EngineStatus::Authenticating, "Authenticating..."),
        "GET_CONFIG" => (EngineStatus::Authenticating, "Downloading configuration..."),
        "ASSIGN_IP" => (EngineStatus::Authenticating, "Assigning IP address..."),
        "ADD_ROUTES" => (EngineStatus::Authenticating, "Adding routes..."),
        "CONNECTED" => (EngineStatus::Connected, "VPN connection established"),
        "DISCONNECTED" => (EngineStatus::Disconnected, "VPN disconnected"),
        _ if ev.error => return Some((EngineStatus::Error, format!("Error: {}", ev.name))),
        _ => return None,
    };
    Some((status, text.to_string()))
}

/// Pull the tunnel address out of an `[ifconfig] [10.8.0.2] [255.255.255.0]` log line.
fn parse_ifconfig(line: &str) -> Option<String> {
    const MARKER: &str = "[ifconfig] [";

    let start = line.find(MARKER)? + MARKER.len();
    let rest = &line[start..];
    let end = rest.find(']')?;
    let ip = rest[..end].trim();

    if ip.is_empty() {
        None
    } else {
        Some(ip.to_string())
    }
}
