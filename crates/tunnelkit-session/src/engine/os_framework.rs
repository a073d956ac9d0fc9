//! OS VPN framework adapter
//!
//! Drives the platform's own VPN manager (a packet-tunnel provider or
//! similar). Connecting is two steps: persist the tunnel configuration,
//! then ask the platform to start it. Status comes back as platform
//! notifications, which are translated here.

use super::{
    EngineContext, EngineError, EngineEventSender, EngineKind, EngineStats, EngineStatus,
    TunnelEngine,
};
use crate::profile::ConnectRequest;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Status values reported by the platform VPN manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformVpnStatus {
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Reasserting,
    Disconnecting,
}

/// Observer the platform calls on every status change
pub type PlatformStatusObserver = Arc<dyn Fn(PlatformVpnStatus) + Send + Sync>;

/// Configuration persisted with the platform before starting
#[derive(Clone)]
pub struct TunnelConfiguration {
    /// Name shown in the system VPN settings
    pub description: String,
    /// Server host, for display
    pub server_address: String,
    /// Raw profile handed to the tunnel provider
    pub profile: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for TunnelConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfiguration")
            .field("description", &self.description)
            .field("server_address", &self.server_address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// The platform's VPN manager
pub trait PlatformVpnManager: Send + Sync {
    /// Does this platform offer an OS-managed tunnel at all?
    fn is_supported(&self) -> bool;

    /// Persist the tunnel configuration.
    fn save_configuration(&self, config: &TunnelConfiguration) -> Result<(), String>;

    /// Start the saved tunnel.
    fn start_tunnel(&self) -> Result<(), String>;

    /// Stop the tunnel.
    fn stop_tunnel(&self) -> Result<(), String>;

    /// Install (or clear) the status observer.
    fn set_status_observer(&self, observer: Option<PlatformStatusObserver>);

    /// Current platform status.
    fn status(&self) -> PlatformVpnStatus;

    /// Byte counters `(in, out)`, if the platform exposes them.
    fn traffic(&self) -> Option<(u64, u64)>;

    /// Address of the tunnel interface, if known.
    fn tunnel_address(&self) -> Option<String>;
}

/// Stand-in for platforms without an OS VPN framework
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlatformVpn;

impl PlatformVpnManager for NoPlatformVpn {
    fn is_supported(&self) -> bool {
        false
    }

    fn save_configuration(&self, _config: &TunnelConfiguration) -> Result<(), String> {
        Err("no OS VPN framework on this platform".into())
    }

    fn start_tunnel(&self) -> Result<(), String> {
        Err("no OS VPN framework on this platform".into())
    }

    fn stop_tunnel(&self) -> Result<(), String> {
        Ok(())
    }

    fn set_status_observer(&self, _observer: Option<PlatformStatusObserver>) {}

    fn status(&self) -> PlatformVpnStatus {
        PlatformVpnStatus::Invalid
    }

    fn traffic(&self) -> Option<(u64, u64)> {
        None
    }

    fn tunnel_address(&self) -> Option<String> {
        None
    }
}

/// Engine backed by the platform VPN manager
pub struct OsFrameworkEngine {
    manager: Arc<dyn PlatformVpnManager>,
    starter: Option<thread::JoinHandle<()>>,
    server_address: Option<String>,
}

impl OsFrameworkEngine {
    pub fn new(manager: Arc<dyn PlatformVpnManager>) -> Self {
        Self {
            manager,
            starter: None,
            server_address: None,
        }
    }

    /// Engine for platforms without a VPN framework; never available.
    pub fn unsupported() -> Self {
        Self::new(Arc::new(NoPlatformVpn))
    }
}

impl TunnelEngine for OsFrameworkEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::OsFramework
    }

    fn availability(&self) -> bool {
        self.manager.is_supported()
    }

    fn connect(&mut self, request: &ConnectRequest, ctx: EngineContext) -> Result<(), EngineError> {
        if !self.availability() {
            return Err(EngineError::Unavailable);
        }
        if self.starter.as_ref().is_some_and(|s| !s.is_finished()) {
            return Err(EngineError::Busy("tunnel start already in progress".into()));
        }

        let config = TunnelConfiguration {
            description: ctx.display_name.clone(),
            server_address: ctx.server.host.clone(),
            profile: request.profile.clone(),
            username: request.credentials.username.clone(),
            password: request.credentials.password.clone(),
        };
        self.server_address = Some(ctx.server.host.clone());

        // Replaces the previous attempt's observer
        let observer_events = ctx.events.clone();
        self.manager.set_status_observer(Some(Arc::new(move |status| {
            translate(status, &observer_events)
        })));

        let manager = self.manager.clone();
        let events = ctx.events;
        let starter = thread::Builder::new()
            .name(format!("os-vpn-start-{}", events.attempt()))
            .spawn(move || {
                if let Err(e) = manager.save_configuration(&config) {
                    warn!("Failed to save VPN configuration: {}", e);
                    events.send(
                        EngineStatus::Error,
                        format!("Failed to save VPN configuration: {}", e),
                    );
                    return;
                }
                debug!("VPN configuration '{}' saved", config.description);

                if let Err(e) = manager.start_tunnel() {
                    warn!("Failed to start VPN tunnel: {}", e);
                    events.send(EngineStatus::Error, format!("Failed to start VPN tunnel: {}", e));
                    return;
                }
                info!("OS VPN tunnel start requested");
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        self.starter = Some(starter);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        info!("Stopping OS VPN tunnel");
        self.manager.stop_tunnel().map_err(EngineError::Platform)
    }

    fn is_connected(&self) -> bool {
        self.manager.status() == PlatformVpnStatus::Connected
    }

    fn current_stats(&self) -> Option<EngineStats> {
        if !self.is_connected() {
            return None;
        }

        let (bytes_in, bytes_out) = self.manager.traffic().unwrap_or((0, 0));
        Some(EngineStats {
            bytes_in,
            bytes_out,
            local_address: self.manager.tunnel_address(),
            server_address: self.server_address.clone(),
        })
    }
}

impl Drop for OsFrameworkEngine {
    fn drop(&mut self) {
        self.manager.set_status_observer(None);
    }
}

/// Map a platform status onto the session vocabulary.
fn classify(status: PlatformVpnStatus) -> Option<(EngineStatus, &'static str)> {
    match status {
        PlatformVpnStatus::Invalid => Some((EngineStatus::Error, "VPN configuration is invalid")),
        PlatformVpnStatus::Disconnected => Some((EngineStatus::Disconnected, "Disconnected")),
        PlatformVpnStatus::Connecting => Some((EngineStatus::Connecting, "Connecting...")),
        PlatformVpnStatus::Connected => Some((EngineStatus::Connected, "Connected")),
        PlatformVpnStatus::Reasserting => Some((EngineStatus::Connecting, "Reconnecting...")),
        // the session tracks its own Disconnecting phase
        PlatformVpnStatus::Disconnecting => None,
    }
}

fn translate(status: PlatformVpnStatus, events: &EngineEventSender) {
    debug!("Platform VPN status changed: {:?}", status);
    if let Some((status, message)) = classify(status) {
        events.send(status, message);
    }
}
