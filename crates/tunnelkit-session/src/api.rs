//! Application-facing VPN session
//!
//! [`VpnSession`] is what a UI shell talks to: explicit
//! initialize/dispose, permission checks, connect/disconnect and a status
//! stream. It owns the session actor and forwards to it.

use crate::config::{ConfigError, SessionConfig};
use crate::engine::{
    NativeEngine, NativeLibrary, OsFrameworkEngine, PlatformVpnManager, SimulatedEngine,
    TunnelEngine,
};
use crate::error::SessionError;
use crate::profile::ConnectRequest;
use crate::session::SessionHandle;
use crate::stats::StatsCounter;
use crate::status::{ConnectionStats, StatusSink, StatusSnapshot, StatusStream};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// OS consent flow for creating VPN tunnels
pub trait PermissionProvider: Send + Sync {
    /// Has the user already granted VPN permission?
    fn has_permission(&self) -> bool;

    /// Ask the user. May block on a system dialog.
    fn request_permission(&self) -> bool;
}

/// Platforms without a consent step
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

impl PermissionProvider for AlwaysGranted {
    fn has_permission(&self) -> bool {
        true
    }

    fn request_permission(&self) -> bool {
        true
    }
}

/// Builder for [`VpnSession`]
pub struct SessionBuilder {
    config: SessionConfig,
    engines: Vec<Box<dyn TunnelEngine>>,
    permission: Arc<dyn PermissionProvider>,
    simulated: bool,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            engines: Vec::new(),
            permission: Arc::new(AlwaysGranted),
            simulated: false,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a native tunnel library
    pub fn native(self, library: Arc<dyn NativeLibrary>) -> Self {
        self.engine(Box::new(NativeEngine::new(library)))
    }

    /// Register the platform VPN manager
    pub fn os_framework(self, manager: Arc<dyn PlatformVpnManager>) -> Self {
        self.engine(Box::new(OsFrameworkEngine::new(manager)))
    }

    /// Add the loopback fallback, using the configured local address
    pub fn simulated(mut self) -> Self {
        self.simulated = true;
        self
    }

    /// Register any engine
    pub fn engine(mut self, engine: Box<dyn TunnelEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    pub fn permission(mut self, provider: Arc<dyn PermissionProvider>) -> Self {
        self.permission = provider;
        self
    }

    pub fn build(mut self) -> Result<VpnSession, ConfigError> {
        self.config.validate()?;

        if self.simulated {
            let engine = SimulatedEngine::new(self.config.simulated_local_address.clone());
            self.engines.push(Box::new(engine));
        }

        Ok(VpnSession {
            config: self.config,
            permission: self.permission,
            lifecycle: Mutex::new(Lifecycle::Pending(self.engines)),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum Lifecycle {
    Pending(Vec<Box<dyn TunnelEngine>>),
    Running(SessionHandle),
    Disposed,
}

/// A VPN session, reused across connect/disconnect cycles
pub struct VpnSession {
    config: SessionConfig,
    permission: Arc<dyn PermissionProvider>,
    lifecycle: Mutex<Lifecycle>,
}

impl VpnSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Start the session. Idempotent. Must be called within a Tokio runtime.
    pub fn initialize(&self) -> Result<(), SessionError> {
        let mut lifecycle = self.lock();

        match std::mem::replace(&mut *lifecycle, Lifecycle::Disposed) {
            Lifecycle::Pending(engines) => {
                let handle = SessionHandle::spawn(self.config.clone(), engines);
                *lifecycle = Lifecycle::Running(handle);
                info!("VPN session initialized");
                Ok(())
            }
            Lifecycle::Running(handle) => {
                *lifecycle = Lifecycle::Running(handle);
                Ok(())
            }
            Lifecycle::Disposed => Err(SessionError::Disposed),
        }
    }

    pub fn has_permission(&self) -> bool {
        self.permission.has_permission()
    }

    /// Run the consent flow off the async threads.
    pub async fn request_permission(&self) -> bool {
        let provider = self.permission.clone();
        match tokio::task::spawn_blocking(move || provider.request_permission()).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!("Permission request failed: {}", e);
                false
            }
        }
    }

    /// Start connecting. `Ok` means the attempt started; watch the
    /// status stream for the outcome.
    pub async fn connect(
        &self,
        profile: &str,
        username: Option<&str>,
        password: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<(), SessionError> {
        let handle = self.handle()?;

        if !self.permission.has_permission() {
            warn!("Connect refused: VPN permission not granted");
            return Err(SessionError::PermissionDenied);
        }

        let mut request = ConnectRequest::new(profile);
        request.credentials.username = username.map(str::to_string);
        request.credentials.password = password.map(str::to_string);
        if let Some(name) = display_name {
            request = request.with_display_name(name);
        }

        handle.connect(request).await
    }

    /// Start teardown; a no-op when there is nothing to tear down.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        match self.handle() {
            Ok(handle) => match handle.disconnect().await {
                Err(SessionError::Disposed) => Ok(()),
                other => other,
            },
            Err(_) => Ok(()),
        }
    }

    /// Current connection statistics, `None` unless connected.
    pub async fn get_connection_stats(&self) -> Option<ConnectionStats> {
        let handle = self.handle().ok()?;
        handle.connection_stats().await.ok().flatten()
    }

    /// Latest status snapshot
    pub async fn status(&self) -> Result<StatusSnapshot, SessionError> {
        self.handle()?.snapshot().await
    }

    /// Subscribe to status snapshots. Replaces any previous subscriber.
    pub fn subscribe(&self) -> Result<StatusStream, SessionError> {
        let (tx, stream) = StatusStream::channel();
        self.set_sink(Box::new(tx))?;
        Ok(stream)
    }

    /// Deliver status snapshots to a custom sink. Replaces any previous subscriber.
    pub fn set_sink(&self, sink: Box<dyn StatusSink>) -> Result<(), SessionError> {
        self.handle()?.set_sink(sink)
    }

    pub fn unsubscribe(&self) {
        if let Ok(handle) = self.handle() {
            let _ = handle.unsubscribe();
        }
    }

    /// Byte counters, for a packet path living outside the engine
    pub fn counters(&self) -> Option<Arc<StatsCounter>> {
        self.handle().ok().map(|h| h.counters())
    }

    /// Release engines and detach the subscriber. Later calls are no-ops.
    pub async fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Lifecycle::Disposed);

        match previous {
            Lifecycle::Running(handle) => handle.dispose().await,
            Lifecycle::Pending(engines) => {
                debug!("Disposing uninitialized session ({} engines)", engines.len());
            }
            Lifecycle::Disposed => {}
        }
    }

    fn handle(&self) -> Result<SessionHandle, SessionError> {
        match &*self.lock() {
            Lifecycle::Running(handle) => Ok(handle.clone()),
            Lifecycle::Pending(_) => Err(SessionError::NotInitialized),
            Lifecycle::Disposed => Err(SessionError::Disposed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for VpnSession {
    fn drop(&mut self) {
        if let Lifecycle::Running(handle) = &*self.lock() {
            handle.dispose_detached();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SessionState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Toggle(AtomicBool);

    impl PermissionProvider for Toggle {
        fn has_permission(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn request_permission(&self) -> bool {
            self.0.store(true, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let session = VpnSession::builder().simulated().build().unwrap();

        let err = session.connect("remote a 1", None, None, None).await.unwrap_err();
        assert_eq!(err, SessionError::NotInitialized);
        assert!(session.subscribe().is_err());
        assert!(session.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_idempotent() {
        let session = VpnSession::builder().simulated().build().unwrap();
        session.initialize().unwrap();
        session.initialize().unwrap();

        session.dispose().await;
        session.dispose().await;
        assert_eq!(session.initialize(), Err(SessionError::Disposed));
    }

    #[tokio::test]
    async fn test_permission_gate() {
        let provider = Arc::new(Toggle(AtomicBool::new(false)));
        let session = VpnSession::builder()
            .simulated()
            .permission(provider.clone())
            .build()
            .unwrap();
        session.initialize().unwrap();

        assert!(!session.has_permission());
        let err = session.connect("remote a 1", None, None, None).await.unwrap_err();
        assert_eq!(err, SessionError::PermissionDenied);

        assert!(session.request_permission().await);
        assert!(session.has_permission());
        session.connect("remote a 1", None, None, None).await.unwrap();
        session.dispose().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            poll_interval_ms: 10,
            ..SessionConfig::default()
        };
        assert!(VpnSession::builder().config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_no_engine_registered() {
        let session = VpnSession::builder().build().unwrap();
        session.initialize().unwrap();

        let err = session.connect("remote a 1", None, None, None).await.unwrap_err();
        assert_eq!(err, SessionError::EngineUnavailable);
    }

    #[tokio::test]
    async fn test_drop_stops_actor_with_live_engine() {
        let session = VpnSession::builder().simulated().build().unwrap();
        session.initialize().unwrap();
        let mut stream = session.subscribe().unwrap();

        // the loopback engine now holds a sender into the actor queue
        session.connect("remote a 1", None, None, None).await.unwrap();
        loop {
            match stream.recv().await {
                Some(snap) if snap.state == SessionState::Connected => break,
                Some(_) => {}
                None => panic!("status stream closed"),
            }
        }

        let handle = session.handle().unwrap();
        drop(session);

        let stopped = tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(stopped.is_ok(), "session actor still running after drop");
        assert_eq!(handle.disconnect().await, Err(SessionError::Disposed));
    }
}
