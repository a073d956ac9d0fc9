//! tunnelkit - VPN session lifecycle core
//!
//! Establishes, monitors and tears down a VPN tunnel on behalf of an
//! application shell, reporting live status and traffic statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Application shell                        │
//! │   connect / disconnect / stats            status stream ▲     │
//! └──────────────┬─────────────────────────────────────────┼─────┘
//!                ▼                                          │
//!        ┌──────────────┐   one queue, arrival order  ┌─────┴──────┐
//!        │  VpnSession  │────────────────────────────▶│  Session   │
//!        └──────────────┘                             │   actor    │
//!                                                      └─────┬──────┘
//!                           engine reports (same queue) ▲    │ connect
//!                                                       │    ▼
//!                               ┌───────────────────────┴────────────┐
//!                               │ Native │ OS framework │ Simulated   │
//!                               └────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Engine selection**: first available of a configurable ordered list
//! - **One status model**: engine dialects normalized at the adapter
//! - **Live statistics**: lock-free byte counters, periodic snapshots while connected
//! - **Safe teardown**: disconnect at any point, late engine reports discarded

mod api;
mod config;
mod engine;
mod error;
mod profile;
mod session;
mod stats;
mod status;

pub use api::{AlwaysGranted, PermissionProvider, SessionBuilder, VpnSession};
pub use config::{ConfigError, SessionConfig};
pub use engine::{
    EngineContext, EngineError, EngineEvent, EngineEventSender, EngineKind, EngineStats,
    EngineStatus, LoopbackPort, NativeCallback, NativeClient, NativeConfig, NativeEngine,
    NativeEvent, NativeLibrary, NativeNotice, NativeTransportStats, NoPlatformVpn,
    OsFrameworkEngine, PlatformStatusObserver, PlatformVpnManager, PlatformVpnStatus,
    SimulatedEngine, TunnelConfiguration, TunnelEngine, UnavailableLibrary,
};
pub use error::SessionError;
pub use profile::{
    parse as parse_profile, parse_with_default_port, ConnectRequest, Credentials, ServerInfo,
    DEFAULT_PORT,
};
pub use stats::{StatsCounter, TrafficSnapshot};
pub use status::{ConnectionStats, FnSink, SessionState, StatusSink, StatusSnapshot, StatusStream};
