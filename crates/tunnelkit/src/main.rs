//! tunnelkit: VPN session driver
//!
//! Loads a tunnel profile (and optionally a session config), runs one
//! connect/disconnect cycle and prints every status snapshot as a JSON
//! line on stdout.
//!
//! ```text
//! tunnelkit <profile> [config.toml|config.json] [seconds]
//! ```

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunnelkit_session::{SessionConfig, SessionState, SimulatedEngine, VpnSession};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_RUN_SECONDS: u64 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (logs to stderr, snapshots to stdout)
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(profile_path) = args.first() else {
        bail!("usage: tunnelkit <profile> [config.toml|config.json] [seconds]");
    };

    let profile = std::fs::read_to_string(profile_path)
        .with_context(|| format!("failed to read profile {}", profile_path))?;

    let config = match args.get(1) {
        Some(path) => SessionConfig::from_file(Path::new(path))
            .with_context(|| format!("failed to load config {}", path))?,
        None => SessionConfig::default(),
    };

    let seconds = match args.get(2) {
        Some(s) => s.parse::<u64>().with_context(|| format!("invalid run time '{}'", s))?,
        None => DEFAULT_RUN_SECONDS,
    };

    info!("tunnelkit starting...");
    info!("Using mimalloc allocator");

    // No native core or OS framework in this build; the loopback engine
    // stands in so the whole lifecycle can be exercised.
    let engine = SimulatedEngine::new(config.simulated_local_address.clone());
    let port = engine.port();

    let session = VpnSession::builder()
        .config(config)
        .engine(Box::new(engine))
        .build()
        .context("invalid session config")?;
    session.initialize()?;

    let mut stream = session.subscribe()?;
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = stream.recv().await {
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode snapshot: {}", e),
            }
            if snapshot.state == SessionState::Idle {
                break;
            }
        }
    });

    session
        .connect(&profile, None, None, None)
        .await
        .context("connect failed")?;

    // Push a packet through the loopback every 100ms
    let pump = tokio::task::spawn_blocking(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(seconds);
        let mut echoed = 0usize;
        while std::time::Instant::now() < deadline {
            if !port.send(vec![0u8; 1400]) {
                break;
            }
            if port.recv_timeout(Duration::from_millis(100)).is_some() {
                echoed += 1;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        echoed
    });

    let echoed = pump.await.context("packet pump failed")?;
    info!("Looped back {} packets", echoed);

    if let Some(stats) = session.get_connection_stats().await {
        info!(
            "Final stats: {} bytes in, {} bytes out, {}s connected to {}",
            stats.bytes_in, stats.bytes_out, stats.duration_seconds, stats.server_ip
        );
    }
    if let Some(counters) = session.counters() {
        info!("Traffic: {}", counters.snapshot().format());
    }

    session.disconnect().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.dispose().await;
    let _ = printer.await;

    info!("tunnelkit shutting down");
    Ok(())
}
