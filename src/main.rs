//! switchd: a line protocol server
//!
//! Runs the connection server and its maintenance threads:
//! - `10_httpd`: accepts connections, one session thread each
//! - `accesstracker_cleanup`: prunes the access tracker
//!
//! Settings live in a persisted store seeded from CLI arguments and an
//! optional TOML file.

use std::sync::Arc;
use switchd::config::{Config, HTTPD_THREAD};
use switchd::protocols;
use switchd::server::ConnectionServer;
use switchd::store::ConfigStore;
use switchd::switchboard::{CleanupJob, Switchboard, ThreadDefaults, ACCESS_CLEANUP_THREAD};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Capacity of the switchboard handoff queue.
const QUEUE_CAPACITY: usize = 1024;

/// Startup delay of the access tracker clean-up, in milliseconds.
const CLEANUP_STARTUP_DELAY: i64 = 10_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(store = %config.store_path.display(), "Starting switchd");

    let store = Arc::new(ConfigStore::open(&config.store_path, config.settings.clone())?);
    store.set_all(&config.overrides);

    let switchboard: Arc<Switchboard<String>> =
        Arc::new(Switchboard::new(Arc::clone(&store), QUEUE_CAPACITY));

    let busy = Arc::downgrade(&switchboard);
    let server = ConnectionServer::builder(HTTPD_THREAD, protocols::standard())
        .on_busy(Arc::new(move |jobs| {
            if let Some(switchboard) = busy.upgrade() {
                switchboard.handle_busy_state(jobs);
            }
        }))
        .access_tracker(Arc::clone(switchboard.access_tracker()))
        .build(Arc::clone(&store))?;
    let handle = server.handle();

    let httpd = switchboard.deploy_thread(
        HTTPD_THREAD,
        server,
        ThreadDefaults {
            idle_sleep: 0,
            busy_sleep: 0,
            memory_prerequisite: 0,
        },
        0,
    )?;
    switchboard.deploy_thread(
        ACCESS_CLEANUP_THREAD,
        CleanupJob::new(Arc::clone(switchboard.access_tracker())),
        ThreadDefaults {
            idle_sleep: 60_000,
            busy_sleep: 60_000,
            memory_prerequisite: 0,
        },
        CLEANUP_STARTUP_DELAY,
    )?;

    info!(
        address = ?handle.local_addr(),
        tls = handle.is_encrypted(),
        max_sessions = handle.max_sessions(),
        "Server ready"
    );

    httpd.join();
    switchboard.terminate_all_threads(true);
    info!("Server stopped");
    Ok(())
}
