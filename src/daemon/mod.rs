use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;
use server::QueryServer;
use storage::{file_store::FileStore, InMemoryStore, KeyValueStore};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracker::{TrackerHandle, TrackerModule};

use crate::utils::clock::{Clock, DefaultClock};

pub mod args;
pub mod domain;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod tracker;

/// How often accumulated time is checkpointed and persisted. An abrupt termination loses
/// at most this much tracked time.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Represents the starting point for the daemon
pub async fn start_daemon(dir: PathBuf, listen: SocketAddr) -> Result<()> {
    std::env::set_current_dir("/")?;

    let listener = TcpListener::bind(listen).await?;
    let store = open_store(&dir);

    let shutdown_token = CancellationToken::new();

    let (handle, tracker) = create_tracker(store, DefaultClock);
    let server = QueryServer::new(listener, handle, shutdown_token.clone());

    let (_, server_result, tracker_result) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token),
        server.run(),
        tracker.run(),
    );

    if let Err(server_result) = server_result {
        error!("Server module got an error {:?}", server_result);
    }

    if let Err(tracker_result) = tracker_result {
        error!("Tracker module got an error {:?}", tracker_result);
    }

    Ok(())
}

fn create_tracker(
    store: Box<dyn KeyValueStore>,
    clock: impl Clock,
) -> (TrackerHandle, TrackerModule) {
    let (sender, receiver) = mpsc::channel(16);
    let tracker = TrackerModule::new(receiver, store, Box::new(clock), FLUSH_INTERVAL);
    (TrackerHandle::new(sender), tracker)
}

/// Opens file storage under the application directory, degrading to an ephemeral
/// in-memory store when that fails. Tracking then works for the lifetime of the process
/// but nothing survives a restart.
fn open_store(dir: &Path) -> Box<dyn KeyValueStore> {
    match FileStore::new(dir.join("store")) {
        Ok(store) => Box::new(store),
        Err(e) => {
            warn!("File storage unavailable, falling back to in-memory storage {e:?}");
            Box::new(InMemoryStore::default())
        }
    }
}
