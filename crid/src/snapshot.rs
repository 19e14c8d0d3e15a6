/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Cached snapshot usage.
//!
//! Stats and image-filesystem reports read from this cache instead of
//! hitting the snapshotter on every RPC; a periodic syncer refreshes it
//! from the engine.

use crate::engine::{Engine, SnapshotUsage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// In-memory snapshot usage index keyed by snapshot key.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: RwLock<HashMap<String, SnapshotUsage>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<SnapshotUsage> {
        self.snapshots.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<SnapshotUsage> {
        self.snapshots.read().await.values().cloned().collect()
    }

    /// Replaces the cache wholesale with a fresh engine listing.
    pub async fn replace_all(&self, snapshots: Vec<SnapshotUsage>) {
        let mut map = self.snapshots.write().await;
        map.clear();
        for snapshot in snapshots {
            let _ = map.insert(snapshot.key.clone(), snapshot);
        }
    }

    /// Total (bytes, inodes) across every cached snapshot.
    pub async fn totals(&self) -> (u64, u64) {
        let snapshots = self.snapshots.read().await;
        snapshots
            .values()
            .fold((0, 0), |(b, i), s| (b + s.size, i + s.inodes))
    }
}

/// Spawns the periodic refresh loop; exits on shutdown broadcast.
pub fn start_syncer(
    engine: Arc<dyn Engine>,
    store: Arc<SnapshotStore>,
    snapshotter: String,
    mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match engine.list_snapshots(&snapshotter).await {
                        Ok(snapshots) => store.replace_all(snapshots).await,
                        Err(e) => {
                            warn!("snapshot sync failed: {e}");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn usage(key: &str, size: u64, inodes: u64) -> SnapshotUsage {
        SnapshotUsage { key: key.into(), timestamp: Utc::now(), size, inodes }
    }

    #[tokio::test]
    async fn test_replace_all_and_totals() {
        let store = SnapshotStore::new();
        store
            .replace_all(vec![usage("a", 100, 3), usage("b", 50, 2)])
            .await;
        assert_eq!(store.totals().await, (150, 5));

        store.replace_all(vec![usage("a", 10, 1)]).await;
        assert_eq!(store.totals().await, (10, 1));
        assert!(store.get("b").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_syncer_refreshes_from_engine() {
        let engine = Arc::new(crate::engine::fake::FakeEngine::new());
        engine.set_snapshots(vec![usage("layer-1", 4096, 12)]);

        let store = Arc::new(SnapshotStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = start_syncer(
            engine.clone(),
            store.clone(),
            "overlayfs".into(),
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.get("layer-1").await.is_some());

        shutdown_tx.send(()).expect("shutdown");
        handle.await.expect("syncer exits");
    }
}
