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

//! # crid
//!
//! The lifecycle core of a CRI daemon: pod sandboxes and application
//! containers over an embedded OCI engine, a CNI plugin layer, and an
//! external OCI spec generator.
//!
//! The crate serves the [`api::runtime::RuntimeService`] and
//! [`api::image::ImageService`] contracts. The gRPC transport, the
//! engine, CNI, and spec generation are collaborators the embedding
//! daemon shell provides; [`Crid::start`] wires the stores, recovers
//! persisted state against the engine's ground truth, and runs the
//! event monitor that drives asynchronous state transitions.

// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
#![warn(clippy::unwrap_used)]

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod checkpoint;
pub mod cni;
pub mod config;
pub mod container;
pub mod engine;
pub mod events;
pub mod graceful_shutdown;
pub mod image;
pub mod logging;
pub mod oci;
pub mod recovery;
pub mod registrar;
pub mod runtime;
pub mod sandbox;
pub mod snapshot;
pub mod status;
pub mod streaming;

mod fsutil;
mod ident;

pub use config::CridConfig;

use cni::Cni;
use container::ContainerStore;
use engine::Engine;
use events::EventMonitor;
use image::{CriImageService, ImageStore};
use oci::SpecGenerator;
use recovery::RecoveryDeps;
use registrar::NameIndex;
use runtime::{RuntimeDeps, RuntimeService};
use sandbox::SandboxStore;
use snapshot::SnapshotStore;
use streaming::StreamingServer;

/// The external collaborators the embedding daemon shell provides.
pub struct Collaborators {
    pub engine: Arc<dyn Engine>,
    pub cni: Arc<dyn Cni>,
    pub spec_generator: Arc<dyn SpecGenerator>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// The daemon root object: owns the stores, the services, and the
/// background loops.
pub struct Crid {
    runtime: Arc<RuntimeService>,
    images: Arc<CriImageService>,
    shutdown: watch::Sender<()>,
    monitor_loop: JoinHandle<()>,
    syncer_loop: JoinHandle<()>,
}

impl std::fmt::Debug for Crid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crid").finish_non_exhaustive()
    }
}

impl Crid {
    /// Brings the daemon core up: directories, stores, recovery against
    /// the engine, the event monitor, and the snapshot syncer.
    pub async fn start(
        config: CridConfig,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let Collaborators { engine, cni, spec_generator } = collaborators;

        for dir in [
            config.root_dir.join("sandboxes"),
            config.root_dir.join("containers"),
            config.state_dir.join("sandboxes"),
            config.state_dir.join("containers"),
        ] {
            tokio::fs::create_dir_all(&dir).await.with_context(|| {
                format!("failed to create {}", dir.display())
            })?;
        }

        let sandboxes = Arc::new(SandboxStore::new());
        let containers = Arc::new(ContainerStore::new());
        let images = Arc::new(ImageStore::new(engine.clone()));
        let snapshots = Arc::new(SnapshotStore::new());
        let sandbox_names = Arc::new(NameIndex::new());
        let container_names = Arc::new(NameIndex::new());
        let image_service = Arc::new(CriImageService::new(
            engine.clone(),
            images.clone(),
            snapshots.clone(),
            config.clone(),
        ));

        recovery::recover(&RecoveryDeps {
            config: config.clone(),
            engine: engine.clone(),
            sandboxes: sandboxes.clone(),
            containers: containers.clone(),
            images: images.clone(),
            sandbox_names: sandbox_names.clone(),
            container_names: container_names.clone(),
        })
        .await
        .context("startup recovery failed")?;

        let monitor = Arc::new(EventMonitor::new(
            sandboxes.clone(),
            containers.clone(),
            images.clone(),
            engine.clone(),
            config.clone(),
        ));
        let (shutdown, _) = watch::channel(());
        let monitor_loop = monitor.start(shutdown.subscribe()).await;
        let syncer_loop = snapshot::start_syncer(
            engine.clone(),
            snapshots.clone(),
            config.snapshotter.clone(),
            shutdown.subscribe(),
        );

        let streaming = Arc::new(StreamingServer::new(
            config.stream.address.clone(),
            config.stream.tls.clone(),
        ));

        let runtime = Arc::new(RuntimeService::new(RuntimeDeps {
            config: config.clone(),
            engine,
            cni,
            spec_generator,
            sandboxes,
            containers,
            images,
            image_service: image_service.clone(),
            snapshots,
            sandbox_names,
            container_names,
            monitor,
            streaming,
        }));

        info!("crid core is up (root: {})", config.root_dir.display());
        Ok(Self {
            runtime,
            images: image_service,
            shutdown,
            monitor_loop,
            syncer_loop,
        })
    }

    /// The runtime half of the CRI surface, for the transport wrapper.
    pub fn runtime_service(&self) -> Arc<RuntimeService> {
        self.runtime.clone()
    }

    /// The image half of the CRI surface, for the transport wrapper.
    pub fn image_service(&self) -> Arc<CriImageService> {
        self.images.clone()
    }

    /// Broadcasts shutdown and drains the background loops within the
    /// stream server's drain budget.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let drain = streaming::SHUTDOWN_TIMEOUT;
        if tokio::time::timeout(drain, self.monitor_loop).await.is_err() {
            warn!("event monitor did not drain in time");
        }
        if tokio::time::timeout(drain, self.syncer_loop).await.is_err() {
            warn!("snapshot syncer did not drain in time");
        }
        info!("crid core is down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::fake::FakeCni;
    use crate::engine::fake::FakeEngine;
    use crate::oci::fake::FakeSpecGenerator;
    use api::runtime::{RuntimeService as _, VersionRequest};

    #[tokio::test]
    async fn test_start_and_shutdown_round_trip() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let config = CridConfig::new_for_tests(tempdir.path());

        let crid = Crid::start(
            config,
            Collaborators {
                engine: Arc::new(FakeEngine::new()),
                cni: Arc::new(FakeCni::new()),
                spec_generator: Arc::new(FakeSpecGenerator),
            },
        )
        .await
        .expect("start");

        assert!(tempdir.path().join("root").join("sandboxes").is_dir());

        let version = crid
            .runtime_service()
            .version(VersionRequest::default())
            .await
            .expect("version");
        assert_eq!(version.runtime_name, "crid");

        crid.shutdown().await;
    }
}
