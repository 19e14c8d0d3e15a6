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

//! A fully wired daemon over fake collaborators, for tests.

use super::{RuntimeDeps, RuntimeService};
use crate::cni::fake::FakeCni;
use crate::config::CridConfig;
use crate::container::ContainerStore;
use crate::engine::fake::{test_engine_image, FakeEngine};
use crate::engine::Engine;
use crate::events::EventMonitor;
use crate::image::{CriImageService, ImageStore};
use crate::oci::fake::FakeSpecGenerator;
use crate::registrar::NameIndex;
use crate::sandbox::SandboxStore;
use crate::snapshot::SnapshotStore;
use crate::streaming::{StreamingServer, TlsMode};
use api::runtime::{
    ContainerConfig, ContainerMetadata as ApiContainerMetadata,
    LinuxPodSandboxConfig, LinuxSandboxSecurityContext, NamespaceMode,
    NamespaceOption, PodSandboxConfig, PodSandboxMetadata,
};
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) const PAUSE_IMAGE_ID: &str = "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
pub(crate) const BUSYBOX_IMAGE_ID: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub(crate) const BUSYBOX_REF: &str = "docker.io/library/busybox:latest";

pub(crate) struct TestDaemon {
    pub config: Arc<CridConfig>,
    pub engine: Arc<FakeEngine>,
    pub cni: Arc<FakeCni>,
    pub sandboxes: Arc<SandboxStore>,
    pub containers: Arc<ContainerStore>,
    pub images: Arc<ImageStore>,
    pub image_service: Arc<CriImageService>,
    pub sandbox_names: Arc<NameIndex>,
    pub container_names: Arc<NameIndex>,
    pub service: RuntimeService,
    pub shutdown: watch::Sender<()>,
    _tempdir: tempfile::TempDir,
}

/// Builds the daemon over fakes and starts the event monitor loop.
pub(crate) async fn daemon() -> TestDaemon {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(CridConfig::new_for_tests(tempdir.path()));

    let engine = Arc::new(FakeEngine::new());
    engine.add_pullable(
        &config.sandbox_image,
        test_engine_image(PAUSE_IMAGE_ID, &config.sandbox_image),
    );
    engine.add_pullable(
        BUSYBOX_REF,
        test_engine_image(BUSYBOX_IMAGE_ID, BUSYBOX_REF),
    );

    let cni = Arc::new(FakeCni::new());
    let sandboxes = Arc::new(SandboxStore::new());
    let containers = Arc::new(ContainerStore::new());
    let images = Arc::new(ImageStore::new(engine.clone() as Arc<dyn Engine>));
    let snapshots = Arc::new(SnapshotStore::new());
    let image_service = Arc::new(CriImageService::new(
        engine.clone(),
        images.clone(),
        snapshots.clone(),
        config.clone(),
    ));
    let sandbox_names = Arc::new(NameIndex::new());
    let container_names = Arc::new(NameIndex::new());
    let monitor = Arc::new(EventMonitor::new(
        sandboxes.clone(),
        containers.clone(),
        images.clone(),
        engine.clone(),
        config.clone(),
    ));
    let streaming = Arc::new(StreamingServer::new(
        "127.0.0.1:10010".to_string(),
        TlsMode::Disabled,
    ));

    let (shutdown, _) = watch::channel(());
    let _ = monitor.start(shutdown.subscribe()).await;

    let service = RuntimeService::new(RuntimeDeps {
        config: config.clone(),
        engine: engine.clone(),
        cni: cni.clone(),
        spec_generator: Arc::new(FakeSpecGenerator),
        sandboxes: sandboxes.clone(),
        containers: containers.clone(),
        images: images.clone(),
        image_service: image_service.clone(),
        snapshots,
        sandbox_names: sandbox_names.clone(),
        container_names: container_names.clone(),
        monitor,
        streaming,
    });

    TestDaemon {
        config,
        engine,
        cni,
        sandboxes,
        containers,
        images,
        image_service,
        sandbox_names,
        container_names,
        service,
        shutdown,
        _tempdir: tempdir,
    }
}

/// A pod config that shares the host network and IPC namespaces, so
/// tests need no privileges.
pub(crate) fn host_pod_config(name: &str) -> PodSandboxConfig {
    PodSandboxConfig {
        metadata: Some(PodSandboxMetadata {
            name: name.to_string(),
            uid: format!("uid-{name}"),
            namespace: "default".to_string(),
            attempt: 0,
        }),
        hostname: "testhost".to_string(),
        linux: Some(LinuxPodSandboxConfig {
            security_context: Some(LinuxSandboxSecurityContext {
                namespace_options: Some(NamespaceOption {
                    network: NamespaceMode::Node,
                    ipc: NamespaceMode::Node,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn container_config(name: &str) -> ContainerConfig {
    ContainerConfig {
        metadata: Some(ApiContainerMetadata {
            name: name.to_string(),
            attempt: 0,
        }),
        image: Some(api::runtime::ImageSpec {
            image: "busybox".to_string(),
            ..Default::default()
        }),
        command: vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
        ..Default::default()
    }
}

impl TestDaemon {
    /// Pulls busybox so container creation can resolve it.
    pub(crate) async fn pull_busybox(&self) {
        let _ = self
            .image_service
            .pull("busybox", None)
            .await
            .expect("pull busybox");
    }
}
