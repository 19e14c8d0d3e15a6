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

//! Startup reconciliation.
//!
//! The engine's container list is ground truth; checkpoints refine it.
//! Each entry recovers under its own time budget so one hung engine
//! call cannot stall the whole startup, and id-directories with no
//! engine counterpart are removed as orphans.

use crate::checkpoint::{self, STATUS_FILE};
use crate::cni::netns::NetNs;
use crate::config::CridConfig;
use crate::container::{
    Container, ContainerCheckpoint, ContainerIo, ContainerMetadata,
    ContainerStatus, REASON_UNKNOWN,
};
use crate::engine::{
    Engine, EngineContainer, EngineError, TaskState,
    CONTAINER_METADATA_EXTENSION, KIND_CONTAINER, KIND_SANDBOX,
    SANDBOX_METADATA_EXTENSION,
};
use crate::image::ImageStore;
use crate::registrar::NameIndex;
use crate::sandbox::{
    Sandbox, SandboxCheckpoint, SandboxMetadata, SandboxState, SandboxStatus,
};
use crate::container::ContainerStore;
use crate::sandbox::SandboxStore;
use api::runtime::ContainerState;
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

/// Budget for recovering one entity.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("recovery io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Entry(String),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

pub struct RecoveryDeps {
    pub config: Arc<CridConfig>,
    pub engine: Arc<dyn Engine>,
    pub sandboxes: Arc<SandboxStore>,
    pub containers: Arc<ContainerStore>,
    pub images: Arc<ImageStore>,
    pub sandbox_names: Arc<NameIndex>,
    pub container_names: Arc<NameIndex>,
}

impl std::fmt::Debug for RecoveryDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryDeps").finish_non_exhaustive()
    }
}

/// Reconciles the stores with the engine and cleans orphaned
/// directories. Individual entries that cannot be recovered are logged
/// and skipped; only listing failures abort startup.
pub async fn recover(deps: &RecoveryDeps) -> Result<()> {
    let engine_sandboxes =
        deps.engine.list_containers(KIND_SANDBOX).await?;
    for engine_container in &engine_sandboxes {
        let id = engine_container.id.clone();
        match timeout(
            RECOVERY_TIMEOUT,
            recover_sandbox(deps, engine_container),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("skipping sandbox \"{id}\": {e}"),
            Err(_) => warn!("skipping sandbox \"{id}\": recovery timed out"),
        }
    }

    let engine_containers =
        deps.engine.list_containers(KIND_CONTAINER).await?;
    for engine_container in &engine_containers {
        let id = engine_container.id.clone();
        match timeout(
            RECOVERY_TIMEOUT,
            recover_container(deps, engine_container),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("skipping container \"{id}\": {e}"),
            Err(_) => {
                warn!("skipping container \"{id}\": recovery timed out")
            }
        }
    }

    match deps.engine.list_images().await {
        Ok(images) => {
            for image in images {
                if let Err(e) = deps.images.update(&image.name).await {
                    warn!("failed to re-index image \"{}\": {e}", image.name);
                }
            }
        }
        Err(e) => warn!("failed to list engine images: {e}"),
    }

    let sandbox_ids: HashSet<String> =
        engine_sandboxes.iter().map(|c| c.id.clone()).collect();
    let container_ids: HashSet<String> =
        engine_containers.iter().map(|c| c.id.clone()).collect();
    remove_orphans(&deps.config.root_dir.join("sandboxes"), &sandbox_ids)
        .await;
    remove_orphans(&deps.config.state_dir.join("sandboxes"), &sandbox_ids)
        .await;
    remove_orphans(&deps.config.root_dir.join("containers"), &container_ids)
        .await;
    remove_orphans(&deps.config.state_dir.join("containers"), &container_ids)
        .await;
    Ok(())
}

async fn recover_sandbox(
    deps: &RecoveryDeps,
    engine_container: &EngineContainer,
) -> Result<()> {
    let id = &engine_container.id;
    let Some(extension) =
        engine_container.extensions.get(SANDBOX_METADATA_EXTENSION)
    else {
        warn!("sandbox \"{id}\" has no metadata extension, skipping");
        return Ok(());
    };
    let metadata: SandboxMetadata =
        serde_json::from_value(extension.clone()).map_err(|e| {
            RecoveryError::Entry(format!("bad sandbox metadata: {e}"))
        })?;

    let checkpoint_path =
        deps.config.sandbox_root(id).join(STATUS_FILE);
    let mut status =
        match checkpoint::load::<SandboxCheckpoint>(&checkpoint_path).await {
            Ok(cp) => cp.status,
            Err(e) => {
                if !e.is_not_found() {
                    warn!("sandbox \"{id}\" checkpoint unreadable: {e}");
                }
                SandboxStatus {
                    state: SandboxState::Unknown,
                    pid: 0,
                    created_at: engine_container.created_at,
                }
            }
        };

    match deps.engine.task_status(id).await {
        Err(e) if e.is_not_found() => {
            status.state = SandboxState::NotReady;
            status.pid = 0;
        }
        Err(e) => return Err(e.into()),
        Ok(task) => match task.state {
            TaskState::Running => {
                if pid_alive(task.pid) {
                    status.state = SandboxState::Ready;
                    status.pid = task.pid;
                } else {
                    status.state = SandboxState::Unknown;
                }
            }
            TaskState::Created | TaskState::Stopped => {
                match deps.engine.delete_task(id).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                status.state = SandboxState::NotReady;
                status.pid = 0;
            }
            TaskState::Unknown => status.state = SandboxState::Unknown,
        },
    }

    let netns = if !metadata.netns_path.is_empty()
        && Path::new(&metadata.netns_path).exists()
    {
        Some(Arc::new(NetNs::load(metadata.netns_path.clone().into())))
    } else {
        None
    };

    if let Err(e) = deps.sandbox_names.reserve(&metadata.name, id) {
        return Err(RecoveryError::Entry(format!(
            "sandbox name conflict: {e}"
        )));
    }

    let state = status.state;
    let sandbox = Sandbox::new(metadata, status, netns);
    if state != SandboxState::Ready {
        sandbox.stopped.signal();
    }
    deps.sandboxes
        .add(sandbox)
        .await
        .map_err(|e| RecoveryError::Entry(e.to_string()))?;
    info!("recovered sandbox \"{id}\" in state {state:?}");
    Ok(())
}

async fn recover_container(
    deps: &RecoveryDeps,
    engine_container: &EngineContainer,
) -> Result<()> {
    let id = &engine_container.id;
    let Some(extension) =
        engine_container.extensions.get(CONTAINER_METADATA_EXTENSION)
    else {
        warn!("container \"{id}\" has no metadata extension, skipping");
        return Ok(());
    };
    let metadata: ContainerMetadata =
        serde_json::from_value(extension.clone()).map_err(|e| {
            RecoveryError::Entry(format!("bad container metadata: {e}"))
        })?;

    let checkpoint_path =
        deps.config.container_root(id).join(STATUS_FILE);
    let mut status =
        match checkpoint::load::<ContainerCheckpoint>(&checkpoint_path).await
        {
            Ok(cp) => cp.status,
            Err(e) => {
                if !e.is_not_found() {
                    warn!("container \"{id}\" checkpoint unreadable: {e}");
                }
                let mut status =
                    ContainerStatus::new(engine_container.created_at);
                status.unknown = true;
                status
            }
        };

    let mut io = None;
    match deps.engine.task_status(id).await {
        Err(e) if e.is_not_found() => match status.state() {
            ContainerState::Created => {
                io = Some(rebuild_io(deps, &metadata)?);
            }
            ContainerState::Running | ContainerState::Unknown => {
                status.finished_at = Some(Utc::now());
                status.exit_code = 255;
                status.pid = 0;
                status.unknown = false;
                if status.reason.is_empty() {
                    status.reason = REASON_UNKNOWN.to_string();
                }
            }
            ContainerState::Exited => {}
        },
        Err(e) => return Err(e.into()),
        Ok(task) => match task.state {
            TaskState::Created => {
                // A created-but-never-started task is stale after a
                // restart; only a Created checkpoint can explain it.
                match deps.engine.delete_task(id).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                if status.state() != ContainerState::Created {
                    return Err(RecoveryError::Entry(format!(
                        "task created but status is {:?}",
                        status.state()
                    )));
                }
                io = Some(rebuild_io(deps, &metadata)?);
            }
            TaskState::Running => {
                status.unknown = false;
                if status.started_at.is_none() {
                    status.started_at = Some(Utc::now());
                }
                status.pid = task.pid;
                if !pid_alive(task.pid) {
                    status.unknown = true;
                }
            }
            TaskState::Stopped => {
                let exit = match deps.engine.delete_task(id).await {
                    Ok(exit) => Some(exit),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e.into()),
                };
                status.unknown = false;
                status.pid = 0;
                if status.finished_at.is_none() {
                    if let Some(exit) = exit {
                        status.finished_at = Some(exit.exited_at);
                        status.exit_code = exit.exit_code;
                    } else {
                        status.finished_at = Some(Utc::now());
                        status.exit_code = 255;
                    }
                }
            }
            TaskState::Unknown => status.unknown = true,
        },
    }

    if let Err(e) = deps.container_names.reserve(&metadata.name, id) {
        return Err(RecoveryError::Entry(format!(
            "container name conflict: {e}"
        )));
    }

    let state = status.state();
    let container = Container::new(metadata, status, io);
    if matches!(state, ContainerState::Exited) {
        container.stopped.signal();
    }
    deps.containers
        .add(container)
        .await
        .map_err(|e| RecoveryError::Entry(e.to_string()))?;
    info!("recovered container \"{id}\" in state {state:?}");
    Ok(())
}

fn rebuild_io(
    deps: &RecoveryDeps,
    metadata: &ContainerMetadata,
) -> Result<Arc<ContainerIo>> {
    let io = ContainerIo::new(
        &deps.config.container_state(&metadata.id).join("io"),
        metadata.config.tty,
        metadata.config.stdin,
    )?;
    Ok(Arc::new(io))
}

fn pid_alive(pid: u32) -> bool {
    procfs::process::Process::new(pid as i32).is_ok()
}

async fn remove_orphans(dir: &Path, known: &HashSet<String>) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if known.contains(&name) {
            continue;
        }
        info!("removing orphaned directory {}", entry.path().display());
        if let Err(e) =
            crate::fsutil::remove_all_with_retry(&entry.path()).await
        {
            warn!("failed to remove orphan {}: {e}", entry.path().display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::container::testing::test_metadata as container_metadata;
    use crate::engine::fake::FakeEngine;
    use crate::engine::TaskStatus;
    use crate::sandbox::sandbox::testing::test_metadata as sandbox_metadata;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct Fixture {
        deps: RecoveryDeps,
        engine: Arc<FakeEngine>,
        _tempdir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(CridConfig::new_for_tests(tempdir.path()));
        let engine = Arc::new(FakeEngine::new());
        let deps = RecoveryDeps {
            config,
            engine: engine.clone(),
            sandboxes: Arc::new(SandboxStore::new()),
            containers: Arc::new(ContainerStore::new()),
            images: Arc::new(ImageStore::new(engine.clone())),
            sandbox_names: Arc::new(NameIndex::new()),
            container_names: Arc::new(NameIndex::new()),
        };
        Fixture { deps, engine, _tempdir: tempdir }
    }

    fn engine_sandbox(metadata: &SandboxMetadata) -> EngineContainer {
        let mut extensions = HashMap::new();
        let _ = extensions.insert(
            SANDBOX_METADATA_EXTENSION.to_string(),
            serde_json::to_value(metadata).expect("metadata json"),
        );
        let mut labels = HashMap::new();
        let _ = labels.insert(
            crate::engine::KIND_LABEL.to_string(),
            KIND_SANDBOX.to_string(),
        );
        EngineContainer {
            id: metadata.id.clone(),
            image_id: String::new(),
            snapshot_key: metadata.id.clone(),
            labels,
            extensions,
            created_at: Utc::now(),
            spec: None,
        }
    }

    fn engine_app_container(
        metadata: &ContainerMetadata,
    ) -> EngineContainer {
        let mut extensions = HashMap::new();
        let _ = extensions.insert(
            CONTAINER_METADATA_EXTENSION.to_string(),
            serde_json::to_value(metadata).expect("metadata json"),
        );
        let mut labels = HashMap::new();
        let _ = labels.insert(
            crate::engine::KIND_LABEL.to_string(),
            KIND_CONTAINER.to_string(),
        );
        EngineContainer {
            id: metadata.id.clone(),
            image_id: metadata.image_ref.clone(),
            snapshot_key: metadata.id.clone(),
            labels,
            extensions,
            created_at: Utc::now(),
            spec: None,
        }
    }

    fn running_task(pid: u32) -> TaskStatus {
        TaskStatus {
            state: TaskState::Running,
            pid,
            exit_code: 0,
            created_at: Utc::now(),
            exited_at: None,
        }
    }

    #[tokio::test]
    async fn test_ready_sandbox_with_running_task_recovers_ready() {
        let f = fixture();
        let metadata = sandbox_metadata("s1", "nginx_default_u_0");
        f.engine.insert_container(engine_sandbox(&metadata));
        // Our own pid is certainly alive.
        let pid = std::process::id();
        f.engine.insert_task("s1", running_task(pid));
        checkpoint::store(
            &f.deps.config.sandbox_root("s1").join(STATUS_FILE),
            &SandboxCheckpoint {
                metadata: metadata.clone(),
                status: SandboxStatus {
                    state: SandboxState::Ready,
                    pid,
                    created_at: Utc::now(),
                },
            },
        )
        .await
        .expect("checkpoint");

        recover(&f.deps).await.expect("recover");

        let sandbox = f.deps.sandboxes.get("s1").await.expect("recovered");
        let status = sandbox.status.get().await;
        assert_eq!(status.state, SandboxState::Ready);
        assert_eq!(status.pid, pid);
        assert!(f.deps.sandbox_names.is_reserved("nginx_default_u_0"));
    }

    #[tokio::test]
    async fn test_orphan_directories_are_removed() {
        let f = fixture();
        let metadata = sandbox_metadata("s1", "nginx_default_u_0");
        f.engine.insert_container(engine_sandbox(&metadata));
        f.engine.insert_task("s1", running_task(std::process::id()));

        let kept = f.deps.config.sandbox_root("s1");
        let orphan = f.deps.config.sandbox_root("dead");
        tokio::fs::create_dir_all(&kept).await.expect("kept dir");
        tokio::fs::create_dir_all(&orphan).await.expect("orphan dir");

        recover(&f.deps).await.expect("recover");

        assert!(kept.exists());
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_container_task_gone_while_running_becomes_unknown_exit() {
        let f = fixture();
        let metadata = container_metadata("c1", "app_nginx_default_u_0", "s1");
        f.engine.insert_container(engine_app_container(&metadata));
        let mut status = ContainerStatus::new(Utc::now());
        status.started_at = Some(Utc::now());
        status.pid = 12345;
        checkpoint::store(
            &f.deps.config.container_root("c1").join(STATUS_FILE),
            &ContainerCheckpoint { metadata: metadata.clone(), status },
        )
        .await
        .expect("checkpoint");

        recover(&f.deps).await.expect("recover");

        let container = f.deps.containers.get("c1").await.expect("recovered");
        let status = container.status.get().await;
        assert_eq!(status.state(), ContainerState::Exited);
        assert_eq!(status.exit_code, 255);
        assert_eq!(status.reason, REASON_UNKNOWN);
        assert!(container.stopped.is_stopped());
    }

    #[tokio::test]
    async fn test_created_container_rebuilds_io() {
        let f = fixture();
        let metadata = container_metadata("c1", "app_nginx_default_u_0", "s1");
        f.engine.insert_container(engine_app_container(&metadata));
        checkpoint::store(
            &f.deps.config.container_root("c1").join(STATUS_FILE),
            &ContainerCheckpoint {
                metadata: metadata.clone(),
                status: ContainerStatus::new(Utc::now()),
            },
        )
        .await
        .expect("checkpoint");

        recover(&f.deps).await.expect("recover");

        let container = f.deps.containers.get("c1").await.expect("recovered");
        assert_eq!(
            container.status.get().await.state(),
            ContainerState::Created
        );
        let io = container.io.as_ref().expect("io rebuilt");
        assert!(io.task_io().stdout.expect("stdout fifo").exists());
    }

    #[tokio::test]
    async fn test_stopped_task_exit_is_recorded_from_engine() {
        let f = fixture();
        let metadata = container_metadata("c1", "app_nginx_default_u_0", "s1");
        f.engine.insert_container(engine_app_container(&metadata));
        f.engine.insert_task(
            "c1",
            TaskStatus {
                state: TaskState::Stopped,
                pid: 77,
                exit_code: 3,
                created_at: Utc::now(),
                exited_at: Some(Utc::now()),
            },
        );
        let mut status = ContainerStatus::new(Utc::now());
        status.started_at = Some(Utc::now());
        checkpoint::store(
            &f.deps.config.container_root("c1").join(STATUS_FILE),
            &ContainerCheckpoint { metadata: metadata.clone(), status },
        )
        .await
        .expect("checkpoint");

        recover(&f.deps).await.expect("recover");

        let container = f.deps.containers.get("c1").await.expect("recovered");
        let status = container.status.get().await;
        assert_eq!(status.state(), ContainerState::Exited);
        assert_eq!(status.exit_code, 3);
        // The stale engine task was deleted.
        assert!(!f.engine.has_task("c1"));
    }

    #[tokio::test]
    async fn test_missing_checkpoint_marks_unknown_then_settles() {
        let f = fixture();
        let metadata = container_metadata("c1", "app_nginx_default_u_0", "s1");
        f.engine.insert_container(engine_app_container(&metadata));
        // No checkpoint, no task: the entry settles as an unknown exit.

        recover(&f.deps).await.expect("recover");

        let container = f.deps.containers.get("c1").await.expect("recovered");
        let status = container.status.get().await;
        assert_eq!(status.state(), ContainerState::Exited);
        assert_eq!(status.exit_code, 255);
    }

    #[tokio::test]
    async fn test_images_are_reindexed() {
        let f = fixture();
        f.engine.insert_image(crate::engine::fake::test_engine_image(
            "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "docker.io/library/busybox:latest",
        ));

        recover(&f.deps).await.expect("recover");

        assert!(f.deps.images.resolve("busybox").await.is_ok());
    }
}
