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

//! The embedded OCI engine contract.
//!
//! crid never executes container processes itself; it drives an engine
//! that owns content, snapshots, containers and tasks, and that emits
//! the exit/OOM/image event stream the event monitor consumes. The
//! engine is a typed collaborator: the daemon is generic over any
//! [`Engine`] implementation.

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use oci_spec::image::ImageConfiguration;
use oci_spec::runtime::{LinuxResources, Spec};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[cfg(test)]
pub(crate) mod fake;

/// Label every engine container created by crid carries, marking which
/// side of the pod it belongs to.
pub const KIND_LABEL: &str = "dev.aurae.crid/kind";
pub const KIND_SANDBOX: &str = "sandbox";
pub const KIND_CONTAINER: &str = "container";

/// Extension URIs for the serialized CRI-private metadata blobs.
pub const SANDBOX_METADATA_EXTENSION: &str = "dev.aurae.crid/sandbox.metadata";
pub const CONTAINER_METADATA_EXTENSION: &str =
    "dev.aurae.crid/container.metadata";

/// Label marking an engine image as managed by crid.
pub const IMAGE_MANAGED_LABEL: &str = "dev.aurae.crid/managed";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Converts not-found into success; cleanup paths treat an entity that
/// is already gone as removed.
pub fn ok_if_not_found<T>(res: Result<T>) -> Result<Option<T>> {
    match res {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Everything the engine needs to create a container record.
#[derive(Debug, Clone)]
pub struct ContainerCreateOpts {
    pub id: String,
    pub image_id: String,
    pub snapshotter: String,
    pub snapshot_key: String,
    pub spec: Spec,
    pub runtime_handler: String,
    pub labels: HashMap<String, String>,
    /// Extension blobs keyed by URI, e.g. the CRI metadata.
    pub extensions: HashMap<String, serde_json::Value>,
}

/// The engine's view of a container record.
#[derive(Debug, Clone)]
pub struct EngineContainer {
    pub id: String,
    pub image_id: String,
    pub snapshot_key: String,
    pub labels: HashMap<String, String>,
    pub extensions: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub spec: Option<Spec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Stopped,
    Unknown,
}

/// A point-in-time observation of a task or exec process.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    pub pid: u32,
    pub exit_code: i32,
    pub created_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

/// FIFO endpoints handed to the engine when creating a task or exec
/// process. `None` wires the stream to the null device.
#[derive(Debug, Clone, Default)]
pub struct TaskIo {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub terminal: bool,
}

impl TaskIo {
    pub fn null() -> Self {
        Self::default()
    }
}

/// The process definition for an exec.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub terminal: bool,
}

/// The terminal observation of a task: who, when, and with what code.
#[derive(Debug, Clone)]
pub struct TaskExit {
    pub container_id: String,
    /// Process id within the container: equals `container_id` for the
    /// init process, the exec id otherwise.
    pub id: String,
    pub pid: u32,
    pub exit_code: i32,
    pub exited_at: DateTime<Utc>,
}

/// Resolves once, when the observed process exits.
pub type ExitWaiter = oneshot::Receiver<TaskExit>;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    TaskExit(TaskExit),
    TaskOom { container_id: String },
    ImageCreate { name: String },
    ImageUpdate { name: String },
    ImageDelete { name: String },
}

impl EngineEvent {
    /// The stable id backoff and dedup key on. Events without one are
    /// dropped by the monitor.
    pub fn subject(&self) -> Option<&str> {
        match self {
            EngineEvent::TaskExit(exit) if !exit.container_id.is_empty() => {
                Some(&exit.container_id)
            }
            EngineEvent::TaskExit(_) => None,
            EngineEvent::TaskOom { container_id }
                if !container_id.is_empty() =>
            {
                Some(container_id)
            }
            EngineEvent::TaskOom { .. } => None,
            EngineEvent::ImageCreate { name }
            | EngineEvent::ImageUpdate { name }
            | EngineEvent::ImageDelete { name }
                if !name.is_empty() =>
            {
                Some(name)
            }
            _ => None,
        }
    }
}

/// The engine's view of an image reference record.
#[derive(Debug, Clone)]
pub struct EngineImage {
    /// Image id: the digest of the image config.
    pub id: String,
    /// The reference this record indexes (tag or digest form).
    pub name: String,
    pub chain_id: String,
    pub size: i64,
    pub config: ImageConfiguration,
    pub labels: HashMap<String, String>,
}

/// Cached usage for an image layer or container writable layer.
#[derive(Debug, Clone)]
pub struct SnapshotUsage {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub inodes: u64,
}

/// One stats sample for a live task.
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_nanos: u64,
    pub memory_working_set_bytes: u64,
}

/// Credentials resolved for a pull, in the engine's terms.
#[derive(Debug, Clone)]
pub enum PullCredentials {
    Basic { username: String, password: String },
    IdentityToken(String),
    RegistryToken(String),
}

#[derive(Debug, Clone, Default)]
pub struct PullOpts {
    /// Registry host to resolve against, e.g. a configured mirror.
    pub host: String,
    pub credentials: Option<PullCredentials>,
    pub snapshotter: String,
    pub max_concurrent_downloads: usize,
}

/// The embedded OCI container engine.
///
/// Exec processes are addressed by `(container_id, exec_id)`; the init
/// process is addressed by the container id alone.
#[tonic::async_trait]
pub trait Engine: Send + Sync + 'static {
    // -- containers -------------------------------------------------------

    async fn create_container(&self, opts: ContainerCreateOpts) -> Result<()>;
    async fn get_container(&self, id: &str) -> Result<EngineContainer>;
    /// Lists containers whose kind label matches `kind`.
    async fn list_containers(&self, kind: &str) -> Result<Vec<EngineContainer>>;
    async fn update_container_spec(&self, id: &str, spec: Spec) -> Result<()>;
    /// Deletes the container record and its snapshot.
    async fn delete_container(&self, id: &str) -> Result<()>;

    // -- tasks ------------------------------------------------------------

    async fn create_task(&self, container_id: &str, io: TaskIo)
        -> Result<TaskStatus>;
    async fn start_task(&self, container_id: &str) -> Result<()>;
    async fn task_status(&self, container_id: &str) -> Result<TaskStatus>;
    async fn kill_task(
        &self,
        container_id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<()>;
    /// Deletes the task, returning its terminal observation.
    async fn delete_task(&self, container_id: &str) -> Result<TaskExit>;
    /// Registers interest in the task's exit before it happens.
    async fn wait_task(&self, container_id: &str) -> Result<ExitWaiter>;
    async fn update_task_resources(
        &self,
        container_id: &str,
        resources: LinuxResources,
    ) -> Result<()>;
    async fn resize_task_pty(
        &self,
        container_id: &str,
        exec_id: Option<&str>,
        width: u16,
        height: u16,
    ) -> Result<()>;

    // -- exec processes ---------------------------------------------------

    async fn create_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        spec: ExecSpec,
        io: TaskIo,
    ) -> Result<()>;
    async fn start_exec(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<TaskStatus>;
    async fn kill_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        signal: Signal,
    ) -> Result<()>;
    async fn delete_exec(&self, container_id: &str, exec_id: &str)
        -> Result<()>;
    async fn wait_exec(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<ExitWaiter>;

    // -- images -----------------------------------------------------------

    async fn get_image(&self, reference: &str) -> Result<EngineImage>;
    async fn list_images(&self) -> Result<Vec<EngineImage>>;
    /// Pulls and unpacks `reference` through `opts.host`.
    async fn pull_image(
        &self,
        reference: &str,
        opts: PullOpts,
    ) -> Result<EngineImage>;
    /// Imports images from a local tar archive.
    async fn import_images(&self, tar_path: &str) -> Result<Vec<EngineImage>>;
    /// Creates or repoints a reference record at an image id.
    async fn tag_image(&self, name: &str, id: &str) -> Result<()>;
    async fn label_image(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;
    async fn delete_image(&self, name: &str) -> Result<()>;

    // -- snapshots & stats ------------------------------------------------

    async fn list_snapshots(
        &self,
        snapshotter: &str,
    ) -> Result<Vec<SnapshotUsage>>;
    async fn task_metrics(&self, container_id: &str) -> Result<TaskMetrics>;

    // -- events -----------------------------------------------------------

    /// Subscribes to the exit/OOM/image event stream. Transient engine
    /// errors arrive in-band.
    fn subscribe(&self) -> mpsc::Receiver<std::result::Result<EngineEvent, EngineError>>;
}
