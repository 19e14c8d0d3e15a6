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

//! The lifecycle controller: the runtime half of the CRI surface.
//!
//! The [`RuntimeService`] value owns nothing global; every dependency
//! is a field passed down at construction (stores, registrars, the
//! engine, CNI, the spec generator, the event monitor). Each operation
//! lives in its own module; this one wires the RPC surface to them.

use crate::cni::{AttachmentLabels, Cni};
use crate::config::CridConfig;
use crate::container::ContainerStore;
use crate::engine::Engine;
use crate::events::EventMonitor;
use crate::image::{CriImageService, ImageStore};
use crate::oci::SpecGenerator;
use crate::registrar::NameIndex;
use crate::sandbox::SandboxStore;
use crate::snapshot::SnapshotStore;
use crate::streaming::{
    attach::AttachIo, exec::ExecIo, exec::ExecParams, SessionRequest,
    StreamError, StreamingServer,
};
use api::runtime::{self as cri, RuntimeService as RuntimeServiceContract};
use self::error::RuntimeServiceError;
use std::sync::Arc;
use std::time::Duration;
use tonic::Status;

pub use self::error::RuntimeServiceError as Error;

mod container_create;
mod container_remove;
mod container_start;
mod container_stop;
mod container_update;
mod error;
mod queries;
mod sandbox_remove;
mod sandbox_run;
mod sandbox_stop;
mod undo;

#[cfg(test)]
pub(crate) mod testing;

const RUNTIME_NAME: &str = "crid";
const RUNTIME_API_VERSION: &str = "v1alpha2";
const KUBE_API_VERSION: &str = "0.1.0";

/// Serves the pod sandbox and container half of the CRI surface.
pub struct RuntimeService {
    config: Arc<CridConfig>,
    engine: Arc<dyn Engine>,
    cni: Arc<dyn Cni>,
    spec_generator: Arc<dyn SpecGenerator>,
    sandboxes: Arc<SandboxStore>,
    containers: Arc<ContainerStore>,
    images: Arc<ImageStore>,
    image_service: Arc<CriImageService>,
    snapshots: Arc<SnapshotStore>,
    sandbox_names: Arc<NameIndex>,
    container_names: Arc<NameIndex>,
    monitor: Arc<EventMonitor>,
    streaming: Arc<StreamingServer>,
}

impl std::fmt::Debug for RuntimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeService").finish_non_exhaustive()
    }
}

/// Construction-time dependency bundle.
pub struct RuntimeDeps {
    pub config: Arc<CridConfig>,
    pub engine: Arc<dyn Engine>,
    pub cni: Arc<dyn Cni>,
    pub spec_generator: Arc<dyn SpecGenerator>,
    pub sandboxes: Arc<SandboxStore>,
    pub containers: Arc<ContainerStore>,
    pub images: Arc<ImageStore>,
    pub image_service: Arc<CriImageService>,
    pub snapshots: Arc<SnapshotStore>,
    pub sandbox_names: Arc<NameIndex>,
    pub container_names: Arc<NameIndex>,
    pub monitor: Arc<EventMonitor>,
    pub streaming: Arc<StreamingServer>,
}

impl std::fmt::Debug for RuntimeDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeDeps").finish_non_exhaustive()
    }
}

impl RuntimeService {
    pub fn new(deps: RuntimeDeps) -> Self {
        Self {
            config: deps.config,
            engine: deps.engine,
            cni: deps.cni,
            spec_generator: deps.spec_generator,
            sandboxes: deps.sandboxes,
            containers: deps.containers,
            images: deps.images,
            image_service: deps.image_service,
            snapshots: deps.snapshots,
            sandbox_names: deps.sandbox_names,
            container_names: deps.container_names,
            monitor: deps.monitor,
            streaming: deps.streaming,
        }
    }

    /// The streaming endpoint redeems tokens against this.
    pub fn streaming(&self) -> &Arc<StreamingServer> {
        &self.streaming
    }

    /// Runs a redeemed exec session against the client's streams.
    pub async fn serve_exec(
        &self,
        token: &str,
        io: ExecIo,
    ) -> std::result::Result<i32, StreamError> {
        let SessionRequest::Exec(request) = self.streaming.redeem(token)?
        else {
            return Err(StreamError::InvalidToken);
        };
        let container = self
            .containers
            .get(&request.container_id)
            .await
            .map_err(|_| StreamError::InvalidToken)?;
        crate::streaming::exec::exec_in_container(
            self.engine.clone(),
            &self.config.container_state(container.id()),
            container.id(),
            ExecParams {
                cmd: request.cmd,
                terminal: request.tty,
                timeout: Duration::ZERO,
            },
            io,
        )
        .await
    }

    /// Runs a redeemed attach session against the client's streams.
    pub async fn serve_attach(
        &self,
        token: &str,
        io: AttachIo,
    ) -> std::result::Result<(), StreamError> {
        let SessionRequest::Attach(request) = self.streaming.redeem(token)?
        else {
            return Err(StreamError::InvalidToken);
        };
        let container = self
            .containers
            .get(&request.container_id)
            .await
            .map_err(|_| StreamError::InvalidToken)?;
        crate::streaming::attach::attach_container(
            self.engine.clone(),
            &container,
            io,
        )
        .await
    }

    /// Runs one redeemed port-forward stream.
    pub async fn serve_port_forward<S>(
        &self,
        token: &str,
        port: i32,
        client: S,
    ) -> std::result::Result<(), StreamError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let SessionRequest::PortForward(request) =
            self.streaming.redeem(token)?
        else {
            return Err(StreamError::InvalidToken);
        };
        let sandbox = self
            .sandboxes
            .get(&request.pod_sandbox_id)
            .await
            .map_err(|_| StreamError::InvalidToken)?;
        crate::streaming::portforward::port_forward(
            &sandbox.metadata.netns_path,
            port,
            client,
        )
        .await
    }
}

/// The labels handed to CNI for a sandbox attachment.
pub(crate) fn attachment_labels(
    config: &cri::PodSandboxConfig,
) -> AttachmentLabels {
    let metadata = config.metadata.clone().unwrap_or_default();
    AttachmentLabels {
        pod_name: metadata.name,
        pod_namespace: metadata.namespace,
        pod_uid: metadata.uid,
        port_mappings: config.port_mappings.clone(),
    }
}

#[tonic::async_trait]
impl RuntimeServiceContract for RuntimeService {
    async fn version(
        &self,
        _request: cri::VersionRequest,
    ) -> std::result::Result<cri::VersionResponse, Status> {
        Ok(cri::VersionResponse {
            version: KUBE_API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_api_version: RUNTIME_API_VERSION.to_string(),
        })
    }

    #[tracing::instrument(skip(self, request))]
    async fn run_pod_sandbox(
        &self,
        request: cri::RunPodSandboxRequest,
    ) -> std::result::Result<cri::RunPodSandboxResponse, Status> {
        let config = request
            .config
            .ok_or(RuntimeServiceError::MissingField("sandbox config"))?;
        let pod_sandbox_id =
            self.run_sandbox(config, request.runtime_handler).await?;
        Ok(cri::RunPodSandboxResponse { pod_sandbox_id })
    }

    #[tracing::instrument(skip(self))]
    async fn stop_pod_sandbox(
        &self,
        request: cri::StopPodSandboxRequest,
    ) -> std::result::Result<cri::StopPodSandboxResponse, Status> {
        self.stop_sandbox(&request.pod_sandbox_id).await?;
        Ok(cri::StopPodSandboxResponse {})
    }

    #[tracing::instrument(skip(self))]
    async fn remove_pod_sandbox(
        &self,
        request: cri::RemovePodSandboxRequest,
    ) -> std::result::Result<cri::RemovePodSandboxResponse, Status> {
        self.remove_sandbox(&request.pod_sandbox_id).await?;
        Ok(cri::RemovePodSandboxResponse {})
    }

    #[tracing::instrument(skip(self))]
    async fn pod_sandbox_status(
        &self,
        request: cri::PodSandboxStatusRequest,
    ) -> std::result::Result<cri::PodSandboxStatusResponse, Status> {
        Ok(self
            .sandbox_status_view(&request.pod_sandbox_id, request.verbose)
            .await?)
    }

    #[tracing::instrument(skip(self, request))]
    async fn list_pod_sandbox(
        &self,
        request: cri::ListPodSandboxRequest,
    ) -> std::result::Result<cri::ListPodSandboxResponse, Status> {
        Ok(cri::ListPodSandboxResponse {
            items: self.list_sandboxes(request.filter).await,
        })
    }

    #[tracing::instrument(skip(self, request))]
    async fn create_container(
        &self,
        request: cri::CreateContainerRequest,
    ) -> std::result::Result<cri::CreateContainerResponse, Status> {
        let container_id = self
            .create_container_in(
                &request.pod_sandbox_id,
                request.config,
                request.sandbox_config,
            )
            .await?;
        Ok(cri::CreateContainerResponse { container_id })
    }

    #[tracing::instrument(skip(self))]
    async fn start_container(
        &self,
        request: cri::StartContainerRequest,
    ) -> std::result::Result<cri::StartContainerResponse, Status> {
        self.start_container_id(&request.container_id).await?;
        Ok(cri::StartContainerResponse {})
    }

    #[tracing::instrument(skip(self))]
    async fn stop_container(
        &self,
        request: cri::StopContainerRequest,
    ) -> std::result::Result<cri::StopContainerResponse, Status> {
        let timeout = Duration::from_secs(request.timeout.max(0) as u64);
        self.stop_container_id(&request.container_id, timeout).await?;
        Ok(cri::StopContainerResponse {})
    }

    #[tracing::instrument(skip(self))]
    async fn remove_container(
        &self,
        request: cri::RemoveContainerRequest,
    ) -> std::result::Result<cri::RemoveContainerResponse, Status> {
        self.remove_container_id(&request.container_id).await?;
        Ok(cri::RemoveContainerResponse {})
    }

    #[tracing::instrument(skip(self, request))]
    async fn list_containers(
        &self,
        request: cri::ListContainersRequest,
    ) -> std::result::Result<cri::ListContainersResponse, Status> {
        Ok(cri::ListContainersResponse {
            containers: self.list_containers_view(request.filter).await,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn container_status(
        &self,
        request: cri::ContainerStatusRequest,
    ) -> std::result::Result<cri::ContainerStatusResponse, Status> {
        Ok(self
            .container_status_view(&request.container_id, request.verbose)
            .await?)
    }

    #[tracing::instrument(skip(self, request))]
    async fn update_container_resources(
        &self,
        request: cri::UpdateContainerResourcesRequest,
    ) -> std::result::Result<cri::UpdateContainerResourcesResponse, Status>
    {
        self.update_resources(&request.container_id, request.linux).await?;
        Ok(cri::UpdateContainerResourcesResponse {})
    }

    #[tracing::instrument(skip(self))]
    async fn reopen_container_log(
        &self,
        request: cri::ReopenContainerLogRequest,
    ) -> std::result::Result<cri::ReopenContainerLogResponse, Status> {
        self.reopen_log(&request.container_id).await?;
        Ok(cri::ReopenContainerLogResponse {})
    }

    #[tracing::instrument(skip(self, request))]
    async fn exec_sync(
        &self,
        request: cri::ExecSyncRequest,
    ) -> std::result::Result<cri::ExecSyncResponse, Status> {
        let container =
            self.running_container(&request.container_id).await?;
        if request.cmd.is_empty() {
            return Err(RuntimeServiceError::MissingField("cmd").into());
        }
        let timeout = Duration::from_secs(request.timeout.max(0) as u64);
        let (exit_code, stdout, stderr) = crate::streaming::exec::exec_sync(
            self.engine.clone(),
            &self.config.container_state(container.id()),
            container.id(),
            request.cmd,
            timeout,
        )
        .await
        .map_err(RuntimeServiceError::Stream)?;
        Ok(cri::ExecSyncResponse { stdout, stderr, exit_code })
    }

    #[tracing::instrument(skip(self, request))]
    async fn exec(
        &self,
        request: cri::ExecRequest,
    ) -> std::result::Result<cri::ExecResponse, Status> {
        let container =
            self.running_container(&request.container_id).await?;
        if request.cmd.is_empty() {
            return Err(RuntimeServiceError::MissingField("cmd").into());
        }
        let mut request = request;
        request.container_id = container.id().to_string();
        let url = self
            .streaming
            .request_url(SessionRequest::Exec(request))
            .map_err(RuntimeServiceError::Stream)?;
        Ok(cri::ExecResponse { url })
    }

    #[tracing::instrument(skip(self, request))]
    async fn attach(
        &self,
        request: cri::AttachRequest,
    ) -> std::result::Result<cri::AttachResponse, Status> {
        let container =
            self.running_container(&request.container_id).await?;
        let mut request = request;
        request.container_id = container.id().to_string();
        let url = self
            .streaming
            .request_url(SessionRequest::Attach(request))
            .map_err(RuntimeServiceError::Stream)?;
        Ok(cri::AttachResponse { url })
    }

    #[tracing::instrument(skip(self, request))]
    async fn port_forward(
        &self,
        request: cri::PortForwardRequest,
    ) -> std::result::Result<cri::PortForwardResponse, Status> {
        let sandbox = self.sandboxes.get(&request.pod_sandbox_id).await
            .map_err(RuntimeServiceError::Sandbox)?;
        if sandbox.status.get().await.state
            != crate::sandbox::SandboxState::Ready
        {
            return Err(RuntimeServiceError::FailedPrecondition(format!(
                "sandbox \"{}\" is not ready",
                sandbox.id()
            ))
            .into());
        }
        let mut request = request;
        request.pod_sandbox_id = sandbox.id().to_string();
        let url = self
            .streaming
            .request_url(SessionRequest::PortForward(request))
            .map_err(RuntimeServiceError::Stream)?;
        Ok(cri::PortForwardResponse { url })
    }

    #[tracing::instrument(skip(self))]
    async fn container_stats(
        &self,
        request: cri::ContainerStatsRequest,
    ) -> std::result::Result<cri::ContainerStatsResponse, Status> {
        let container = self
            .containers
            .get(&request.container_id)
            .await
            .map_err(RuntimeServiceError::Container)?;
        let stats = self.stats_for(&container).await;
        Ok(cri::ContainerStatsResponse { stats: Some(stats) })
    }

    #[tracing::instrument(skip(self, request))]
    async fn list_container_stats(
        &self,
        request: cri::ListContainerStatsRequest,
    ) -> std::result::Result<cri::ListContainerStatsResponse, Status> {
        Ok(cri::ListContainerStatsResponse {
            stats: self.list_stats(request.filter).await,
        })
    }

    async fn status(
        &self,
        _request: cri::StatusRequest,
    ) -> std::result::Result<cri::StatusResponse, Status> {
        Ok(self.runtime_status())
    }
}
