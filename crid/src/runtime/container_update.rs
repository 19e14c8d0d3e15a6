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

//! UpdateContainerResources and ReopenContainerLog.

use super::error::{Result, RuntimeServiceError};
use super::RuntimeService;
use crate::container::Container;
use api::runtime::{ContainerState, LinuxContainerResources};
use tracing::info;

impl RuntimeService {
    /// Patches the container's OCI spec and, when the task is live,
    /// applies the resources to it. Serialized by the status cell so it
    /// cannot race a state transition.
    pub(crate) async fn update_resources(
        &self,
        id_or_prefix: &str,
        linux: Option<LinuxContainerResources>,
    ) -> Result<()> {
        let container = self.containers.get(id_or_prefix).await?;
        let id = container.id().to_string();
        let resources = linux
            .ok_or(RuntimeServiceError::MissingField("linux resources"))?;

        let engine = self.engine.clone();
        container
            .status
            .update_sync(|status| {
                let engine = engine.clone();
                let id = id.clone();
                let resources = resources.clone();
                async move {
                    let oci_resources = crate::oci::linux_resources(&resources)?;

                    let engine_container = engine.get_container(&id).await?;
                    let mut spec =
                        engine_container.spec.ok_or_else(|| {
                            RuntimeServiceError::Internal(format!(
                                "container \"{id}\" has no spec"
                            ))
                        })?;
                    let mut linux_block =
                        spec.linux().clone().unwrap_or_default();
                    let _ = linux_block
                        .set_resources(Some(oci_resources.clone()));
                    let _ = spec.set_linux(Some(linux_block));
                    engine.update_container_spec(&id, spec).await?;

                    if status.state() == ContainerState::Running {
                        engine
                            .update_task_resources(&id, oci_resources)
                            .await?;
                    }
                    Ok::<_, RuntimeServiceError>(status)
                }
            })
            .await?;

        self.checkpoint_container(&container).await;
        info!("UpdateContainerResources \"{}\" returns", container.id());
        Ok(())
    }

    /// Swaps the container's log writers atomically, closing the old
    /// file. Only meaningful for a running container.
    pub(crate) async fn reopen_log(&self, id_or_prefix: &str) -> Result<()> {
        let container = self.containers.get(id_or_prefix).await?;
        require_running(&container).await?;
        let io = container.io.clone().ok_or_else(|| {
            RuntimeServiceError::Internal(format!(
                "container \"{}\" has no io",
                container.id()
            ))
        })?;
        io.reopen_log().await?;
        info!("ReopenContainerLog \"{}\" returns", container.id());
        Ok(())
    }
}

async fn require_running(container: &Container) -> Result<()> {
    if container.status.get().await.state() != ContainerState::Running {
        return Err(RuntimeServiceError::FailedPrecondition(format!(
            "container \"{}\" is not running",
            container.id()
        )));
    }
    Ok(())
}
