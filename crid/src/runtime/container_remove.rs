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

//! RemoveContainer.

use super::error::{Result, RuntimeServiceError};
use super::RuntimeService;
use crate::checkpoint::{self, STATUS_FILE};
use crate::container::{Container, ContainerError};
use api::runtime::ContainerState;
use tracing::info;

impl RuntimeService {
    /// Removes a container that is not running. The Removing flag
    /// excludes concurrent removes and starts; it rolls back if any
    /// cleanup step fails so a later remove can retry. Removing an
    /// absent container succeeds.
    pub(crate) async fn remove_container_id(&self, id_or_prefix: &str) -> Result<()> {
        let container = match self.containers.get(id_or_prefix).await {
            Ok(container) => container,
            Err(ContainerError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let id = container.id().to_string();

        container
            .status
            .update_sync(|mut status| async move {
                if status.removing {
                    return Err(RuntimeServiceError::FailedPrecondition(
                        "container is already in removing state".to_string(),
                    ));
                }
                if status.starting {
                    return Err(RuntimeServiceError::FailedPrecondition(
                        "container is starting".to_string(),
                    ));
                }
                if status.state() == ContainerState::Running {
                    return Err(RuntimeServiceError::FailedPrecondition(
                        "container is running, stop it first".to_string(),
                    ));
                }
                status.removing = true;
                Ok(status)
            })
            .await?;

        if let Err(e) = self.remove_container_steps(&container).await {
            // Clear the flag so a subsequent remove can try again.
            let _ = container
                .status
                .update(|mut status| async move {
                    status.removing = false;
                    (status, Ok::<_, RuntimeServiceError>(()))
                })
                .await;
            return Err(e);
        }
        info!("RemoveContainer \"{id}\" returns successfully");
        Ok(())
    }

    async fn remove_container_steps(&self, container: &Container) -> Result<()> {
        let id = container.id();

        if let Some(io) = &container.io {
            io.close();
        }

        match self.engine.delete_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let root = self.config.container_root(id);
        checkpoint::delete(&root.join(STATUS_FILE)).await?;
        crate::fsutil::remove_all_with_retry(&root).await?;
        crate::fsutil::remove_all_with_retry(&self.config.container_state(id))
            .await?;

        self.containers.delete(id).await;
        self.container_names.release_by_name(&container.metadata.name);
        Ok(())
    }
}
