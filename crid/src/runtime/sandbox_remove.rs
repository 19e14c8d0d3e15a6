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

//! RemovePodSandbox.

use super::error::{Result, RuntimeServiceError};
use super::RuntimeService;
use crate::sandbox::{SandboxError, SandboxState};
use tracing::info;

impl RuntimeService {
    /// Removes a stopped sandbox and everything it owns: its
    /// containers, its directories, its engine record, its name.
    /// Removing an absent sandbox succeeds.
    pub(crate) async fn remove_sandbox(&self, id_or_prefix: &str) -> Result<()> {
        let sandbox = match self.sandboxes.get(id_or_prefix).await {
            Ok(sandbox) => sandbox,
            Err(SandboxError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let id = sandbox.id().to_string();

        let state = sandbox.status.get().await.state;
        if state == SandboxState::Ready {
            return Err(RuntimeServiceError::FailedPrecondition(format!(
                "sandbox \"{id}\" is ready, stop it first"
            )));
        }
        if !sandbox.netns_closed() {
            return Err(RuntimeServiceError::FailedPrecondition(format!(
                "sandbox \"{id}\" network namespace is not fully closed"
            )));
        }

        // Containers leave before their sandbox.
        for container in self.containers.list_by_sandbox(&id).await {
            let container_id = container.id().to_string();
            self.remove_container_id(&container_id).await.map_err(|e| {
                RuntimeServiceError::Internal(format!(
                    "failed to remove container \"{container_id}\": {e}"
                ))
            })?;
        }

        crate::fsutil::remove_all_with_retry(&self.config.sandbox_root(&id))
            .await?;
        crate::fsutil::remove_all_with_retry(&self.config.sandbox_state(&id))
            .await?;

        match self.engine.delete_container(&id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.sandboxes.delete(&id).await;
        self.sandbox_names.release_by_name(&sandbox.metadata.name);
        info!("RemovePodSandbox \"{id}\" returns successfully");
        Ok(())
    }
}
