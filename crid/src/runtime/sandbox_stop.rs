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

//! StopPodSandbox.

use super::error::{Result, RuntimeServiceError};
use super::{attachment_labels, RuntimeService};
use crate::checkpoint::{self, STATUS_FILE};
use crate::sandbox::{Sandbox, SandboxCheckpoint, SandboxState};
use nix::sys::signal::Signal;
use std::time::Duration;
use tracing::{info, warn};

/// How long a sandbox gets between SIGKILL and its observed exit.
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

impl RuntimeService {
    /// Stops a sandbox: containers first (forced), then sandbox files,
    /// then the task, then the network. Idempotent for a sandbox that
    /// is already down.
    pub(crate) async fn stop_sandbox(&self, id_or_prefix: &str) -> Result<()> {
        let sandbox = self.sandboxes.get(id_or_prefix).await?;
        let id = sandbox.id().to_string();

        // Containers die first, forced.
        for container in self.containers.list_by_sandbox(&id).await {
            let container_id = container.id().to_string();
            self.stop_container_id(&container_id, Duration::ZERO)
                .await
                .map_err(|e| {
                    RuntimeServiceError::Internal(format!(
                        "failed to stop container \"{container_id}\": {e}"
                    ))
                })?;
        }

        self.cleanup_sandbox_files(&sandbox).await;

        let state = sandbox.status.get().await.state;
        if matches!(state, SandboxState::Ready | SandboxState::Unknown) {
            self.kill_sandbox_task(&sandbox).await?;
        }

        self.teardown_pod_network(&sandbox).await?;

        checkpoint::store(
            &self.config.sandbox_root(&id).join(STATUS_FILE),
            &SandboxCheckpoint {
                metadata: sandbox.metadata.clone(),
                status: sandbox.status.get().await,
            },
        )
        .await?;
        info!("StopPodSandbox \"{id}\" returns successfully");
        Ok(())
    }

    async fn cleanup_sandbox_files(&self, sandbox: &Sandbox) {
        if sandbox.metadata.host_ipc() {
            return;
        }
        let shm = self.config.sandbox_state(sandbox.id()).join("shm");
        match nix::mount::umount2(&shm, nix::mount::MntFlags::MNT_DETACH) {
            Ok(())
            | Err(nix::errno::Errno::EINVAL)
            | Err(nix::errno::Errno::ENOENT) => {}
            Err(e) => {
                warn!("failed to unmount sandbox shm {}: {e}", shm.display())
            }
        }
    }

    async fn kill_sandbox_task(&self, sandbox: &Sandbox) -> Result<()> {
        let id = sandbox.id();
        match self.engine.kill_task(id, Signal::SIGKILL, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                // The task is already gone; settle the state directly.
                sandbox
                    .status
                    .update(|mut status| async move {
                        if matches!(
                            status.state,
                            SandboxState::Ready | SandboxState::Unknown
                        ) {
                            status.state = SandboxState::NotReady;
                        }
                        status.pid = 0;
                        (status, Ok::<_, RuntimeServiceError>(()))
                    })
                    .await?;
                sandbox.stopped.signal();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        tokio::time::timeout(KILL_WAIT_TIMEOUT, sandbox.stopped.stopped())
            .await
            .map_err(|_| {
                RuntimeServiceError::Internal(format!(
                    "timed out waiting for sandbox \"{id}\" to stop"
                ))
            })
    }

    async fn teardown_pod_network(&self, sandbox: &Sandbox) -> Result<()> {
        if sandbox.metadata.netns_path.is_empty() {
            return Ok(());
        }
        let labels = attachment_labels(&sandbox.metadata.config);
        match self
            .cni
            .remove(sandbox.id(), &sandbox.metadata.netns_path, &labels)
            .await
        {
            Ok(()) => {}
            // An attachment that no longer exists is removed.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(netns) = &sandbox.netns {
            netns.remove()?;
        }
        Ok(())
    }
}
