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

//! StartContainer.

use super::error::{Result, RuntimeServiceError};
use super::RuntimeService;
use crate::checkpoint::{self, STATUS_FILE};
use crate::container::crilog::LogFile;
use crate::container::{
    Container, ContainerCheckpoint, REASON_START_ERROR,
};
use crate::engine::TaskStatus;
use crate::sandbox::SandboxState;
use api::runtime::ContainerState;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

impl RuntimeService {
    /// Starts a created container. A concurrent second start observes
    /// the Starting flag and fails; a start failure records the
    /// StartError status without leaking a Running state.
    pub(crate) async fn start_container_id(&self, id_or_prefix: &str) -> Result<()> {
        let container = self.containers.get(id_or_prefix).await?;
        let id = container.id().to_string();

        // Claim the start slot; all-or-nothing.
        container
            .status
            .update_sync(|mut status| async move {
                if status.starting {
                    return Err(RuntimeServiceError::FailedPrecondition(
                        "container is already in starting state".to_string(),
                    ));
                }
                if status.removing {
                    return Err(RuntimeServiceError::FailedPrecondition(
                        "container is marked for removal".to_string(),
                    ));
                }
                match status.state() {
                    ContainerState::Created => {
                        status.starting = true;
                        Ok(status)
                    }
                    state => Err(RuntimeServiceError::FailedPrecondition(
                        format!(
                            "container is in {state:?} state, expected Created"
                        ),
                    )),
                }
            })
            .await?;

        let started = self.start_container_steps(&container).await;
        match started {
            Ok(task) => {
                let pid = task.pid;
                container
                    .status
                    .update_sync(|mut status| async move {
                        status.pid = pid;
                        status.started_at = Some(Utc::now());
                        status.starting = false;
                        Ok::<_, RuntimeServiceError>(status)
                    })
                    .await?;
                self.checkpoint_container(&container).await;
                info!("StartContainer \"{id}\" returns successfully");
                Ok(())
            }
            Err(e) => {
                // The failure must be visible in the status even though
                // cleanup may fail too.
                let message = e.to_string();
                let _ = container
                    .status
                    .update(|mut status| async move {
                        status.starting = false;
                        status.pid = 0;
                        status.finished_at = Some(Utc::now());
                        status.exit_code = 128;
                        status.reason = REASON_START_ERROR.to_string();
                        status.message = message;
                        (status, Ok::<_, RuntimeServiceError>(()))
                    })
                    .await;
                self.checkpoint_container(&container).await;
                Err(e)
            }
        }
    }

    async fn start_container_steps(
        &self,
        container: &Container,
    ) -> Result<TaskStatus> {
        let id = container.id();

        let sandbox = self.sandboxes.get(container.sandbox_id()).await?;
        if sandbox.status.get().await.state != SandboxState::Ready {
            return Err(RuntimeServiceError::FailedPrecondition(format!(
                "sandbox \"{}\" is not ready",
                sandbox.id()
            )));
        }

        // Wire the log before the process can write.
        let io = container.io.clone().ok_or_else(|| {
            RuntimeServiceError::Internal(format!(
                "container \"{id}\" has no io"
            ))
        })?;
        if let Some(log_path) = &container.metadata.log_path {
            let log = Arc::new(LogFile::open(log_path).await?);
            io.start_log_pump(log)?;
        }

        let task = self.engine.create_task(id, io.task_io()).await?;
        let waiter = self.engine.wait_task(id).await?;
        if let Err(e) = self.engine.start_task(id).await {
            // Deferred cleanup, detached from the caller.
            let engine = self.engine.clone();
            let id = id.to_string();
            let _ = tokio::spawn(async move {
                match engine.delete_task(&id).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!("failed to delete unstarted task \"{id}\": {e}")
                    }
                }
            });
            return Err(e.into());
        }

        let _ = self
            .monitor
            .start_exit_monitor(id.to_string(), waiter);
        Ok(task)
    }

    pub(crate) async fn checkpoint_container(&self, container: &Container) {
        let path = self
            .config
            .container_root(container.id())
            .join(STATUS_FILE);
        let value = ContainerCheckpoint {
            metadata: container.metadata.clone(),
            status: container.status.get().await,
        };
        if let Err(e) = checkpoint::store(&path, &value).await {
            warn!(
                "failed to checkpoint container \"{}\": {e}",
                container.id()
            );
        }
    }
}
