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

//! StopContainer.

use super::error::{Result, RuntimeServiceError};
use super::RuntimeService;
use crate::container::{Container, REASON_UNKNOWN};
use crate::engine::TaskExit;
use api::runtime::ContainerState;
use chrono::Utc;
use nix::sys::signal::Signal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Fixed watchdog between SIGKILL and the observed exit.
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

impl RuntimeService {
    /// Stops a running container: the resolved stop signal within the
    /// caller's timeout window, SIGKILL after. Stopping a container
    /// that is not running succeeds immediately.
    pub(crate) async fn stop_container_id(
        &self,
        id_or_prefix: &str,
        timeout: Duration,
    ) -> Result<()> {
        let container = self.containers.get(id_or_prefix).await?;
        let id = container.id().to_string();

        let status = container.status.get().await;
        let state = status.state();
        if !matches!(state, ContainerState::Running | ContainerState::Unknown)
        {
            info!("StopContainer \"{id}\": not running, nothing to do");
            return Ok(());
        }

        match self.engine.task_status(&id).await {
            Err(e) if e.is_not_found() => {
                if state == ContainerState::Unknown {
                    // No task to observe; synthesize the terminal event.
                    container
                        .status
                        .update(|mut s| async move {
                            if s.reason.is_empty() {
                                s.reason = REASON_UNKNOWN.to_string();
                            }
                            (s, Ok::<_, RuntimeServiceError>(()))
                        })
                        .await?;
                    let exit = TaskExit {
                        container_id: id.clone(),
                        id: id.clone(),
                        pid: status.pid,
                        exit_code: 255,
                        exited_at: Utc::now(),
                    };
                    self.monitor
                        .handle_now(crate::engine::EngineEvent::TaskExit(exit))
                        .await
                        .map_err(|e| {
                            RuntimeServiceError::Internal(format!(
                                "failed to settle unknown container: {e}"
                            ))
                        })?;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        // A live task in Unknown state gets a temporary exit watcher so
        // the exit is recorded even though start never registered one.
        let mut watcher = None;
        if state == ContainerState::Unknown {
            if let Ok(rx) = self.engine.wait_task(&id).await {
                watcher =
                    Some(self.monitor.start_exit_monitor(id.clone(), rx));
            }
        }

        let result = self.stop_with_signals(&container, timeout).await;
        if let Some(watcher) = watcher {
            watcher.cancel();
        }
        result
    }

    async fn stop_with_signals(
        &self,
        container: &Container,
        timeout: Duration,
    ) -> Result<()> {
        let id = container.id();

        if !timeout.is_zero() {
            let signal = self.resolve_stop_signal(container).await;
            info!(
                "StopContainer \"{id}\": sending {signal} with {}s grace",
                timeout.as_secs()
            );
            match self.engine.kill_task(id, signal, false).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            tokio::select! {
                _ = container.stopped.stopped() => return Ok(()),
                _ = tokio::time::sleep(timeout) => {
                    info!("StopContainer \"{id}\": grace expired, killing");
                }
            }
        }

        match self.engine.kill_task(id, Signal::SIGKILL, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        tokio::time::timeout(KILL_WAIT_TIMEOUT, container.stopped.stopped())
            .await
            .map_err(|_| {
                RuntimeServiceError::Internal(format!(
                    "timed out waiting for container \"{id}\" to stop"
                ))
            })
    }

    /// The stop signal: the one recorded at create, else the image's,
    /// else SIGTERM. A missing image is not fatal here.
    async fn resolve_stop_signal(&self, container: &Container) -> Signal {
        let name = match &container.metadata.stop_signal {
            Some(name) => Some(name.clone()),
            None => {
                match self.images.get(&container.metadata.image_ref).await {
                    Ok(image) => image.stop_signal(),
                    Err(e) => {
                        warn!(
                            "failed to look up image for stop signal: {e}"
                        );
                        None
                    }
                }
            }
        };
        match name {
            Some(name) => Signal::from_str(&name).unwrap_or_else(|_| {
                warn!("unparseable stop signal \"{name}\", using SIGTERM");
                Signal::SIGTERM
            }),
            None => Signal::SIGTERM,
        }
    }
}
