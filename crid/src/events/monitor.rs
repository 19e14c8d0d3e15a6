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

//! The engine event monitor.
//!
//! One task consumes the exit/OOM/image stream, handles each event
//! under a timeout, and serializes handling per subject: a subject in
//! backoff queues its events in order until the retry deadline. State
//! transitions go through the same status cells client RPCs use.

use super::backoff::EventBackoff;
use crate::checkpoint::{self, STATUS_FILE};
use crate::config::CridConfig;
use crate::container::{
    Container, ContainerCheckpoint, ContainerStore, REASON_COMPLETED,
    REASON_ERROR, REASON_OOM_KILLED,
};
use crate::engine::{Engine, EngineEvent, EngineError, ExitWaiter, TaskExit};
use crate::image::{ImageError, ImageStore};
use crate::sandbox::{
    Sandbox, SandboxCheckpoint, SandboxState, SandboxStore,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info, warn};

/// Budget for handling one event.
pub(crate) const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

const BACKOFF_TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub(crate) enum EventError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("event handling timed out")]
    Timeout,
}

/// Applies events to the stores. Shared between the monitor loop and
/// the per-task exit watchers.
pub(crate) struct EventHandler {
    sandboxes: Arc<SandboxStore>,
    containers: Arc<ContainerStore>,
    images: Arc<ImageStore>,
    engine: Arc<dyn Engine>,
    config: Arc<CridConfig>,
}

/// The process-level event monitor singleton, constructed at startup
/// and owned by the daemon root object.
pub struct EventMonitor {
    handler: Arc<EventHandler>,
    retry_tx: mpsc::Sender<EngineEvent>,
    retry_rx: Mutex<Option<mpsc::Receiver<EngineEvent>>>,
}

impl std::fmt::Debug for EventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMonitor").finish_non_exhaustive()
    }
}

/// Cancels its watcher on [`ExitMonitor::cancel`] (or silently when the
/// exit has already been handled).
#[derive(Debug)]
pub struct ExitMonitor {
    handle: JoinHandle<()>,
}

impl ExitMonitor {
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl EventMonitor {
    pub fn new(
        sandboxes: Arc<SandboxStore>,
        containers: Arc<ContainerStore>,
        images: Arc<ImageStore>,
        engine: Arc<dyn Engine>,
        config: Arc<CridConfig>,
    ) -> Self {
        let (retry_tx, retry_rx) = mpsc::channel(64);
        Self {
            handler: Arc::new(EventHandler {
                sandboxes,
                containers,
                images,
                engine,
                config,
            }),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
        }
    }

    /// Spawns the consumer loop: engine events, retry feedback from exit
    /// watchers, and the backoff ticker, until shutdown.
    pub async fn start(
        &self,
        mut shutdown: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        let handler = self.handler.clone();
        let mut events = handler.engine.subscribe();
        let mut retry_rx = self
            .retry_rx
            .lock()
            .await
            .take()
            .expect("event monitor started twice");

        tokio::spawn(async move {
            let mut backoff = EventBackoff::new();
            let mut tick = interval(BACKOFF_TICK);
            loop {
                tokio::select! {
                    maybe = events.recv() => match maybe {
                        Some(Ok(event)) => {
                            dispatch(&handler, &mut backoff, event).await;
                        }
                        Some(Err(e)) => {
                            warn!("engine event stream error: {e}");
                        }
                        None => {
                            info!("engine event stream closed");
                            break;
                        }
                    },
                    Some(event) = retry_rx.recv() => {
                        dispatch(&handler, &mut backoff, event).await;
                    }
                    _ = tick.tick() => {
                        flush(&handler, &mut backoff).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Applies one event synchronously through the handler, bypassing
    /// the queue. For callers that must settle state before returning,
    /// e.g. stopping a container whose task is already gone.
    pub(crate) async fn handle_now(
        &self,
        event: EngineEvent,
    ) -> std::result::Result<(), EventError> {
        self.handler.handle(&event).await
    }

    /// Registers a future-exit watcher for a task started after the
    /// monitor: its exit is processed even if the engine emitted the
    /// event before our subscription. Failed handling feeds back into
    /// the monitor's backoff queue.
    pub fn start_exit_monitor(
        &self,
        container_id: String,
        exit: ExitWaiter,
    ) -> ExitMonitor {
        let handler = self.handler.clone();
        let retry_tx = self.retry_tx.clone();
        let handle = tokio::spawn(async move {
            let Ok(exit) = exit.await else {
                debug!("exit channel for {container_id} closed");
                return;
            };
            let event = EngineEvent::TaskExit(exit);
            match timeout(HANDLER_TIMEOUT, handler.handle(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("exit handling for {container_id} failed: {e}");
                    let _ = retry_tx.send(event).await;
                }
                Err(_) => {
                    warn!("exit handling for {container_id} timed out");
                    let _ = retry_tx.send(event).await;
                }
            }
        });
        ExitMonitor { handle }
    }
}

async fn dispatch(
    handler: &Arc<EventHandler>,
    backoff: &mut EventBackoff,
    event: EngineEvent,
) {
    let Some(id) = event.subject().map(str::to_string) else {
        warn!("dropping event without a subject id: {event:?}");
        return;
    };
    if backoff.contains(&id) {
        backoff.append(&id, event);
        return;
    }
    match timeout(HANDLER_TIMEOUT, handler.handle(&event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("handling event for \"{id}\" failed, backing off: {e}");
            backoff.promote(&id, event);
        }
        Err(_) => {
            warn!("handling event for \"{id}\" timed out, backing off");
            backoff.promote(&id, event);
        }
    }
}

async fn flush(handler: &Arc<EventHandler>, backoff: &mut EventBackoff) {
    for (id, mut events, policy) in backoff.take_expired(Instant::now()) {
        while let Some(event) = events.pop_front() {
            let failed = match timeout(HANDLER_TIMEOUT, handler.handle(&event))
                .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(EventError::Timeout),
            };
            if let Some(e) = failed {
                warn!("retry for \"{id}\" failed, doubling backoff: {e}");
                events.push_front(event);
                backoff.requeue(id.clone(), events, policy);
                break;
            }
        }
    }
}

impl EventHandler {
    pub(crate) async fn handle(
        &self,
        event: &EngineEvent,
    ) -> Result<(), EventError> {
        match event {
            EngineEvent::TaskExit(exit) => self.handle_task_exit(exit).await,
            EngineEvent::TaskOom { container_id } => {
                self.handle_task_oom(container_id).await
            }
            EngineEvent::ImageCreate { name }
            | EngineEvent::ImageUpdate { name }
            | EngineEvent::ImageDelete { name } => {
                self.images.update(name).await.map_err(Into::into)
            }
        }
    }

    async fn handle_task_exit(&self, exit: &TaskExit) -> Result<(), EventError> {
        // Exec process exits are observed by their sessions, not here.
        if exit.id != exit.container_id {
            return Ok(());
        }
        if let Ok(container) = self.containers.get(&exit.container_id).await {
            return self.container_exit(container, exit).await;
        }
        if let Ok(sandbox) = self.sandboxes.get(&exit.container_id).await {
            return self.sandbox_exit(sandbox, exit).await;
        }
        // Already removed from both stores; nothing left to record.
        Ok(())
    }

    async fn container_exit(
        &self,
        container: Container,
        exit: &TaskExit,
    ) -> Result<(), EventError> {
        let engine = self.engine.clone();
        let id = container.id().to_string();
        let exit = exit.clone();

        let result = container
            .status
            .update(|mut status| async move {
                // An earlier observation of the exit stands.
                if status.finished_at.is_none() {
                    status.finished_at = Some(exit.exited_at);
                    status.exit_code = exit.exit_code;
                }
                status.pid = 0;
                if status.reason.is_empty() {
                    status.reason = if status.exit_code == 0 {
                        REASON_COMPLETED
                    } else {
                        REASON_ERROR
                    }
                    .to_string();
                }
                let cleanup = match engine.delete_task(&id).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(EventError::Engine(e)),
                };
                (status, cleanup)
            })
            .await;

        // Unblock synchronous stop waiters regardless of cleanup.
        container.stopped.signal();
        if let Some(io) = &container.io {
            io.close();
        }
        self.checkpoint_container(&container).await;
        result
    }

    async fn sandbox_exit(
        &self,
        sandbox: Sandbox,
        _exit: &TaskExit,
    ) -> Result<(), EventError> {
        let engine = self.engine.clone();
        let id = sandbox.id().to_string();

        let result = sandbox
            .status
            .update(|mut status| async move {
                status.pid = 0;
                match status.state {
                    SandboxState::Ready | SandboxState::Unknown => {
                        status.state = SandboxState::NotReady;
                    }
                    // The creating path owns cleanup of an Init sandbox.
                    SandboxState::Init | SandboxState::NotReady => {}
                }
                let cleanup = match engine.delete_task(&id).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(EventError::Engine(e)),
                };
                (status, cleanup)
            })
            .await;

        sandbox.stopped.signal();
        self.checkpoint_sandbox(&sandbox).await;
        result
    }

    async fn handle_task_oom(
        &self,
        container_id: &str,
    ) -> Result<(), EventError> {
        let Ok(container) = self.containers.get(container_id).await else {
            return Ok(());
        };
        container
            .status
            .update(|mut status| async move {
                status.reason = REASON_OOM_KILLED.to_string();
                (status, Ok(()))
            })
            .await
    }

    async fn checkpoint_container(&self, container: &Container) {
        let path =
            self.config.container_root(container.id()).join(STATUS_FILE);
        let value = ContainerCheckpoint {
            metadata: container.metadata.clone(),
            status: container.status.get().await,
        };
        if let Err(e) = checkpoint::store(&path, &value).await {
            warn!("failed to checkpoint container {}: {e}", container.id());
        }
    }

    async fn checkpoint_sandbox(&self, sandbox: &Sandbox) {
        let path = self.config.sandbox_root(sandbox.id()).join(STATUS_FILE);
        let value = SandboxCheckpoint {
            metadata: sandbox.metadata.clone(),
            status: sandbox.status.get().await,
        };
        if let Err(e) = checkpoint::store(&path, &value).await {
            warn!("failed to checkpoint sandbox {}: {e}", sandbox.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::container::testing::test_container;
    use crate::engine::fake::FakeEngine;
    use crate::engine::{TaskState, TaskStatus};
    use crate::sandbox::sandbox::testing::test_sandbox;
    use api::runtime::ContainerState;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    struct Harness {
        engine: Arc<FakeEngine>,
        sandboxes: Arc<SandboxStore>,
        containers: Arc<ContainerStore>,
        monitor: EventMonitor,
        _tempdir: tempfile::TempDir,
        shutdown: watch::Sender<()>,
    }

    async fn harness() -> Harness {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let config =
            Arc::new(CridConfig::new_for_tests(tempdir.path()));
        let engine = Arc::new(FakeEngine::new());
        let sandboxes = Arc::new(SandboxStore::new());
        let containers = Arc::new(ContainerStore::new());
        let images = Arc::new(ImageStore::new(engine.clone()));
        let monitor = EventMonitor::new(
            sandboxes.clone(),
            containers.clone(),
            images,
            engine.clone(),
            config,
        );
        let (shutdown, _) = watch::channel(());
        Harness {
            engine,
            sandboxes,
            containers,
            monitor,
            _tempdir: tempdir,
            shutdown,
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

    async fn seed_running_container(h: &Harness, id: &str) -> Container {
        let container = test_container(id, "app_pod_default_u_0", "sbx");
        container
            .status
            .update_sync(|mut status| async move {
                status.started_at = Some(Utc::now());
                status.pid = 42;
                Ok::<_, EventError>(status)
            })
            .await
            .expect("seed running");
        h.containers.add(container.clone()).await.expect("store add");
        h.engine.insert_task(id, running_task(42));
        container
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_exit_records_status_and_unblocks_waiters() {
        let h = harness().await;
        let _loop = h.monitor.start(h.shutdown.subscribe()).await;
        let container = seed_running_container(&h, "c1").await;

        h.engine.complete_task("c1", 0);
        container.stopped.stopped().await;

        let status = container.status.get().await;
        assert_eq!(status.state(), ContainerState::Exited);
        assert_eq!(status.exit_code, 0);
        assert_eq!(status.reason, REASON_COMPLETED);
        assert_eq!(status.pid, 0);
        // The engine task was deleted by the handler.
        assert!(!h.engine.has_task("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_reason_is_error() {
        let h = harness().await;
        let _loop = h.monitor.start(h.shutdown.subscribe()).await;
        let container = seed_running_container(&h, "c1").await;

        h.engine.complete_task("c1", 3);
        container.stopped.stopped().await;

        let status = container.status.get().await;
        assert_eq!(status.exit_code, 3);
        assert_eq!(status.reason, REASON_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oom_reason_survives_the_exit() {
        let h = harness().await;
        let _loop = h.monitor.start(h.shutdown.subscribe()).await;
        let container = seed_running_container(&h, "c1").await;

        h.engine.emit(EngineEvent::TaskOom { container_id: "c1".into() });
        // Let the OOM land before the exit.
        for _ in 0..100 {
            if container.status.get().await.reason == REASON_OOM_KILLED {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.engine.complete_task("c1", 137);
        container.stopped.stopped().await;

        let status = container.status.get().await;
        assert_eq!(status.reason, REASON_OOM_KILLED);
        assert_eq!(status.exit_code, 137);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_sandbox_exit_becomes_not_ready() {
        let h = harness().await;
        let _loop = h.monitor.start(h.shutdown.subscribe()).await;

        let sandbox = test_sandbox("s1", "pod_default_u_0");
        sandbox
            .status
            .update_sync(|mut status| async move {
                status.state = SandboxState::Ready;
                status.pid = 7;
                Ok::<_, EventError>(status)
            })
            .await
            .expect("seed ready");
        h.sandboxes.add(sandbox.clone()).await.expect("store add");
        h.engine.insert_container(crate::engine::EngineContainer {
            id: "s1".into(),
            image_id: String::new(),
            snapshot_key: String::new(),
            labels: Default::default(),
            extensions: Default::default(),
            created_at: Utc::now(),
            spec: None,
        });
        h.engine.insert_task("s1", running_task(7));

        h.engine.complete_task("s1", 0);
        sandbox.stopped.stopped().await;

        let status = sandbox.status.get().await;
        assert_eq!(status.state, SandboxState::NotReady);
        assert_eq!(status.pid, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_sandbox_exit_stays_init() {
        let h = harness().await;
        let _loop = h.monitor.start(h.shutdown.subscribe()).await;

        let sandbox = test_sandbox("s1", "pod_default_u_0");
        h.sandboxes.add(sandbox.clone()).await.expect("store add");
        h.engine.insert_task("s1", running_task(7));

        h.engine.complete_task("s1", 1);
        sandbox.stopped.stopped().await;

        assert_eq!(sandbox.status.get().await.state, SandboxState::Init);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_monitor_bootstrap_handles_without_stream() {
        let h = harness().await;
        // No monitor loop: only the registered watcher observes the exit.
        let container = seed_running_container(&h, "c1").await;
        let waiter = h.engine.wait_task("c1").await.expect("waiter");
        let _watcher =
            h.monitor.start_exit_monitor("c1".to_string(), waiter);

        h.engine.complete_task("c1", 0);
        container.stopped.stopped().await;
        assert_eq!(
            container.status.get().await.state(),
            ContainerState::Exited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_event_backoff_doubles_until_success() {
        let h = harness().await;
        let _loop = h.monitor.start(h.shutdown.subscribe()).await;

        h.engine.fail_on("get_image");
        h.engine.emit(EngineEvent::ImageUpdate { name: "img".into() });

        // t≈0: the first attempt fails and promotes the subject.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.call_count("get_image"), 1);

        // Four more events arrive while the subject is in backoff; they
        // queue, they do not trigger handling.
        for _ in 0..4 {
            h.engine.emit(EngineEvent::ImageUpdate { name: "img".into() });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.call_count("get_image"), 1);

        // Retries land at ≈1s, 3s, 7s, 15s (delay doubles each failure;
        // each flush attempts only the head of the queue).
        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(h.engine.call_count("get_image"), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.engine.call_count("get_image"), 3);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.engine.call_count("get_image"), 4);
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(h.engine.call_count("get_image"), 5);

        // Success drains the whole queue and clears the backoff.
        h.engine.clear_failure("get_image");
        tokio::time::sleep(Duration::from_secs(16)).await;
        let drained = h.engine.call_count("get_image");
        assert!(drained >= 9, "queued events flushed, saw {drained}");

        // The next event is handled immediately again.
        h.engine.emit(EngineEvent::ImageUpdate { name: "img".into() });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.call_count("get_image"), drained + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_without_subject_is_dropped() {
        let h = harness().await;
        let _loop = h.monitor.start(h.shutdown.subscribe()).await;
        let container = seed_running_container(&h, "c1").await;

        h.engine.emit(EngineEvent::TaskExit(TaskExit {
            container_id: String::new(),
            id: String::new(),
            pid: 0,
            exit_code: 0,
            exited_at: Utc::now(),
        }));

        // The stream keeps flowing.
        h.engine.complete_task("c1", 0);
        container.stopped.stopped().await;
        assert_eq!(
            container.status.get().await.state(),
            ContainerState::Exited
        );
    }
}
