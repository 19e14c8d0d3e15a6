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

//! An in-memory [`Engine`] for tests.

use super::*;
use oci_spec::image::{
    Arch, ConfigBuilder, ImageConfigurationBuilder, Os, RootFsBuilder,
};
use oci_spec::runtime::SpecBuilder;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug)]
struct FakeTask {
    status: TaskStatus,
    waiters: Vec<oneshot::Sender<TaskExit>>,
    kills: Vec<Signal>,
}

#[derive(Debug)]
struct FakeExec {
    spec: ExecSpec,
    status: TaskStatus,
    waiters: Vec<oneshot::Sender<TaskExit>>,
}

#[derive(Debug, Default)]
struct Inner {
    containers: HashMap<String, EngineContainer>,
    tasks: HashMap<String, FakeTask>,
    execs: HashMap<(String, String), FakeExec>,
    images: HashMap<String, EngineImage>,
    pullable: HashMap<String, EngineImage>,
    importable: HashMap<String, Vec<EngineImage>>,
    snapshots: Vec<SnapshotUsage>,
    metrics: HashMap<String, TaskMetrics>,
    subscribers: Vec<mpsc::Sender<std::result::Result<EngineEvent, EngineError>>>,
    calls: HashMap<&'static str, usize>,
    failures: HashSet<&'static str>,
    failing_hosts: HashSet<String>,
    hosts_tried: Vec<String>,
    /// Whether a non-KILL signal terminates tasks (code 143). SIGKILL
    /// always terminates (code 137).
    term_stops: bool,
}

/// An engine whose state lives in memory and whose task exits are driven
/// by the test (or by kill signals).
#[derive(Debug)]
pub(crate) struct FakeEngine {
    inner: Mutex<Inner>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        let inner = Inner { term_stops: true, ..Default::default() };
        Self { inner: Mutex::new(inner) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake engine lock")
    }

    /// Makes the named operation fail with `EngineError::Failed` until
    /// [`Self::clear_failure`] is called.
    pub fn fail_on(&self, op: &'static str) {
        let _ = self.lock().failures.insert(op);
    }

    pub fn clear_failure(&self, op: &'static str) {
        let _ = self.lock().failures.remove(op);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        let mut inner = self.lock();
        *inner.calls.entry(op).or_insert(0) += 1;
        if inner.failures.contains(op) {
            return Err(EngineError::Failed(format!("injected {op} failure")));
        }
        Ok(())
    }

    /// How many times the named operation has been attempted.
    pub fn call_count(&self, op: &'static str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// SIGTERM-class signals no longer terminate tasks; only SIGKILL
    /// does. For stop-timeout scenarios.
    pub fn ignore_term_signals(&self) {
        self.lock().term_stops = false;
    }

    pub fn add_pullable(&self, reference: &str, image: EngineImage) {
        let _ = self.lock().pullable.insert(reference.to_string(), image);
    }

    pub fn add_importable(&self, path: &str, images: Vec<EngineImage>) {
        let _ = self.lock().importable.insert(path.to_string(), images);
    }

    pub fn fail_host(&self, host: &str) {
        let _ = self.lock().failing_hosts.insert(host.to_string());
    }

    pub fn hosts_tried(&self) -> Vec<String> {
        self.lock().hosts_tried.clone()
    }

    pub fn insert_image(&self, image: EngineImage) {
        let _ = self.lock().images.insert(image.name.clone(), image);
    }

    pub fn remove_engine_image(&self, name: &str) {
        let _ = self.lock().images.remove(name);
    }

    pub fn insert_container(&self, container: EngineContainer) {
        let _ = self.lock().containers.insert(container.id.clone(), container);
    }

    pub fn insert_task(&self, container_id: &str, status: TaskStatus) {
        let task = FakeTask { status, waiters: vec![], kills: vec![] };
        let _ = self.lock().tasks.insert(container_id.to_string(), task);
    }

    pub fn set_snapshots(&self, snapshots: Vec<SnapshotUsage>) {
        self.lock().snapshots = snapshots;
    }

    pub fn set_metrics(&self, container_id: &str, metrics: TaskMetrics) {
        let _ = self.lock().metrics.insert(container_id.to_string(), metrics);
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn has_task(&self, id: &str) -> bool {
        self.lock().tasks.contains_key(id)
    }

    pub fn task_kills(&self, id: &str) -> Vec<Signal> {
        self.lock().tasks.get(id).map(|t| t.kills.clone()).unwrap_or_default()
    }

    /// Emits an event into every subscriber's stream.
    pub fn emit(&self, event: EngineEvent) {
        let subscribers = self.lock().subscribers.clone();
        for tx in subscribers {
            let event = event.clone();
            let _ = tokio::spawn(async move {
                let _ = tx.send(Ok(event)).await;
            });
        }
    }

    /// Terminates a running task: flips it to Stopped, resolves exit
    /// waiters, and emits the exit event.
    pub fn complete_task(&self, container_id: &str, exit_code: i32) {
        let exit = {
            let mut inner = self.lock();
            let Some(task) = inner.tasks.get_mut(container_id) else {
                return;
            };
            let pid = task.status.pid;
            task.status.state = TaskState::Stopped;
            task.status.exit_code = exit_code;
            task.status.exited_at = Some(Utc::now());
            let exit = TaskExit {
                container_id: container_id.to_string(),
                id: container_id.to_string(),
                pid,
                exit_code,
                exited_at: Utc::now(),
            };
            for waiter in task.waiters.drain(..) {
                let _ = waiter.send(exit.clone());
            }
            exit
        };
        self.emit(EngineEvent::TaskExit(exit));
    }

    pub fn complete_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        exit_code: i32,
    ) {
        let mut inner = self.lock();
        let key = (container_id.to_string(), exec_id.to_string());
        let Some(exec) = inner.execs.get_mut(&key) else {
            return;
        };
        exec.status.state = TaskState::Stopped;
        exec.status.exit_code = exit_code;
        exec.status.exited_at = Some(Utc::now());
        let exit = TaskExit {
            container_id: container_id.to_string(),
            id: exec_id.to_string(),
            pid: exec.status.pid,
            exit_code,
            exited_at: Utc::now(),
        };
        for waiter in exec.waiters.drain(..) {
            let _ = waiter.send(exit.clone());
        }
    }

    pub fn exec_spec(&self, container_id: &str, exec_id: &str) -> Option<ExecSpec> {
        let key = (container_id.to_string(), exec_id.to_string());
        self.lock().execs.get(&key).map(|e| e.spec.clone())
    }

    /// The first registered exec id for a container, in no particular
    /// order.
    pub fn first_exec_id(&self, container_id: &str) -> Option<String> {
        self.lock()
            .execs
            .keys()
            .find(|(cid, _)| cid == container_id)
            .map(|(_, eid)| eid.clone())
    }
}

/// A minimal image configuration for seeding the fake.
pub(crate) fn test_image_config(stop_signal: Option<&str>) -> ImageConfiguration {
    let mut config = ConfigBuilder::default()
        .user("0:0".to_string())
        .env(vec!["PATH=/usr/bin".to_string()])
        .entrypoint(vec!["/entry".to_string()])
        .cmd(vec!["serve".to_string()])
        .working_dir("/".to_string());
    if let Some(signal) = stop_signal {
        config = config.stop_signal(signal.to_string());
    }
    ImageConfigurationBuilder::default()
        .architecture(Arch::Amd64)
        .os(Os::Linux)
        .rootfs(
            RootFsBuilder::default()
                .typ("layers".to_string())
                .diff_ids(Vec::<String>::new())
                .build()
                .expect("rootfs"),
        )
        .config(config.build().expect("image config"))
        .build()
        .expect("image configuration")
}

pub(crate) fn test_engine_image(id: &str, name: &str) -> EngineImage {
    EngineImage {
        id: id.to_string(),
        name: name.to_string(),
        chain_id: format!("chain-{id}"),
        size: 4096,
        config: test_image_config(None),
        labels: HashMap::new(),
    }
}

fn running_status(pid: u32) -> TaskStatus {
    TaskStatus {
        state: TaskState::Running,
        pid,
        exit_code: 0,
        created_at: Utc::now(),
        exited_at: None,
    }
}

#[tonic::async_trait]
impl Engine for FakeEngine {
    async fn create_container(&self, opts: ContainerCreateOpts) -> Result<()> {
        self.check("create_container")?;
        let mut inner = self.lock();
        if inner.containers.contains_key(&opts.id) {
            return Err(EngineError::AlreadyExists(format!(
                "container {}",
                opts.id
            )));
        }
        let container = EngineContainer {
            id: opts.id.clone(),
            image_id: opts.image_id,
            snapshot_key: opts.snapshot_key,
            labels: opts.labels,
            extensions: opts.extensions,
            created_at: Utc::now(),
            spec: Some(opts.spec),
        };
        let _ = inner.containers.insert(opts.id, container);
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<EngineContainer> {
        self.lock()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))
    }

    async fn list_containers(&self, kind: &str) -> Result<Vec<EngineContainer>> {
        self.check("list_containers")?;
        Ok(self
            .lock()
            .containers
            .values()
            .filter(|c| c.labels.get(KIND_LABEL).map(String::as_str) == Some(kind))
            .cloned()
            .collect())
    }

    async fn update_container_spec(&self, id: &str, spec: Spec) -> Result<()> {
        self.check("update_container_spec")?;
        let mut inner = self.lock();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))?;
        container.spec = Some(spec);
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        self.check("delete_container")?;
        self.lock()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))
    }

    async fn create_task(
        &self,
        container_id: &str,
        _io: TaskIo,
    ) -> Result<TaskStatus> {
        self.check("create_task")?;
        let mut inner = self.lock();
        if !inner.containers.contains_key(container_id) {
            return Err(EngineError::NotFound(format!(
                "container {container_id}"
            )));
        }
        if inner.tasks.contains_key(container_id) {
            return Err(EngineError::AlreadyExists(format!(
                "task {container_id}"
            )));
        }
        let status = TaskStatus {
            state: TaskState::Created,
            pid: 1000 + inner.tasks.len() as u32,
            exit_code: 0,
            created_at: Utc::now(),
            exited_at: None,
        };
        let task = FakeTask {
            status: status.clone(),
            waiters: vec![],
            kills: vec![],
        };
        let _ = inner.tasks.insert(container_id.to_string(), task);
        Ok(status)
    }

    async fn start_task(&self, container_id: &str) -> Result<()> {
        self.check("start_task")?;
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(container_id).ok_or_else(|| {
            EngineError::NotFound(format!("task {container_id}"))
        })?;
        task.status.state = TaskState::Running;
        Ok(())
    }

    async fn task_status(&self, container_id: &str) -> Result<TaskStatus> {
        self.check("task_status")?;
        self.lock()
            .tasks
            .get(container_id)
            .map(|t| t.status.clone())
            .ok_or_else(|| EngineError::NotFound(format!("task {container_id}")))
    }

    async fn kill_task(
        &self,
        container_id: &str,
        signal: Signal,
        _all: bool,
    ) -> Result<()> {
        self.check("kill_task")?;
        let terminate = {
            let mut inner = self.lock();
            let term_stops = inner.term_stops;
            let task = inner.tasks.get_mut(container_id).ok_or_else(|| {
                EngineError::NotFound(format!("task {container_id}"))
            })?;
            task.kills.push(signal);
            task.status.state != TaskState::Stopped
                && (signal == Signal::SIGKILL || term_stops)
        };
        if terminate {
            let code = if signal == Signal::SIGKILL { 137 } else { 143 };
            self.complete_task(container_id, code);
        }
        Ok(())
    }

    async fn delete_task(&self, container_id: &str) -> Result<TaskExit> {
        self.check("delete_task")?;
        let mut inner = self.lock();
        let task = inner.tasks.get(container_id).ok_or_else(|| {
            EngineError::NotFound(format!("task {container_id}"))
        })?;
        if task.status.state != TaskState::Stopped {
            return Err(EngineError::Failed(format!(
                "task {container_id} is not stopped"
            )));
        }
        let exit = TaskExit {
            container_id: container_id.to_string(),
            id: container_id.to_string(),
            pid: task.status.pid,
            exit_code: task.status.exit_code,
            exited_at: task.status.exited_at.unwrap_or_else(Utc::now),
        };
        let _ = inner.tasks.remove(container_id);
        Ok(exit)
    }

    async fn wait_task(&self, container_id: &str) -> Result<ExitWaiter> {
        self.check("wait_task")?;
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(container_id).ok_or_else(|| {
            EngineError::NotFound(format!("task {container_id}"))
        })?;
        if task.status.state == TaskState::Stopped {
            let exit = TaskExit {
                container_id: container_id.to_string(),
                id: container_id.to_string(),
                pid: task.status.pid,
                exit_code: task.status.exit_code,
                exited_at: task.status.exited_at.unwrap_or_else(Utc::now),
            };
            let _ = tx.send(exit);
        } else {
            task.waiters.push(tx);
        }
        Ok(rx)
    }

    async fn update_task_resources(
        &self,
        container_id: &str,
        _resources: LinuxResources,
    ) -> Result<()> {
        self.check("update_task_resources")?;
        if !self.lock().tasks.contains_key(container_id) {
            return Err(EngineError::NotFound(format!("task {container_id}")));
        }
        Ok(())
    }

    async fn resize_task_pty(
        &self,
        container_id: &str,
        exec_id: Option<&str>,
        _width: u16,
        _height: u16,
    ) -> Result<()> {
        let inner = self.lock();
        match exec_id {
            None if inner.tasks.contains_key(container_id) => Ok(()),
            Some(eid)
                if inner.execs.contains_key(&(
                    container_id.to_string(),
                    eid.to_string(),
                )) =>
            {
                Ok(())
            }
            _ => Err(EngineError::NotFound(format!("task {container_id}"))),
        }
    }

    async fn create_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        spec: ExecSpec,
        _io: TaskIo,
    ) -> Result<()> {
        self.check("create_exec")?;
        let mut inner = self.lock();
        if !inner.tasks.contains_key(container_id) {
            return Err(EngineError::NotFound(format!("task {container_id}")));
        }
        let exec = FakeExec {
            spec,
            status: TaskStatus {
                state: TaskState::Created,
                pid: 0,
                exit_code: 0,
                created_at: Utc::now(),
                exited_at: None,
            },
            waiters: vec![],
        };
        let _ = inner
            .execs
            .insert((container_id.to_string(), exec_id.to_string()), exec);
        Ok(())
    }

    async fn start_exec(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<TaskStatus> {
        self.check("start_exec")?;
        let mut inner = self.lock();
        let key = (container_id.to_string(), exec_id.to_string());
        let exec = inner.execs.get_mut(&key).ok_or_else(|| {
            EngineError::NotFound(format!("exec {exec_id} in {container_id}"))
        })?;
        exec.status = running_status(2000);
        Ok(exec.status.clone())
    }

    async fn kill_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        signal: Signal,
    ) -> Result<()> {
        self.check("kill_exec")?;
        let exists = self
            .lock()
            .execs
            .contains_key(&(container_id.to_string(), exec_id.to_string()));
        if !exists {
            return Err(EngineError::NotFound(format!(
                "exec {exec_id} in {container_id}"
            )));
        }
        if signal == Signal::SIGKILL {
            self.complete_exec(container_id, exec_id, 137);
        }
        Ok(())
    }

    async fn delete_exec(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<()> {
        let _ = self
            .lock()
            .execs
            .remove(&(container_id.to_string(), exec_id.to_string()));
        Ok(())
    }

    async fn wait_exec(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<ExitWaiter> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let key = (container_id.to_string(), exec_id.to_string());
        let exec = inner.execs.get_mut(&key).ok_or_else(|| {
            EngineError::NotFound(format!("exec {exec_id} in {container_id}"))
        })?;
        if exec.status.state == TaskState::Stopped {
            let _ = tx.send(TaskExit {
                container_id: container_id.to_string(),
                id: exec_id.to_string(),
                pid: exec.status.pid,
                exit_code: exec.status.exit_code,
                exited_at: exec.status.exited_at.unwrap_or_else(Utc::now),
            });
        } else {
            exec.waiters.push(tx);
        }
        Ok(rx)
    }

    async fn get_image(&self, reference: &str) -> Result<EngineImage> {
        self.check("get_image")?;
        self.lock()
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("image {reference}")))
    }

    async fn list_images(&self) -> Result<Vec<EngineImage>> {
        self.check("list_images")?;
        Ok(self.lock().images.values().cloned().collect())
    }

    async fn pull_image(
        &self,
        reference: &str,
        opts: PullOpts,
    ) -> Result<EngineImage> {
        self.check("pull_image")?;
        {
            let mut inner = self.lock();
            inner.hosts_tried.push(opts.host.clone());
            if inner.failing_hosts.contains(&opts.host) {
                return Err(EngineError::Unavailable(format!(
                    "host {} unreachable",
                    opts.host
                )));
            }
        }
        let image = {
            let inner = self.lock();
            inner.pullable.get(reference).cloned().ok_or_else(|| {
                EngineError::NotFound(format!("image {reference}"))
            })?
        };
        let mut image = image;
        image.name = reference.to_string();
        self.insert_image(image.clone());
        Ok(image)
    }

    async fn import_images(&self, tar_path: &str) -> Result<Vec<EngineImage>> {
        self.check("import_images")?;
        let images = self
            .lock()
            .importable
            .get(tar_path)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("tar {tar_path}")))?;
        for image in &images {
            self.insert_image(image.clone());
        }
        Ok(images)
    }

    async fn tag_image(&self, name: &str, id: &str) -> Result<()> {
        self.check("tag_image")?;
        let template = {
            let inner = self.lock();
            inner.images.values().find(|i| i.id == id).cloned()
        };
        let mut image = template
            .ok_or_else(|| EngineError::NotFound(format!("image id {id}")))?;
        image.name = name.to_string();
        self.insert_image(image);
        Ok(())
    }

    async fn label_image(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut inner = self.lock();
        let image = inner
            .images
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(format!("image {name}")))?;
        let _ = image.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_image(&self, name: &str) -> Result<()> {
        self.check("delete_image")?;
        self.lock()
            .images
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("image {name}")))
    }

    async fn list_snapshots(
        &self,
        _snapshotter: &str,
    ) -> Result<Vec<SnapshotUsage>> {
        self.check("list_snapshots")?;
        Ok(self.lock().snapshots.clone())
    }

    async fn task_metrics(&self, container_id: &str) -> Result<TaskMetrics> {
        self.check("task_metrics")?;
        self.lock().metrics.get(container_id).cloned().ok_or_else(|| {
            EngineError::NotFound(format!("metrics for {container_id}"))
        })
    }

    fn subscribe(
        &self,
    ) -> mpsc::Receiver<std::result::Result<EngineEvent, EngineError>> {
        let (tx, rx) = mpsc::channel(64);
        self.lock().subscribers.push(tx);
        rx
    }
}

/// A spec that satisfies signatures in tests.
pub(crate) fn test_spec() -> Spec {
    SpecBuilder::default().build().expect("oci spec")
}
