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

//! RunPodSandbox.

use super::error::{Result, RuntimeServiceError};
use super::undo::Undo;
use super::{attachment_labels, RuntimeService};
use crate::checkpoint::{self, STATUS_FILE};
use crate::cni::netns::NetNs;
use crate::cni::select_pod_ips;
use crate::config::DEFAULT_SHM_SIZE;
use crate::engine::{
    ContainerCreateOpts, TaskIo, KIND_LABEL, KIND_SANDBOX,
    SANDBOX_METADATA_EXTENSION,
};
use crate::ident::generate_id;
use crate::image::ImageError;
use crate::oci::SandboxSpecConfig;
use crate::sandbox::{
    sandbox_name, Sandbox, SandboxCheckpoint, SandboxMetadata, SandboxState,
    SandboxStatus,
};
use api::runtime::PodSandboxConfig;
use nix::mount::MsFlags;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

impl RuntimeService {
    /// Runs a pod sandbox end to end: reserve, network, engine
    /// container, task, store. Every completed side effect has an undo
    /// step that fires in reverse on failure, detached from the
    /// caller's context.
    pub(crate) async fn run_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: String,
    ) -> Result<String> {
        let metadata = config
            .metadata
            .clone()
            .ok_or(RuntimeServiceError::MissingField("sandbox metadata"))?;
        if metadata.name.is_empty()
            || metadata.namespace.is_empty()
            || metadata.uid.is_empty()
        {
            return Err(RuntimeServiceError::InvalidArgument(
                "sandbox metadata requires name, namespace and uid"
                    .to_string(),
            ));
        }

        let id = generate_id();
        let name = sandbox_name(&metadata);
        self.sandbox_names.reserve(&name, &id)?;

        let mut undo = Undo::new();
        {
            let names = self.sandbox_names.clone();
            let name = name.clone();
            undo.push(async move { names.release_by_name(&name) });
        }

        match self.run_sandbox_steps(&id, &name, config, runtime_handler, &mut undo).await
        {
            Ok(()) => {
                info!("RunPodSandbox for \"{name}\" returns sandbox id \"{id}\"");
                Ok(id)
            }
            Err(e) => {
                warn!("RunPodSandbox for \"{name}\" failed, undoing: {e}");
                undo.fire();
                Err(e)
            }
        }
    }

    async fn run_sandbox_steps(
        &self,
        id: &str,
        name: &str,
        config: PodSandboxConfig,
        runtime_handler: String,
        undo: &mut Undo,
    ) -> Result<()> {
        // The sandbox image must be present; pull it on demand.
        let image_id = match self.images.resolve(&self.config.sandbox_image).await
        {
            Ok(image_id) => image_id,
            Err(ImageError::NotFound(_)) => self
                .image_service
                .pull(&self.config.sandbox_image, None)
                .await
                .map_err(|e| RuntimeServiceError::SandboxImage {
                    image: self.config.sandbox_image.clone(),
                    message: e.to_string(),
                })?,
            Err(e) => return Err(e.into()),
        };

        let mut metadata = SandboxMetadata {
            id: id.to_string(),
            name: name.to_string(),
            config,
            runtime_handler,
            netns_path: String::new(),
            ip: String::new(),
            additional_ips: vec![],
            cni_result: None,
        };

        // Pod network: namespace plus CNI attachment, unless the pod
        // runs on the host network.
        let mut netns = None;
        if !metadata.host_network() {
            let ns = Arc::new(
                NetNs::new(&self.config.netns_dir, &format!("cri-{}", &id[..12]))
                    .await?,
            );
            metadata.netns_path = ns.path().display().to_string();
            {
                let ns = ns.clone();
                undo.push(async move {
                    if let Err(e) = ns.remove() {
                        warn!("undo: failed to remove netns: {e}");
                    }
                });
            }

            let labels = attachment_labels(&metadata.config);
            let result =
                self.cni.setup(id, &metadata.netns_path, &labels).await?;
            {
                let cni = self.cni.clone();
                let id = id.to_string();
                let netns_path = metadata.netns_path.clone();
                let labels = labels.clone();
                undo.push(async move {
                    if let Err(e) =
                        cni.remove(&id, &netns_path, &labels).await
                    {
                        warn!("undo: cni teardown failed: {e}");
                    }
                });
            }

            let (ip, additional_ips) = select_pod_ips(&result);
            metadata.ip = ip;
            metadata.additional_ips = additional_ips;
            metadata.cni_result = Some(result);
            netns = Some(ns);
        }

        // Entity directories and pod files.
        let root = self.config.sandbox_root(id);
        let state = self.config.sandbox_state(id);
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(&state).await?;
        {
            let root = root.clone();
            let state = state.clone();
            undo.push(async move {
                let _ = crate::fsutil::remove_all_with_retry(&root).await;
                let _ = crate::fsutil::remove_all_with_retry(&state).await;
            });
        }

        let hostname = setup_sandbox_files(&root, &state, &metadata).await?;
        if !metadata.host_ipc() {
            let shm = state.join("shm");
            {
                let shm = shm.clone();
                undo.push(async move {
                    let _ = nix::mount::umount2(
                        &shm,
                        nix::mount::MntFlags::MNT_DETACH,
                    );
                });
            }
        }

        // Engine container and task.
        let spec_config = SandboxSpecConfig {
            id: id.to_string(),
            name: name.to_string(),
            hostname,
            image_id: image_id.clone(),
            netns_path: metadata.netns_path.clone(),
            cgroup_parent: metadata
                .config
                .linux
                .as_ref()
                .map(|l| l.cgroup_parent.clone())
                .unwrap_or_default(),
            resolv_conf_path: root.join("resolv.conf").display().to_string(),
            hostname_path: root.join("hostname").display().to_string(),
            hosts_path: root.join("hosts").display().to_string(),
            shm_path: state.join("shm").display().to_string(),
            sysctls: metadata
                .config
                .linux
                .as_ref()
                .map(|l| l.sysctls.clone())
                .unwrap_or_default(),
            privileged: metadata
                .config
                .linux
                .as_ref()
                .and_then(|l| l.security_context.as_ref())
                .map(|ctx| ctx.privileged)
                .unwrap_or(false),
            selinux: metadata
                .config
                .linux
                .as_ref()
                .and_then(|l| l.security_context.as_ref())
                .and_then(|ctx| ctx.selinux_options.clone()),
            seccomp: metadata
                .config
                .linux
                .as_ref()
                .and_then(|l| l.security_context.as_ref())
                .and_then(|ctx| ctx.seccomp.clone()),
            runtime_handler: metadata.runtime_handler.clone(),
            pod_annotations: metadata.config.annotations.clone(),
        };
        let spec = self.spec_generator.sandbox_spec(&spec_config)?;

        let mut extensions = HashMap::new();
        let _ = extensions.insert(
            SANDBOX_METADATA_EXTENSION.to_string(),
            serde_json::to_value(&metadata).map_err(|e| {
                RuntimeServiceError::Internal(format!(
                    "failed to encode sandbox metadata: {e}"
                ))
            })?,
        );
        let mut labels = HashMap::new();
        let _ = labels
            .insert(KIND_LABEL.to_string(), KIND_SANDBOX.to_string());

        self.engine
            .create_container(ContainerCreateOpts {
                id: id.to_string(),
                image_id,
                snapshotter: self.config.snapshotter.clone(),
                snapshot_key: id.to_string(),
                spec,
                runtime_handler: metadata.runtime_handler.clone(),
                labels,
                extensions,
            })
            .await?;
        {
            let engine = self.engine.clone();
            let id = id.to_string();
            undo.push(async move {
                match engine.delete_container(&id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!("undo: failed to delete sandbox container: {e}")
                    }
                }
            });
        }

        let task = self.engine.create_task(id, TaskIo::null()).await?;
        {
            let engine = self.engine.clone();
            let id = id.to_string();
            undo.push(async move {
                let _ = engine
                    .kill_task(&id, nix::sys::signal::Signal::SIGKILL, true)
                    .await;
                match engine.delete_task(&id).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!("undo: failed to delete sandbox task: {e}")
                    }
                }
            });
        }
        let exit = self.engine.wait_task(id).await?;
        self.engine.start_task(id).await?;

        // The one transition Init → Ready; all-or-nothing.
        let sandbox =
            Sandbox::new(metadata, SandboxStatus::new(), netns);
        let pid = task.pid;
        let created_at = task.created_at;
        sandbox
            .status
            .update_sync(|mut status| async move {
                status.state = SandboxState::Ready;
                status.pid = pid;
                status.created_at = created_at;
                Ok::<_, RuntimeServiceError>(status)
            })
            .await?;

        checkpoint::store(
            &root.join(STATUS_FILE),
            &SandboxCheckpoint {
                metadata: sandbox.metadata.clone(),
                status: sandbox.status.get().await,
            },
        )
        .await?;

        self.sandboxes.add(sandbox).await?;

        // Asynchronous termination handling from here on.
        let _ = self.monitor.start_exit_monitor(id.to_string(), exit);
        Ok(())
    }
}

/// Writes `/etc/hostname`, `/etc/hosts` and `resolv.conf` content under
/// the sandbox root, and mounts the shm tmpfs under the state directory
/// unless the pod shares host IPC. Returns the effective hostname.
async fn setup_sandbox_files(
    root: &Path,
    state: &Path,
    metadata: &SandboxMetadata,
) -> Result<String> {
    let hostname = if metadata.config.hostname.is_empty() {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        metadata.config.hostname.clone()
    };
    tokio::fs::write(root.join("hostname"), format!("{hostname}\n")).await?;

    let mut hosts = String::from(
        "127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n",
    );
    if !metadata.ip.is_empty() && !hostname.is_empty() {
        hosts.push_str(&format!("{}\t{hostname}\n", metadata.ip));
    }
    tokio::fs::write(root.join("hosts"), hosts).await?;

    let resolv = match &metadata.config.dns_config {
        Some(dns) => {
            let mut out = String::new();
            for server in &dns.servers {
                out.push_str(&format!("nameserver {server}\n"));
            }
            if !dns.searches.is_empty() {
                out.push_str(&format!("search {}\n", dns.searches.join(" ")));
            }
            if !dns.options.is_empty() {
                out.push_str(&format!("options {}\n", dns.options.join(" ")));
            }
            out
        }
        // Inherit the host's resolver when the pod does not bring one.
        None => tokio::fs::read_to_string("/etc/resolv.conf")
            .await
            .unwrap_or_default(),
    };
    tokio::fs::write(root.join("resolv.conf"), resolv).await?;

    if !metadata.host_ipc() {
        let shm = state.join("shm");
        tokio::fs::create_dir_all(&shm).await?;
        let data = format!("mode=1777,size={DEFAULT_SHM_SIZE}");
        nix::mount::mount(
            Some("shm"),
            &shm,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Some(data.as_str()),
        )
        .map_err(|e| {
            RuntimeServiceError::Internal(format!(
                "failed to mount sandbox shm: {e}"
            ))
        })?;
    }
    Ok(hostname)
}
