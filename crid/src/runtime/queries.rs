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

//! Snapshot views: status, list, and stats.

use super::error::{Result, RuntimeServiceError};
use super::RuntimeService;
use crate::container::Container;
use crate::sandbox::Sandbox;
use api::runtime::{self as cri, ContainerState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

fn nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or_default()
}

fn opt_nanos(ts: Option<DateTime<Utc>>) -> i64 {
    ts.map(nanos).unwrap_or(0)
}

fn labels_match(
    selector: &HashMap<String, String>,
    labels: &HashMap<String, String>,
) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

impl RuntimeService {
    /// Resolves a container and requires it to be running.
    pub(crate) async fn running_container(
        &self,
        id_or_prefix: &str,
    ) -> Result<Container> {
        let container = self.containers.get(id_or_prefix).await?;
        if container.status.get().await.state() != ContainerState::Running {
            return Err(RuntimeServiceError::FailedPrecondition(format!(
                "container \"{}\" is not running",
                container.id()
            )));
        }
        Ok(container)
    }

    pub(crate) async fn list_sandboxes(
        &self,
        filter: Option<cri::PodSandboxFilter>,
    ) -> Vec<cri::PodSandbox> {
        let mut items = vec![];
        for sandbox in self.sandboxes.list().await {
            let status = sandbox.status.get().await;
            let item = sandbox_view(&sandbox, status.state.to_api(), &status);
            if let Some(filter) = &filter {
                if !filter.id.is_empty() && !item.id.starts_with(&filter.id) {
                    continue;
                }
                if let Some(state) = filter.state {
                    if item.state != state {
                        continue;
                    }
                }
                if !labels_match(&filter.label_selector, &item.labels) {
                    continue;
                }
            }
            items.push(item);
        }
        items
    }

    pub(crate) async fn sandbox_status_view(
        &self,
        id_or_prefix: &str,
        verbose: bool,
    ) -> Result<cri::PodSandboxStatusResponse> {
        let sandbox = self.sandboxes.get(id_or_prefix).await?;
        let status = sandbox.status.get().await;
        let config = &sandbox.metadata.config;

        let network = Some(cri::PodSandboxNetworkStatus {
            ip: sandbox.metadata.ip.clone(),
            additional_ips: sandbox
                .metadata
                .additional_ips
                .iter()
                .map(|ip| cri::PodIp { ip: ip.clone() })
                .collect(),
        });
        let linux = Some(cri::LinuxPodSandboxStatus {
            namespace_options: config
                .linux
                .as_ref()
                .and_then(|l| l.security_context.as_ref())
                .and_then(|ctx| ctx.namespace_options.clone()),
        });

        let mut info = HashMap::new();
        if verbose {
            let _ = info.insert("pid".to_string(), status.pid.to_string());
            if let Ok(blob) = serde_json::to_string(&sandbox.metadata) {
                let _ = info.insert("metadata".to_string(), blob);
            }
        }

        Ok(cri::PodSandboxStatusResponse {
            status: Some(cri::PodSandboxStatus {
                id: sandbox.id().to_string(),
                metadata: config.metadata.clone(),
                state: status.state.to_api(),
                created_at: nanos(status.created_at),
                network,
                linux,
                labels: config.labels.clone(),
                annotations: config.annotations.clone(),
                runtime_handler: sandbox.metadata.runtime_handler.clone(),
            }),
            info,
        })
    }

    pub(crate) async fn list_containers_view(
        &self,
        filter: Option<cri::ContainerFilter>,
    ) -> Vec<cri::Container> {
        let mut containers = vec![];
        for container in self.containers.list().await {
            let status = container.status.get().await;
            let view = container_view(&container, &status);
            if let Some(filter) = &filter {
                if !filter.id.is_empty() && !view.id.starts_with(&filter.id) {
                    continue;
                }
                if !filter.pod_sandbox_id.is_empty()
                    && view.pod_sandbox_id != filter.pod_sandbox_id
                {
                    continue;
                }
                if let Some(state) = filter.state {
                    if view.state != state {
                        continue;
                    }
                }
                if !labels_match(&filter.label_selector, &view.labels) {
                    continue;
                }
            }
            containers.push(view);
        }
        containers
    }

    pub(crate) async fn container_status_view(
        &self,
        id_or_prefix: &str,
        verbose: bool,
    ) -> Result<cri::ContainerStatusResponse> {
        let container = self.containers.get(id_or_prefix).await?;
        let status = container.status.get().await;
        let config = &container.metadata.config;

        let mut info = HashMap::new();
        if verbose {
            let _ = info.insert("pid".to_string(), status.pid.to_string());
            let _ = info.insert(
                "sandboxID".to_string(),
                container.sandbox_id().to_string(),
            );
        }

        Ok(cri::ContainerStatusResponse {
            status: Some(cri::ContainerStatus {
                id: container.id().to_string(),
                metadata: config.metadata.clone(),
                state: status.state(),
                created_at: nanos(status.created_at),
                started_at: opt_nanos(status.started_at),
                finished_at: opt_nanos(status.finished_at),
                exit_code: status.exit_code,
                image: config.image.clone(),
                image_ref: container.metadata.image_ref.clone(),
                reason: status.reason.clone(),
                message: status.message.clone(),
                labels: config.labels.clone(),
                annotations: config.annotations.clone(),
                mounts: config.mounts.clone(),
                log_path: container
                    .metadata
                    .log_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            }),
            info,
        })
    }

    pub(crate) async fn stats_for(
        &self,
        container: &Container,
    ) -> cri::ContainerStats {
        let config = &container.metadata.config;
        let attributes = Some(cri::ContainerAttributes {
            id: container.id().to_string(),
            metadata: config.metadata.clone(),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
        });

        let (cpu, memory) =
            match self.engine.task_metrics(container.id()).await {
                Ok(metrics) => {
                    let ts = nanos(metrics.timestamp);
                    (
                        Some(cri::CpuUsage {
                            timestamp: ts,
                            usage_core_nano_seconds: Some(
                                metrics.cpu_usage_nanos,
                            ),
                        }),
                        Some(cri::MemoryUsage {
                            timestamp: ts,
                            working_set_bytes: Some(
                                metrics.memory_working_set_bytes,
                            ),
                        }),
                    )
                }
                Err(_) => (None, None),
            };

        let writable_layer =
            self.snapshots.get(container.id()).await.map(|usage| {
                cri::FilesystemUsage {
                    timestamp: nanos(usage.timestamp),
                    fs_id: Some(cri::FilesystemIdentifier {
                        mountpoint: self
                            .config
                            .image_fs_path()
                            .display()
                            .to_string(),
                    }),
                    used_bytes: Some(usage.size),
                    inodes_used: Some(usage.inodes),
                }
            });

        cri::ContainerStats { attributes, cpu, memory, writable_layer }
    }

    pub(crate) async fn list_stats(
        &self,
        filter: Option<cri::ContainerStatsFilter>,
    ) -> Vec<cri::ContainerStats> {
        let mut stats = vec![];
        for container in self.containers.list().await {
            if let Some(filter) = &filter {
                if !filter.id.is_empty() && container.id() != filter.id {
                    continue;
                }
                if !filter.pod_sandbox_id.is_empty()
                    && container.sandbox_id() != filter.pod_sandbox_id
                {
                    continue;
                }
                if !labels_match(
                    &filter.label_selector,
                    &container.metadata.config.labels,
                ) {
                    continue;
                }
            }
            stats.push(self.stats_for(&container).await);
        }
        stats
    }

    /// Runtime and network conditions.
    pub(crate) fn runtime_status(&self) -> cri::StatusResponse {
        let network = match self.cni.status() {
            Ok(()) => cri::RuntimeCondition {
                name: cri::NETWORK_READY.to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
            Err(e) => cri::RuntimeCondition {
                name: cri::NETWORK_READY.to_string(),
                status: false,
                reason: "NetworkPluginNotReady".to_string(),
                message: e.to_string(),
            },
        };
        cri::StatusResponse {
            status: Some(cri::RuntimeStatus {
                conditions: vec![
                    cri::RuntimeCondition {
                        name: cri::RUNTIME_READY.to_string(),
                        status: true,
                        reason: String::new(),
                        message: String::new(),
                    },
                    network,
                ],
            }),
            info: HashMap::new(),
        }
    }
}

fn sandbox_view(
    sandbox: &Sandbox,
    state: cri::PodSandboxState,
    status: &crate::sandbox::SandboxStatus,
) -> cri::PodSandbox {
    let config = &sandbox.metadata.config;
    cri::PodSandbox {
        id: sandbox.id().to_string(),
        metadata: config.metadata.clone(),
        state,
        created_at: nanos(status.created_at),
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
        runtime_handler: sandbox.metadata.runtime_handler.clone(),
    }
}

fn container_view(
    container: &Container,
    status: &crate::container::ContainerStatus,
) -> cri::Container {
    let config = &container.metadata.config;
    cri::Container {
        id: container.id().to_string(),
        pod_sandbox_id: container.sandbox_id().to_string(),
        metadata: config.metadata.clone(),
        image: config.image.clone(),
        image_ref: container.metadata.image_ref.clone(),
        state: status.state(),
        created_at: nanos(status.created_at),
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
    }
}
