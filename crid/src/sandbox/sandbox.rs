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

use crate::cni::netns::NetNs;
use crate::cni::CniResult;
use crate::status::{StatusCell, StopSignal};
use api::runtime::{NamespaceMode, PodSandboxConfig, PodSandboxState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub enum SandboxState {
    /// Allocated but its task has not started yet. The creating path is
    /// responsible for cleanup if the task never comes up.
    #[default]
    Init,
    Ready,
    NotReady,
    /// Recovery found the engine task in an ambiguous state.
    Unknown,
}

impl SandboxState {
    pub fn to_api(self) -> PodSandboxState {
        match self {
            SandboxState::Ready => PodSandboxState::Ready,
            _ => PodSandboxState::NotReady,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

impl SandboxStatus {
    pub fn new() -> Self {
        Self { state: SandboxState::Init, pid: 0, created_at: Utc::now() }
    }
}

impl Default for SandboxStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything about a sandbox that survives restarts. Stored both in
/// the engine container's extension blob and in the on-disk checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMetadata {
    pub id: String,
    pub name: String,
    pub config: PodSandboxConfig,
    pub runtime_handler: String,
    /// Empty when the pod shares the host network.
    pub netns_path: String,
    pub ip: String,
    pub additional_ips: Vec<String>,
    pub cni_result: Option<CniResult>,
}

impl SandboxMetadata {
    /// Whether the pod opted out of its own network namespace.
    pub fn host_network(&self) -> bool {
        namespace_is_node(&self.config, |options| options.network)
    }

    /// Whether the pod shares the host IPC namespace (no private shm).
    pub fn host_ipc(&self) -> bool {
        namespace_is_node(&self.config, |options| options.ipc)
    }
}

fn namespace_is_node(
    config: &PodSandboxConfig,
    pick: impl Fn(&api::runtime::NamespaceOption) -> NamespaceMode,
) -> bool {
    config
        .linux
        .as_ref()
        .and_then(|linux| linux.security_context.as_ref())
        .and_then(|ctx| ctx.namespace_options.as_ref())
        .map(|options| pick(options) == NamespaceMode::Node)
        .unwrap_or(false)
}

/// The durable checkpoint written under the sandbox root directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxCheckpoint {
    pub metadata: SandboxMetadata,
    pub status: SandboxStatus,
}

/// An in-store sandbox entry. Clones share the status cell, the stop
/// signal and the network namespace handle.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub metadata: SandboxMetadata,
    pub status: Arc<StatusCell<SandboxStatus>>,
    pub stopped: Arc<StopSignal>,
    pub netns: Option<Arc<NetNs>>,
}

impl Sandbox {
    pub fn new(
        metadata: SandboxMetadata,
        status: SandboxStatus,
        netns: Option<Arc<NetNs>>,
    ) -> Self {
        Self {
            metadata,
            status: Arc::new(StatusCell::new(status)),
            stopped: Arc::new(StopSignal::new()),
            netns,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Whether the network namespace is fully torn down (trivially true
    /// for host-network pods).
    pub fn netns_closed(&self) -> bool {
        match &self.netns {
            Some(netns) => netns.is_closed(),
            None => true,
        }
    }
}
