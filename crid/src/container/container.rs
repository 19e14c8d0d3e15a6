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

use super::ContainerIo;
use crate::status::{StatusCell, StopSignal};
use api::runtime::{ContainerConfig, ContainerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// User-visible exit reasons.
pub const REASON_COMPLETED: &str = "Completed";
pub const REASON_ERROR: &str = "Error";
pub const REASON_OOM_KILLED: &str = "OOMKilled";
pub const REASON_START_ERROR: &str = "StartError";
pub const REASON_UNKNOWN: &str = "Unknown";

/// A container's mutable status. The state is derived: unknown beats
/// everything, a finish time means Exited, a start time means Running,
/// otherwise the container is merely Created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub reason: String,
    pub message: String,
    pub pid: u32,
    /// Transient: a remove is in flight; excludes other mutations.
    #[serde(skip)]
    pub removing: bool,
    /// Transient: a start is in flight; excludes other mutations.
    #[serde(skip)]
    pub starting: bool,
    /// The task could not be resolved during recovery.
    pub unknown: bool,
}

impl ContainerStatus {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            started_at: None,
            finished_at: None,
            exit_code: 0,
            reason: String::new(),
            message: String::new(),
            pid: 0,
            removing: false,
            starting: false,
            unknown: false,
        }
    }

    pub fn state(&self) -> ContainerState {
        if self.unknown {
            ContainerState::Unknown
        } else if self.finished_at.is_some() {
            ContainerState::Exited
        } else if self.started_at.is_some() {
            ContainerState::Running
        } else {
            ContainerState::Created
        }
    }
}

/// Everything about a container that survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub config: ContainerConfig,
    /// The image id the config's reference resolved to at create time.
    pub image_ref: String,
    /// Stop signal recorded from the image config, e.g. `SIGTERM`.
    pub stop_signal: Option<String>,
    /// Absolute container log path.
    pub log_path: Option<PathBuf>,
}

/// The durable checkpoint written under the container root directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerCheckpoint {
    pub metadata: ContainerMetadata,
    pub status: ContainerStatus,
}

/// An in-store container entry. Clones share the status cell, stop
/// signal and IO.
#[derive(Debug, Clone)]
pub struct Container {
    pub metadata: ContainerMetadata,
    pub status: Arc<StatusCell<ContainerStatus>>,
    pub stopped: Arc<StopSignal>,
    pub io: Option<Arc<ContainerIo>>,
}

impl Container {
    pub fn new(
        metadata: ContainerMetadata,
        status: ContainerStatus,
        io: Option<Arc<ContainerIo>>,
    ) -> Self {
        Self {
            metadata,
            status: Arc::new(StatusCell::new(status)),
            stopped: Arc::new(StopSignal::new()),
            io,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn sandbox_id(&self) -> &str {
        &self.metadata.sandbox_id
    }
}
