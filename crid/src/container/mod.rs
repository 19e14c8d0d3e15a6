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

//! Application container entries, their store, and container IO.

use api::runtime::{ContainerMetadata as ApiContainerMetadata, PodSandboxMetadata};

pub use container::{
    Container, ContainerCheckpoint, ContainerMetadata, ContainerStatus,
    REASON_COMPLETED, REASON_ERROR, REASON_OOM_KILLED, REASON_START_ERROR,
    REASON_UNKNOWN,
};
pub use io::ContainerIo;
pub use store::{ContainerError, ContainerStore};

#[allow(clippy::module_inception)]
pub(crate) mod container;
pub mod crilog;
mod io;
mod store;

/// Composes the human name a container reserves:
/// `cname_podname_podns_poduid_attempt`.
pub fn container_name(
    metadata: &ApiContainerMetadata,
    sandbox_metadata: &PodSandboxMetadata,
) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        metadata.name,
        sandbox_metadata.name,
        sandbox_metadata.namespace,
        sandbox_metadata.uid,
        metadata.attempt
    )
}
