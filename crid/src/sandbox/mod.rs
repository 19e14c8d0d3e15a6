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

//! Pod sandbox entries and their store.

use api::runtime::PodSandboxMetadata;

pub use sandbox::{
    Sandbox, SandboxCheckpoint, SandboxMetadata, SandboxState, SandboxStatus,
};
pub use store::{SandboxError, SandboxStore};

#[allow(clippy::module_inception)]
pub(crate) mod sandbox;
mod store;

/// Composes the human name a sandbox reserves:
/// `name_namespace_uid_attempt`.
pub fn sandbox_name(metadata: &PodSandboxMetadata) -> String {
    format!(
        "{}_{}_{}_{}",
        metadata.name, metadata.namespace, metadata.uid, metadata.attempt
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_name_composition() {
        let metadata = PodSandboxMetadata {
            name: "nginx".into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            attempt: 2,
        };
        assert_eq!(sandbox_name(&metadata), "nginx_default_uid-1_2");
    }
}
