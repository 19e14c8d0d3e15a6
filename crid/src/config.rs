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

//! Daemon configuration.
//!
//! A plain settings value the embedding daemon shell builds from its
//! flags and passes down; every subsystem reads paths and policy from
//! here instead of ambient globals.

use crate::streaming::tls::TlsMode;
use api::image::AuthConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Size of the sandbox `/dev/shm` tmpfs unless the pod shares host IPC.
pub const DEFAULT_SHM_SIZE: u64 = 64 * 1024 * 1024;

/// Registry resolution policy: mirrors are tried in order before the
/// reference's own host; the first successful resolver wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub mirrors: Vec<String>,
    /// Per-host credentials, keyed by registry host.
    pub auths: HashMap<String, AuthConfig>,
}

/// Settings for the streaming endpoint sessions.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Address the redeemed URLs point at, e.g. `10.0.0.2:10010`.
    pub address: String,
    pub tls: TlsMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:10010".to_string(), tls: TlsMode::default() }
    }
}

#[derive(Debug, Clone)]
pub struct CridConfig {
    /// Persistent state: entity directories and status checkpoints.
    pub root_dir: PathBuf,
    /// Volatile state: FIFOs and shm mounts.
    pub state_dir: PathBuf,
    /// Where network namespaces are pinned.
    pub netns_dir: PathBuf,
    /// Engine root, used to derive the image filesystem path.
    pub engine_root: PathBuf,
    pub snapshotter: String,
    pub sandbox_image: String,
    pub max_concurrent_downloads: usize,
    pub registry: RegistryConfig,
    pub stream: StreamConfig,
}

impl Default for CridConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/crid"),
            state_dir: PathBuf::from("/run/crid"),
            netns_dir: PathBuf::from("/var/run/netns"),
            engine_root: PathBuf::from("/var/lib/containerd"),
            snapshotter: "overlayfs".to_string(),
            sandbox_image: "registry.k8s.io/pause:3.8".to_string(),
            max_concurrent_downloads: 3,
            registry: RegistryConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl CridConfig {
    pub fn sandbox_root(&self, id: &str) -> PathBuf {
        self.root_dir.join("sandboxes").join(id)
    }

    pub fn sandbox_state(&self, id: &str) -> PathBuf {
        self.state_dir.join("sandboxes").join(id)
    }

    pub fn container_root(&self, id: &str) -> PathBuf {
        self.root_dir.join("containers").join(id)
    }

    pub fn container_state(&self, id: &str) -> PathBuf {
        self.state_dir.join("containers").join(id)
    }

    /// Mount point of the snapshotter's backing filesystem.
    pub fn image_fs_path(&self) -> PathBuf {
        self.engine_root
            .join(format!("io.containerd.snapshotter.v1.{}", self.snapshotter))
    }

    /// A config rooted in a temp directory, for tests.
    #[cfg(test)]
    pub(crate) fn new_for_tests(base: &std::path::Path) -> Self {
        Self {
            root_dir: base.join("root"),
            state_dir: base.join("state"),
            netns_dir: base.join("netns"),
            engine_root: base.join("engine"),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_image_fs_path_tracks_snapshotter() {
        let config = CridConfig::default();
        assert_eq!(
            config.image_fs_path(),
            PathBuf::from(
                "/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs"
            )
        );
    }

    #[test]
    fn test_entity_directories_are_id_keyed() {
        let config = CridConfig::default();
        assert_eq!(
            config.sandbox_root("abc"),
            PathBuf::from("/var/lib/crid/sandboxes/abc")
        );
        assert_eq!(
            config.container_state("abc"),
            PathBuf::from("/run/crid/containers/abc")
        );
    }
}
