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

//! Network namespace ownership.
//!
//! A sandbox that does not opt into host networking owns a named
//! network namespace: a bind mount of a freshly unshared net namespace
//! onto a file under the netns run directory. Its lifetime is bounded
//! by sandbox store membership; only the sandbox stop/remove paths tear
//! it down.

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::gettid;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetNsError {
    #[error("failed to create netns file {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to unshare network namespace: {source}")]
    Unshare { source: nix::Error },
    #[error("failed to bind mount netns at {path}: {source}")]
    Mount { path: PathBuf, source: nix::Error },
    #[error("failed to unmount netns at {path}: {source}")]
    Unmount { path: PathBuf, source: nix::Error },
    #[error("failed to remove netns file {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
    #[error("netns thread panicked")]
    ThreadPanic,
}

pub type Result<T> = std::result::Result<T, NetNsError>;

/// A named network namespace pinned by a bind mount.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
}

impl NetNs {
    /// Creates a new network namespace pinned at `dir/<name>`.
    ///
    /// The unshare happens on a throwaway thread so the daemon's own
    /// namespace is never touched; the bind mount keeps the namespace
    /// alive after the thread exits.
    pub async fn new(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| NetNsError::Create { path: path.clone(), source })?;
        drop(
            File::create(&path).map_err(|source| NetNsError::Create {
                path: path.clone(),
                source,
            })?,
        );

        let mount_path = path.clone();
        let pinned = std::thread::spawn(move || -> Result<()> {
            unshare(CloneFlags::CLONE_NEWNET)
                .map_err(|source| NetNsError::Unshare { source })?;
            let src = format!("/proc/self/task/{}/ns/net", gettid());
            mount(
                Some(src.as_str()),
                &mount_path,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|source| NetNsError::Mount {
                path: mount_path.clone(),
                source,
            })
        })
        .join();

        match pinned {
            Ok(Ok(())) => Ok(Self { path }),
            Ok(Err(e)) => {
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
            Err(_) => {
                let _ = std::fs::remove_file(&path);
                Err(NetNsError::ThreadPanic)
            }
        }
    }

    /// Adopts an already pinned namespace found during recovery.
    pub fn load(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the namespace has been fully torn down.
    pub fn is_closed(&self) -> bool {
        !self.path.exists()
    }

    /// Opens the pinned namespace for `setns`.
    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    /// Unpins and removes the namespace. Idempotent: an already
    /// unmounted or removed namespace is success.
    pub fn remove(&self) -> Result<()> {
        match umount2(&self.path, MntFlags::MNT_DETACH) {
            Ok(()) => {}
            Err(nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT) => {}
            Err(source) => {
                return Err(NetNsError::Unmount {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                Err(NetNsError::Remove { path: self.path.clone(), source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Requires CAP_SYS_ADMIN; run with root when exercising for real.
    #[ignore]
    #[tokio::test]
    async fn test_new_pins_and_remove_unpins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let netns =
            NetNs::new(dir.path(), "cri-test").await.expect("create netns");
        assert!(!netns.is_closed());
        netns.remove().expect("remove netns");
        assert!(netns.is_closed());
        // removing again is success
        netns.remove().expect("remove twice");
    }

    #[test]
    fn test_load_missing_path_is_closed() {
        let netns = NetNs::load(PathBuf::from("/nonexistent/netns/cri-x"));
        assert!(netns.is_closed());
    }
}
