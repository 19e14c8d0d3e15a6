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

//! Filesystem helpers for entity directories.

use nix::mount::{umount2, MntFlags};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use walkdir::WalkDir;

/// Attempts before giving up on a busy directory.
const REMOVE_RETRIES: usize = 10;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Recursively removes `path`, tolerating live mounts.
///
/// A sandbox root can hold mount points (shm, leaked bind mounts) that
/// make removal fail with EBUSY; each retry lazily detaches every mount
/// under the tree first. Already absent is success.
pub async fn remove_all_with_retry(path: &Path) -> io::Result<()> {
    for attempt in 0..=REMOVE_RETRIES {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                if attempt == REMOVE_RETRIES {
                    return Err(e);
                }
                warn!(
                    "directory {} busy, detaching mounts (attempt {attempt})",
                    path.display()
                );
                detach_mounts(path);
                tokio::time::sleep(REMOVE_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn detach_mounts(path: &Path) {
    for entry in WalkDir::new(path).into_iter().flatten() {
        if entry.file_type().is_dir() {
            // EINVAL simply means "not a mount point".
            let _ = umount2(entry.path(), MntFlags::MNT_DETACH);
        }
    }
}
