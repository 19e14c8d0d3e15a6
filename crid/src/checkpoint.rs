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

//! Durable per-entity status checkpoints.
//!
//! Each sandbox and container persists its metadata and status as JSON
//! under its root directory. Writes go through a temp file and an
//! atomic rename so a crash can never leave a half-written checkpoint.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the status checkpoint within an entity's root
/// directory.
pub const STATUS_FILE: &str = "status.json";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint {path} not found")]
    NotFound { path: PathBuf },
    #[error("failed to read/write checkpoint {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("checkpoint {path} is corrupt: {source}")]
    Corrupt { path: PathBuf, source: serde_json::Error },
}

impl CheckpointError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Writes `value` to `path` atomically.
pub async fn store<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|source| {
        CheckpointError::Corrupt { path: path.to_path_buf(), source }
    })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|source| {
            CheckpointError::Io { path: path.to_path_buf(), source }
        })?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data).await.map_err(|source| {
        CheckpointError::Io { path: tmp.clone(), source }
    })?;
    tokio::fs::rename(&tmp, path).await.map_err(|source| {
        CheckpointError::Io { path: path.to_path_buf(), source }
    })
}

/// Loads a checkpoint. Missing files surface as `NotFound`, unparseable
/// ones as `Corrupt`; recovery maps both to the Unknown state.
pub async fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CheckpointError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&data).map_err(|source| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Deletes a checkpoint; already absent is success.
pub async fn delete(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => {
            Err(CheckpointError::Io { path: path.to_path_buf(), source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: String,
        pid: u32,
    }

    #[tokio::test]
    async fn test_store_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(STATUS_FILE);
        let value = Probe { id: "abc".into(), pid: 7 };

        store(&path, &value).await.expect("store");
        let loaded: Probe = load(&path).await.expect("load");
        assert_eq!(loaded, value);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load::<Probe>(&dir.path().join(STATUS_FILE))
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_load_corrupt_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(STATUS_FILE);
        tokio::fs::write(&path, b"{not json").await.expect("write");
        let err = load::<Probe>(&path).await.expect_err("corrupt");
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_is_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        delete(&dir.path().join(STATUS_FILE)).await.expect("delete");
    }

    #[tokio::test]
    async fn test_store_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(STATUS_FILE);
        store(&path, &Probe { id: "x".into(), pid: 1 }).await.expect("store");

        let mut entries = tokio::fs::read_dir(dir.path()).await.expect("dir");
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![STATUS_FILE.to_string()]);
    }
}
