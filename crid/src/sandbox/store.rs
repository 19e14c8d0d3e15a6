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

use super::Sandbox;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox \"{id}\" not found")]
    NotFound { id: String },
    #[error("sandbox id prefix \"{prefix}\" is ambiguous")]
    AmbiguousId { prefix: String },
    #[error("sandbox \"{id}\" already exists")]
    Exists { id: String },
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// The in-memory sandbox index, keyed by id. Entry state lives in each
/// entry's status cell; this lock only guards the map structure.
#[derive(Debug, Default)]
pub struct SandboxStore {
    sandboxes: RwLock<HashMap<String, Sandbox>>,
}

impl SandboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a sandbox. Re-adding the identical entry is a no-op; a
    /// different entry under the same id is a conflict.
    pub async fn add(&self, sandbox: Sandbox) -> Result<()> {
        let mut sandboxes = self.sandboxes.write().await;
        if let Some(existing) = sandboxes.get(sandbox.id()) {
            if existing.metadata.name == sandbox.metadata.name {
                return Ok(());
            }
            return Err(SandboxError::Exists { id: sandbox.id().to_string() });
        }
        let _ = sandboxes.insert(sandbox.id().to_string(), sandbox);
        Ok(())
    }

    /// Resolves a full id or a uniquely identifying prefix.
    pub async fn get(&self, id_or_prefix: &str) -> Result<Sandbox> {
        let sandboxes = self.sandboxes.read().await;
        if let Some(sandbox) = sandboxes.get(id_or_prefix) {
            return Ok(sandbox.clone());
        }
        if id_or_prefix.is_empty() {
            return Err(SandboxError::NotFound { id: String::new() });
        }

        let mut matched: Option<&Sandbox> = None;
        for (id, sandbox) in sandboxes.iter() {
            if id.starts_with(id_or_prefix) {
                if matched.is_some() {
                    return Err(SandboxError::AmbiguousId {
                        prefix: id_or_prefix.to_string(),
                    });
                }
                matched = Some(sandbox);
            }
        }
        matched.cloned().ok_or_else(|| SandboxError::NotFound {
            id: id_or_prefix.to_string(),
        })
    }

    /// A stable snapshot of every entry.
    pub async fn list(&self) -> Vec<Sandbox> {
        self.sandboxes.read().await.values().cloned().collect()
    }

    /// Removes an entry. Removing an absent id is a no-op.
    pub async fn delete(&self, id: &str) {
        let _ = self.sandboxes.write().await.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::super::sandbox::testing::test_sandbox;
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_add_and_get() {
        let store = SandboxStore::new();
        store
            .add(test_sandbox("aaaa1111", "nginx_default_u_0"))
            .await
            .expect("add");

        let found = store.get("aaaa1111").await.expect("get");
        assert_eq!(found.id(), "aaaa1111");
    }

    #[tokio::test]
    async fn test_add_identical_is_noop() {
        let store = SandboxStore::new();
        store
            .add(test_sandbox("aaaa1111", "nginx_default_u_0"))
            .await
            .expect("add");
        store
            .add(test_sandbox("aaaa1111", "nginx_default_u_0"))
            .await
            .expect("identical add");
    }

    #[tokio::test]
    async fn test_add_conflicting_entry_fails() {
        let store = SandboxStore::new();
        store
            .add(test_sandbox("aaaa1111", "nginx_default_u_0"))
            .await
            .expect("add");
        assert_eq!(
            store.add(test_sandbox("aaaa1111", "redis_default_u_0")).await,
            Err(SandboxError::Exists { id: "aaaa1111".into() })
        );
    }

    #[tokio::test]
    async fn test_get_by_unique_prefix() {
        let store = SandboxStore::new();
        store
            .add(test_sandbox("aaaa1111", "nginx_default_u_0"))
            .await
            .expect("add");
        store
            .add(test_sandbox("bbbb2222", "redis_default_u_0"))
            .await
            .expect("add");

        let found = store.get("aaaa").await.expect("prefix get");
        assert_eq!(found.id(), "aaaa1111");
    }

    #[tokio::test]
    async fn test_get_by_ambiguous_prefix_fails() {
        let store = SandboxStore::new();
        store
            .add(test_sandbox("aaaa1111", "nginx_default_u_0"))
            .await
            .expect("add");
        store
            .add(test_sandbox("aaaa2222", "redis_default_u_0"))
            .await
            .expect("add");

        assert!(matches!(
            store.get("aaaa").await,
            Err(SandboxError::AmbiguousId { prefix }) if prefix == "aaaa"
        ));
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let store = SandboxStore::new();
        store
            .add(test_sandbox("aaaa1111", "nginx_default_u_0"))
            .await
            .expect("add");
        store.delete("aaaa1111").await;
        assert!(matches!(
            store.get("aaaa1111").await,
            Err(SandboxError::NotFound { id }) if id == "aaaa1111"
        ));
        // deleting again is a no-op
        store.delete("aaaa1111").await;
    }
}
