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

use super::Container;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ContainerError {
    #[error("container \"{id}\" not found")]
    NotFound { id: String },
    #[error("container id prefix \"{prefix}\" is ambiguous")]
    AmbiguousId { prefix: String },
    #[error("container \"{id}\" already exists")]
    Exists { id: String },
}

pub type Result<T> = std::result::Result<T, ContainerError>;

/// The in-memory container index, keyed by id.
#[derive(Debug, Default)]
pub struct ContainerStore {
    containers: RwLock<HashMap<String, Container>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a container. Re-adding the identical entry is a no-op; a
    /// different entry under the same id is a conflict.
    pub async fn add(&self, container: Container) -> Result<()> {
        let mut containers = self.containers.write().await;
        if let Some(existing) = containers.get(container.id()) {
            if existing.metadata.name == container.metadata.name {
                return Ok(());
            }
            return Err(ContainerError::Exists {
                id: container.id().to_string(),
            });
        }
        let _ = containers.insert(container.id().to_string(), container);
        Ok(())
    }

    /// Resolves a full id or a uniquely identifying prefix.
    pub async fn get(&self, id_or_prefix: &str) -> Result<Container> {
        let containers = self.containers.read().await;
        if let Some(container) = containers.get(id_or_prefix) {
            return Ok(container.clone());
        }
        if id_or_prefix.is_empty() {
            return Err(ContainerError::NotFound { id: String::new() });
        }

        let mut matched: Option<&Container> = None;
        for (id, container) in containers.iter() {
            if id.starts_with(id_or_prefix) {
                if matched.is_some() {
                    return Err(ContainerError::AmbiguousId {
                        prefix: id_or_prefix.to_string(),
                    });
                }
                matched = Some(container);
            }
        }
        matched.cloned().ok_or_else(|| ContainerError::NotFound {
            id: id_or_prefix.to_string(),
        })
    }

    pub async fn list(&self) -> Vec<Container> {
        self.containers.read().await.values().cloned().collect()
    }

    /// Every container belonging to the given sandbox.
    pub async fn list_by_sandbox(&self, sandbox_id: &str) -> Vec<Container> {
        self.containers
            .read()
            .await
            .values()
            .filter(|c| c.sandbox_id() == sandbox_id)
            .cloned()
            .collect()
    }

    /// Removes an entry. Removing an absent id is a no-op.
    pub async fn delete(&self, id: &str) {
        let _ = self.containers.write().await.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::super::container::testing::test_container;
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_add_get_delete() {
        let store = ContainerStore::new();
        store
            .add(test_container("cccc1111", "app_nginx_default_u_0", "ssss"))
            .await
            .expect("add");

        assert_eq!(store.get("cccc1111").await.expect("get").id(), "cccc1111");
        assert_eq!(store.get("cccc").await.expect("prefix").id(), "cccc1111");

        store.delete("cccc1111").await;
        assert!(matches!(
            store.get("cccc1111").await,
            Err(ContainerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_by_sandbox_filters() {
        let store = ContainerStore::new();
        store
            .add(test_container("c1", "a_nginx_default_u_0", "s1"))
            .await
            .expect("add");
        store
            .add(test_container("c2", "b_nginx_default_u_0", "s1"))
            .await
            .expect("add");
        store
            .add(test_container("c3", "a_redis_default_u_0", "s2"))
            .await
            .expect("add");

        let mut ids: Vec<String> = store
            .list_by_sandbox("s1")
            .await
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn test_conflicting_add_fails() {
        let store = ContainerStore::new();
        store
            .add(test_container("c1", "a_nginx_default_u_0", "s1"))
            .await
            .expect("add");
        assert_eq!(
            store.add(test_container("c1", "b_nginx_default_u_0", "s1")).await,
            Err(ContainerError::Exists { id: "c1".into() })
        );
    }
}
