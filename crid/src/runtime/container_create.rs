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

//! CreateContainer.

use super::error::{Result, RuntimeServiceError};
use super::undo::Undo;
use super::RuntimeService;
use crate::checkpoint::{self, STATUS_FILE};
use crate::container::{
    container_name, Container, ContainerCheckpoint, ContainerIo,
    ContainerMetadata, ContainerStatus,
};
use crate::engine::{
    ContainerCreateOpts, CONTAINER_METADATA_EXTENSION, KIND_CONTAINER,
    KIND_LABEL,
};
use crate::ident::generate_id;
use crate::oci;
use api::runtime::{ContainerConfig, PodSandboxConfig};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

impl RuntimeService {
    /// Creates a container inside a sandbox: reserve the name, resolve
    /// the image, generate the spec, wire IO, create the engine record,
    /// persist the checkpoint, index the entry.
    pub(crate) async fn create_container_in(
        &self,
        pod_sandbox_id: &str,
        config: Option<ContainerConfig>,
        _sandbox_config: Option<PodSandboxConfig>,
    ) -> Result<String> {
        let config = config
            .ok_or(RuntimeServiceError::MissingField("container config"))?;
        let metadata = config
            .metadata
            .clone()
            .ok_or(RuntimeServiceError::MissingField("container metadata"))?;
        if metadata.name.is_empty() {
            return Err(RuntimeServiceError::InvalidArgument(
                "container metadata requires a name".to_string(),
            ));
        }

        let sandbox = self.sandboxes.get(pod_sandbox_id).await?;
        let sandbox_metadata = sandbox
            .metadata
            .config
            .metadata
            .clone()
            .ok_or(RuntimeServiceError::MissingField("sandbox metadata"))?;

        let id = generate_id();
        let name = container_name(&metadata, &sandbox_metadata);
        self.container_names.reserve(&name, &id)?;

        let mut undo = Undo::new();
        {
            let names = self.container_names.clone();
            let name = name.clone();
            undo.push(async move { names.release_by_name(&name) });
        }

        match self
            .create_container_steps(&id, &name, &sandbox, config, &mut undo)
            .await
        {
            Ok(()) => {
                info!(
                    "CreateContainer for \"{name}\" returns container id \"{id}\""
                );
                Ok(id)
            }
            Err(e) => {
                warn!("CreateContainer for \"{name}\" failed, undoing: {e}");
                undo.fire();
                Err(e)
            }
        }
    }

    async fn create_container_steps(
        &self,
        id: &str,
        name: &str,
        sandbox: &crate::sandbox::Sandbox,
        config: ContainerConfig,
        undo: &mut Undo,
    ) -> Result<()> {
        // The image was pulled before create; resolve it locally.
        let image_spec = config
            .image
            .clone()
            .ok_or(RuntimeServiceError::MissingField("image spec"))?;
        let image_id = self.images.resolve(&image_spec.image).await?;
        let image = self.images.get(&image_id).await?;

        let sandbox_status = sandbox.status.get().await;
        let mut spec_config = oci::container_spec_config(
            id,
            sandbox.id(),
            sandbox_status.pid,
            &config,
            &sandbox.metadata.config,
            &image.config,
        );
        spec_config.image_id = image_id.clone();
        let spec = self.spec_generator.container_spec(&spec_config)?;

        // Volatile state: the FIFO set.
        let state = self.config.container_state(id);
        let io = Arc::new(ContainerIo::new(
            &state.join("io"),
            config.tty,
            config.stdin,
        )?);
        {
            let state = state.clone();
            undo.push(async move {
                let _ = crate::fsutil::remove_all_with_retry(&state).await;
            });
        }

        let log_path = container_log_path(&sandbox.metadata.config, &config);
        let metadata = ContainerMetadata {
            id: id.to_string(),
            name: name.to_string(),
            sandbox_id: sandbox.id().to_string(),
            config,
            image_ref: image_id.clone(),
            stop_signal: image.stop_signal(),
            log_path,
        };

        let mut extensions = HashMap::new();
        let _ = extensions.insert(
            CONTAINER_METADATA_EXTENSION.to_string(),
            serde_json::to_value(&metadata).map_err(|e| {
                RuntimeServiceError::Internal(format!(
                    "failed to encode container metadata: {e}"
                ))
            })?,
        );
        let mut labels = HashMap::new();
        let _ = labels
            .insert(KIND_LABEL.to_string(), KIND_CONTAINER.to_string());

        self.engine
            .create_container(ContainerCreateOpts {
                id: id.to_string(),
                image_id,
                snapshotter: self.config.snapshotter.clone(),
                snapshot_key: id.to_string(),
                spec,
                runtime_handler: sandbox.metadata.runtime_handler.clone(),
                labels,
                extensions,
            })
            .await?;
        {
            let engine = self.engine.clone();
            let id = id.to_string();
            undo.push(async move {
                match engine.delete_container(&id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("undo: failed to delete container: {e}"),
                }
            });
        }

        let root = self.config.container_root(id);
        tokio::fs::create_dir_all(&root).await?;
        {
            let root = root.clone();
            undo.push(async move {
                let _ = crate::fsutil::remove_all_with_retry(&root).await;
            });
        }

        let container =
            Container::new(metadata, ContainerStatus::new(Utc::now()), Some(io));
        checkpoint::store(
            &root.join(STATUS_FILE),
            &ContainerCheckpoint {
                metadata: container.metadata.clone(),
                status: container.status.get().await,
            },
        )
        .await?;

        self.containers.add(container).await?;
        Ok(())
    }
}

/// Absolute container log path: the sandbox log directory joined with
/// the container's relative log path, when both are set.
fn container_log_path(
    sandbox_config: &PodSandboxConfig,
    config: &ContainerConfig,
) -> Option<PathBuf> {
    if sandbox_config.log_directory.is_empty() || config.log_path.is_empty() {
        return None;
    }
    Some(PathBuf::from(&sandbox_config.log_directory).join(&config.log_path))
}
