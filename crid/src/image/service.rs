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

//! The CRI image service: pull, index, remove, and report images.

use super::error::{ImageServiceError, Result};
use super::refs::ImageReference;
use super::store::ImageStore;
use crate::config::CridConfig;
use crate::engine::{self, Engine, PullCredentials, PullOpts};
use crate::snapshot::SnapshotStore;
use api::image::{
    AuthConfig, ImageFsInfoRequest, ImageFsInfoResponse, ImageService,
    ImageStatusRequest, ImageStatusResponse, ListImagesRequest,
    ListImagesResponse, LoadImageRequest, LoadImageResponse, PullImageRequest,
    PullImageResponse, RemoveImageRequest, RemoveImageResponse,
};
use api::runtime::{FilesystemIdentifier, FilesystemUsage};
use base64::Engine as _;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::Status;
use tracing::{info, warn};

/// Serves the image half of the CRI surface.
pub struct CriImageService {
    engine: Arc<dyn Engine>,
    images: Arc<ImageStore>,
    snapshots: Arc<SnapshotStore>,
    config: Arc<CridConfig>,
}

impl std::fmt::Debug for CriImageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriImageService").finish_non_exhaustive()
    }
}

impl CriImageService {
    pub fn new(
        engine: Arc<dyn Engine>,
        images: Arc<ImageStore>,
        snapshots: Arc<SnapshotStore>,
        config: Arc<CridConfig>,
    ) -> Self {
        Self { engine, images, snapshots, config }
    }

    pub(crate) fn store(&self) -> &Arc<ImageStore> {
        &self.images
    }

    /// Pulls a reference: mirrors in configured order, then the
    /// reference's own host; the first successful resolver wins.
    pub(crate) async fn pull(
        &self,
        raw: &str,
        auth: Option<&AuthConfig>,
    ) -> Result<String> {
        let parsed = ImageReference::parse(raw)?;
        let reference = parsed.canonical();

        let mut hosts = self.config.registry.mirrors.clone();
        hosts.push(parsed.host().to_string());

        let mut last_error = None;
        for host in hosts {
            let credentials = resolve_credentials(
                auth,
                self.config.registry.auths.get(&host),
            )?;
            let opts = PullOpts {
                host: host.clone(),
                credentials,
                snapshotter: self.config.snapshotter.clone(),
                max_concurrent_downloads: self.config.max_concurrent_downloads,
            };
            match self.engine.pull_image(&reference, opts).await {
                Ok(image) => {
                    info!("pulled image \"{reference}\" via {host}");
                    self.images.index(&reference, &image).await;
                    self.images.update(&reference).await?;
                    return Ok(image.id);
                }
                Err(e) => {
                    warn!("pull of \"{reference}\" via {host} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(ImageServiceError::PullFailed {
            reference: reference.clone(),
            source: last_error
                .unwrap_or(engine::EngineError::NotFound(reference)),
        })
    }

    async fn remove(&self, raw: &str) -> Result<()> {
        let id = match self.images.resolve(raw).await {
            Ok(id) => id,
            // Removing an image that is already gone succeeds.
            Err(super::store::ImageError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let image = self.images.get(&id).await?;
        for reference in image.references {
            let _ = engine::ok_if_not_found(
                self.engine.delete_image(&reference).await,
            )?;
            self.images.update(&reference).await?;
        }
        Ok(())
    }

    async fn fs_usage(&self) -> FilesystemUsage {
        let (used_bytes, inodes_used) = self.snapshots.totals().await;
        FilesystemUsage {
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            fs_id: Some(FilesystemIdentifier {
                mountpoint: self
                    .config
                    .image_fs_path()
                    .to_string_lossy()
                    .into_owned(),
            }),
            used_bytes: Some(used_bytes),
            inodes_used: Some(inodes_used),
        }
    }
}

/// Credential precedence: per-request auth over per-host configuration;
/// within one source, explicit username/password, then identity token,
/// then base64 basic, then registry token; anonymous otherwise.
fn resolve_credentials(
    request: Option<&AuthConfig>,
    configured: Option<&AuthConfig>,
) -> Result<Option<PullCredentials>> {
    for auth in [request, configured].into_iter().flatten() {
        if !auth.username.is_empty() && !auth.password.is_empty() {
            return Ok(Some(PullCredentials::Basic {
                username: auth.username.clone(),
                password: auth.password.clone(),
            }));
        }
        if !auth.identity_token.is_empty() {
            return Ok(Some(PullCredentials::IdentityToken(
                auth.identity_token.clone(),
            )));
        }
        if !auth.auth.is_empty() {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&auth.auth)
                .map_err(|e| {
                    ImageServiceError::InvalidAuth(format!(
                        "not base64: {e}"
                    ))
                })?;
            let decoded = String::from_utf8(decoded).map_err(|_| {
                ImageServiceError::InvalidAuth("not utf-8".to_string())
            })?;
            let (username, password) =
                decoded.split_once(':').ok_or_else(|| {
                    ImageServiceError::InvalidAuth(
                        "expected user:password".to_string(),
                    )
                })?;
            return Ok(Some(PullCredentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }));
        }
        if !auth.registry_token.is_empty() {
            return Ok(Some(PullCredentials::RegistryToken(
                auth.registry_token.clone(),
            )));
        }
    }
    Ok(None)
}

#[tonic::async_trait]
impl ImageService for CriImageService {
    #[tracing::instrument(skip(self))]
    async fn pull_image(
        &self,
        request: PullImageRequest,
    ) -> std::result::Result<PullImageResponse, Status> {
        let spec = request
            .image
            .ok_or(ImageServiceError::MissingField("image spec"))?;
        let image_ref = self.pull(&spec.image, request.auth.as_ref()).await?;
        Ok(PullImageResponse { image_ref })
    }

    #[tracing::instrument(skip(self))]
    async fn list_images(
        &self,
        request: ListImagesRequest,
    ) -> std::result::Result<ListImagesResponse, Status> {
        let filter_id = match request.filter.and_then(|f| f.image) {
            Some(spec) if !spec.image.is_empty() => {
                match self.images.resolve(&spec.image).await {
                    Ok(id) => Some(id),
                    Err(_) => return Ok(ListImagesResponse::default()),
                }
            }
            _ => None,
        };

        let images = self
            .images
            .list()
            .await
            .into_iter()
            .filter(|image| {
                filter_id.as_deref().map(|id| image.id == id).unwrap_or(true)
            })
            .map(|image| image.to_api())
            .collect();
        Ok(ListImagesResponse { images })
    }

    #[tracing::instrument(skip(self))]
    async fn image_status(
        &self,
        request: ImageStatusRequest,
    ) -> std::result::Result<ImageStatusResponse, Status> {
        let spec = request
            .image
            .ok_or(ImageServiceError::MissingField("image spec"))?;
        match self.images.resolve(&spec.image).await {
            Ok(id) => {
                let image =
                    self.images.get(&id).await.map_err(ImageServiceError::from)?;
                Ok(ImageStatusResponse {
                    image: Some(image.to_api()),
                    info: HashMap::new(),
                })
            }
            // An absent image is a null status, not an error.
            Err(super::store::ImageError::NotFound(_)) => {
                Ok(ImageStatusResponse::default())
            }
            Err(e) => Err(ImageServiceError::from(e).into()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn remove_image(
        &self,
        request: RemoveImageRequest,
    ) -> std::result::Result<RemoveImageResponse, Status> {
        let spec = request
            .image
            .ok_or(ImageServiceError::MissingField("image spec"))?;
        self.remove(&spec.image).await?;
        Ok(RemoveImageResponse {})
    }

    #[tracing::instrument(skip(self))]
    async fn image_fs_info(
        &self,
        _request: ImageFsInfoRequest,
    ) -> std::result::Result<ImageFsInfoResponse, Status> {
        Ok(ImageFsInfoResponse {
            image_filesystems: vec![self.fs_usage().await],
        })
    }

    #[tracing::instrument(skip(self))]
    async fn load_image(
        &self,
        request: LoadImageRequest,
    ) -> std::result::Result<LoadImageResponse, Status> {
        if request.path.is_empty() {
            return Err(ImageServiceError::MissingField("path").into());
        }
        let imported = self
            .engine
            .import_images(&request.path)
            .await
            .map_err(ImageServiceError::from)?;

        let mut names = vec![];
        for image in &imported {
            self.images.index(&image.name, image).await;
            names.push(image.name.clone());
        }
        info!("imported {} image(s) from {}", names.len(), request.path);
        Ok(LoadImageResponse { images: names })
    }
}
