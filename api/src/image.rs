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

//! Image lifecycle messages and the [`ImageService`] contract.

use crate::runtime::{FilesystemUsage, ImageSpec, PodSandboxConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tonic::Status;

/// Registry credentials attached to a pull. Precedence over configured
/// per-host auth is resolved by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    /// base64-encoded `username:password`.
    pub auth: String,
    pub server_address: String,
    pub identity_token: String,
    pub registry_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullImageRequest {
    pub image: Option<ImageSpec>,
    pub auth: Option<AuthConfig>,
    pub sandbox_config: Option<PodSandboxConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullImageResponse {
    /// Resolved image id (digest of the image config).
    pub image_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageFilter {
    pub image: Option<ImageSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListImagesRequest {
    pub filter: Option<ImageFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub size: u64,
    pub uid: Option<i64>,
    pub username: String,
    pub spec: Option<ImageSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListImagesResponse {
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageStatusRequest {
    pub image: Option<ImageSpec>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageStatusResponse {
    pub image: Option<Image>,
    pub info: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoveImageRequest {
    pub image: Option<ImageSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoveImageResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageFsInfoRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageFsInfoResponse {
    pub image_filesystems: Vec<FilesystemUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadImageRequest {
    /// Path to an image tar on the local filesystem.
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadImageResponse {
    /// References of the imported images.
    pub images: Vec<String>,
}

/// The image lifecycle contract: index, pull, remove, and report images
/// and the image filesystem.
#[tonic::async_trait]
pub trait ImageService: Send + Sync + 'static {
    async fn pull_image(
        &self,
        request: PullImageRequest,
    ) -> Result<PullImageResponse, Status>;

    async fn list_images(
        &self,
        request: ListImagesRequest,
    ) -> Result<ListImagesResponse, Status>;

    async fn image_status(
        &self,
        request: ImageStatusRequest,
    ) -> Result<ImageStatusResponse, Status>;

    async fn remove_image(
        &self,
        request: RemoveImageRequest,
    ) -> Result<RemoveImageResponse, Status>;

    async fn image_fs_info(
        &self,
        request: ImageFsInfoRequest,
    ) -> Result<ImageFsInfoResponse, Status>;

    async fn load_image(
        &self,
        request: LoadImageRequest,
    ) -> Result<LoadImageResponse, Status>;
}
