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

use super::refs::{self, RefError};
use crate::engine::{
    Engine, EngineError, EngineImage, IMAGE_MANAGED_LABEL,
};
use oci_spec::image::ImageConfiguration;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image \"{0}\" not found")]
    NotFound(String),
    #[error(transparent)]
    Ref(#[from] RefError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// An indexed image: one id, every reference pointing at it.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: String,
    pub references: Vec<String>,
    pub chain_id: String,
    pub size: i64,
    pub config: ImageConfiguration,
}

impl Image {
    /// The stop signal recorded in the image config, if any.
    pub fn stop_signal(&self) -> Option<String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.stop_signal().clone())
            .filter(|s| !s.is_empty())
    }

    pub fn to_api(&self) -> api::image::Image {
        let (uid, username) = self.user();
        api::image::Image {
            id: self.id.clone(),
            repo_tags: self
                .references
                .iter()
                .filter(|r| !r.contains('@'))
                .cloned()
                .collect(),
            repo_digests: self
                .references
                .iter()
                .filter(|r| r.contains('@'))
                .cloned()
                .collect(),
            size: self.size.max(0) as u64,
            uid,
            username,
            spec: None,
        }
    }

    fn user(&self) -> (Option<i64>, String) {
        let user = self
            .config
            .config()
            .as_ref()
            .and_then(|c| c.user().clone())
            .unwrap_or_default();
        let user = user.split(':').next().unwrap_or("").to_string();
        match user.parse::<i64>() {
            Ok(uid) => (Some(uid), String::new()),
            Err(_) => (None, user),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// reference → image id
    refs: HashMap<String, String>,
    /// image id → entry
    images: HashMap<String, Image>,
}

/// The in-memory image index, reconciled against the engine's image
/// metadata store. An entry exists iff its content has been observed
/// pulled-and-unpacked at least once.
pub struct ImageStore {
    engine: Arc<dyn Engine>,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore").finish_non_exhaustive()
    }
}

impl ImageStore {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine, inner: RwLock::new(Inner::default()) }
    }

    /// Resolves an image id, a tagged reference, or a bare name to an
    /// image id.
    pub async fn resolve(&self, raw: &str) -> Result<String> {
        let inner = self.inner.read().await;
        if refs::is_image_id(raw) {
            return if inner.images.contains_key(raw) {
                Ok(raw.to_string())
            } else {
                Err(ImageError::NotFound(raw.to_string()))
            };
        }
        let normalized = refs::normalize(raw)?;
        inner
            .refs
            .get(&normalized)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(raw.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<Image> {
        self.inner
            .read()
            .await
            .images
            .get(id)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Image> {
        self.inner.read().await.images.values().cloned().collect()
    }

    /// Reconciles one reference against the engine.
    ///
    /// Engine says gone: the reference leaves the index, and the image
    /// entry is garbage collected with its last reference. Engine has
    /// it: the managed label is ensured and the id ↔ reference mapping
    /// recorded.
    pub async fn update(&self, reference: &str) -> Result<()> {
        match self.engine.get_image(reference).await {
            Err(e) if e.is_not_found() => {
                self.drop_reference(reference).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
            Ok(engine_image) => {
                if !engine_image.labels.contains_key(IMAGE_MANAGED_LABEL) {
                    self.engine
                        .label_image(reference, IMAGE_MANAGED_LABEL, "true")
                        .await?;
                }
                self.index(reference, &engine_image).await;
                Ok(())
            }
        }
    }

    /// Records a freshly pulled or imported image.
    pub async fn index(&self, reference: &str, engine_image: &EngineImage) {
        let mut inner = self.inner.write().await;

        // A reference can repoint to a different id; drop the old link.
        if let Some(previous) = inner.refs.get(reference).cloned() {
            if previous != engine_image.id {
                remove_reference_from(&mut inner, &previous, reference);
            }
        }

        let _ = inner
            .refs
            .insert(reference.to_string(), engine_image.id.clone());
        match inner.images.get_mut(&engine_image.id) {
            Some(image) => {
                if !image.references.iter().any(|r| r == reference) {
                    image.references.push(reference.to_string());
                }
                image.chain_id = engine_image.chain_id.clone();
                image.size = engine_image.size;
                image.config = engine_image.config.clone();
            }
            None => {
                let _ = inner.images.insert(
                    engine_image.id.clone(),
                    Image {
                        id: engine_image.id.clone(),
                        references: vec![reference.to_string()],
                        chain_id: engine_image.chain_id.clone(),
                        size: engine_image.size,
                        config: engine_image.config.clone(),
                    },
                );
            }
        }
    }

    async fn drop_reference(&self, reference: &str) {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.refs.remove(reference) {
            remove_reference_from(&mut inner, &id, reference);
        }
    }
}

fn remove_reference_from(inner: &mut Inner, id: &str, reference: &str) {
    if let Some(image) = inner.images.get_mut(id) {
        image.references.retain(|r| r != reference);
        if image.references.is_empty() {
            let _ = inner.images.remove(id);
        }
    }
}
