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

use super::refs::RefError;
use super::store::ImageError;
use crate::engine::EngineError;
use thiserror::Error;
use tonic::Status;
use tracing::error;

pub(crate) type Result<T> = std::result::Result<T, ImageServiceError>;

#[derive(Error, Debug)]
pub(crate) enum ImageServiceError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid image auth: {0}")]
    InvalidAuth(String),
    #[error("failed to pull image \"{reference}\": {source}")]
    PullFailed { reference: String, source: EngineError },
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Ref(#[from] RefError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<ImageServiceError> for Status {
    fn from(err: ImageServiceError) -> Self {
        let msg = err.to_string();
        error!("{msg}");
        match err {
            ImageServiceError::MissingField(_)
            | ImageServiceError::InvalidAuth(_)
            | ImageServiceError::Ref(_)
            | ImageServiceError::Image(ImageError::Ref(_)) => {
                Status::invalid_argument(msg)
            }
            ImageServiceError::Image(ImageError::NotFound(_)) => {
                Status::not_found(msg)
            }
            ImageServiceError::PullFailed { .. } => Status::unavailable(msg),
            ImageServiceError::Image(ImageError::Engine(e))
            | ImageServiceError::Engine(e) => match e {
                EngineError::NotFound(_) => Status::not_found(msg),
                EngineError::AlreadyExists(_) => Status::already_exists(msg),
                EngineError::InvalidArgument(_) => {
                    Status::invalid_argument(msg)
                }
                EngineError::Unavailable(_) => Status::unavailable(msg),
                EngineError::Failed(_) => Status::internal(msg),
            },
        }
    }
}
