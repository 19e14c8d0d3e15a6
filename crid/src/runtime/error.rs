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

use crate::checkpoint::CheckpointError;
use crate::cni::netns::NetNsError;
use crate::cni::CniError;
use crate::container::ContainerError;
use crate::engine::EngineError;
use crate::image::ImageError;
use crate::oci::SpecError;
use crate::registrar::RegistrarError;
use crate::sandbox::SandboxError;
use crate::streaming::StreamError;
use thiserror::Error;
use tonic::Status;
use tracing::error;

pub(crate) type Result<T> = std::result::Result<T, RuntimeServiceError>;

#[derive(Error, Debug)]
pub enum RuntimeServiceError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("{0}")]
    Internal(String),
    #[error("failed to ensure sandbox image \"{image}\": {message}")]
    SandboxImage { image: String, message: String },
    #[error(transparent)]
    Registrar(#[from] RegistrarError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Cni(#[from] CniError),
    #[error(transparent)]
    NetNs(#[from] NetNsError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RuntimeServiceError> for Status {
    fn from(err: RuntimeServiceError) -> Self {
        let msg = err.to_string();
        error!("{msg}");
        match err {
            RuntimeServiceError::MissingField(_)
            | RuntimeServiceError::InvalidArgument(_)
            | RuntimeServiceError::Sandbox(SandboxError::AmbiguousId {
                ..
            })
            | RuntimeServiceError::Container(ContainerError::AmbiguousId {
                ..
            }) => Status::invalid_argument(msg),
            RuntimeServiceError::FailedPrecondition(_) => {
                Status::failed_precondition(msg)
            }
            RuntimeServiceError::Registrar(_)
            | RuntimeServiceError::Sandbox(SandboxError::Exists { .. })
            | RuntimeServiceError::Container(ContainerError::Exists {
                ..
            }) => Status::already_exists(msg),
            RuntimeServiceError::Sandbox(SandboxError::NotFound { .. })
            | RuntimeServiceError::Container(ContainerError::NotFound {
                ..
            })
            | RuntimeServiceError::Image(ImageError::NotFound(_)) => {
                Status::not_found(msg)
            }
            RuntimeServiceError::Image(ImageError::Ref(_)) => {
                Status::invalid_argument(msg)
            }
            RuntimeServiceError::SandboxImage { .. }
            | RuntimeServiceError::Cni(_) => Status::unavailable(msg),
            RuntimeServiceError::Engine(e)
            | RuntimeServiceError::Image(ImageError::Engine(e)) => match e {
                EngineError::NotFound(_) => Status::not_found(msg),
                EngineError::AlreadyExists(_) => Status::already_exists(msg),
                EngineError::InvalidArgument(_) => {
                    Status::invalid_argument(msg)
                }
                EngineError::Unavailable(_) => Status::unavailable(msg),
                EngineError::Failed(_) => Status::internal(msg),
            },
            RuntimeServiceError::Stream(e) => e.into(),
            RuntimeServiceError::NetNs(_)
            | RuntimeServiceError::Spec(_)
            | RuntimeServiceError::Checkpoint(_)
            | RuntimeServiceError::Io(_)
            | RuntimeServiceError::Internal(_) => Status::internal(msg),
        }
    }
}
