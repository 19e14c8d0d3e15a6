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

//! TLS posture of the streaming endpoint.
//!
//! Certificate material (including the self-signed certificate with
//! SANs for every local interface) is produced outside the lifecycle
//! core; the core only validates and records the chosen mode.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TlsConfigError {
    #[error(
        "tls cert and key must be configured together, got cert={cert} key={key}"
    )]
    Mismatched { cert: bool, key: bool },
}

/// How the streaming listener terminates TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain listener.
    #[default]
    Disabled,
    /// A certificate generated at first use, with SANs for every local
    /// interface address.
    SelfSigned,
    /// An operator-provided key pair.
    KeyPair { cert: PathBuf, key: PathBuf },
}

impl TlsMode {
    /// Resolves the mode from configuration inputs, rejecting a lone
    /// cert or key.
    pub fn resolve(
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
        self_signed: bool,
    ) -> Result<Self, TlsConfigError> {
        match (cert, key) {
            (Some(cert), Some(key)) => Ok(TlsMode::KeyPair { cert, key }),
            (None, None) if self_signed => Ok(TlsMode::SelfSigned),
            (None, None) => Ok(TlsMode::Disabled),
            (cert, key) => Err(TlsConfigError::Mismatched {
                cert: cert.is_some(),
                key: key.is_some(),
            }),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            TlsMode::Disabled => "http",
            _ => "https",
        }
    }
}
