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

//! The CNI plugin seam and pod network attachment types.
//!
//! The shell-out to CNI plugins is an external collaborator; the core
//! owns the attachment labels, the returned IP configuration, and the
//! primary-address selection rule.

use api::runtime::PortMapping;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

pub mod netns;

#[derive(Error, Debug)]
pub enum CniError {
    #[error("network plugin is not ready: {0}")]
    NotReady(String),
    #[error("network attachment not found for sandbox {0}")]
    NotFound(String),
    #[error("cni failure: {0}")]
    Failed(String),
}

impl CniError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CniError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CniError>;

/// One address handed back by the plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    pub ip: IpAddr,
    pub network: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
}

/// The attachment result the sandbox records for its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniResult {
    pub ips: Vec<IpConfig>,
}

/// Attachment labels passed down to the plugins.
#[derive(Debug, Clone, Default)]
pub struct AttachmentLabels {
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
    pub port_mappings: Vec<PortMapping>,
}

/// The CNI plugin layer.
#[tonic::async_trait]
pub trait Cni: Send + Sync + 'static {
    async fn setup(
        &self,
        id: &str,
        netns_path: &str,
        labels: &AttachmentLabels,
    ) -> Result<CniResult>;

    async fn remove(
        &self,
        id: &str,
        netns_path: &str,
        labels: &AttachmentLabels,
    ) -> Result<()>;

    /// The network-ready condition.
    fn status(&self) -> Result<()>;
}

/// Selects the pod's primary address: the first IPv4 wins, otherwise
/// the first address of any family. The rest become additional IPs.
pub fn select_pod_ips(result: &CniResult) -> (String, Vec<String>) {
    let primary = result
        .ips
        .iter()
        .position(|config| config.ip.is_ipv4())
        .or(if result.ips.is_empty() { None } else { Some(0) });

    let Some(primary) = primary else {
        return (String::new(), vec![]);
    };

    let ip = result.ips[primary].ip.to_string();
    let additional = result
        .ips
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != primary)
        .map(|(_, config)| config.ip.to_string())
        .collect();
    (ip, additional)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub(crate) struct FakeCni {
        result: Mutex<CniResult>,
        attached: Mutex<HashMap<String, String>>,
        fail_setup: Mutex<bool>,
        ready: Mutex<bool>,
    }

    impl FakeCni {
        pub fn new() -> Self {
            let cni = Self::default();
            *cni.ready.lock().expect("lock") = true;
            *cni.result.lock().expect("lock") = CniResult {
                ips: vec![IpConfig {
                    ip: "10.88.0.7".parse().expect("ip"),
                    network: None,
                    gateway: None,
                }],
            };
            cni
        }

        pub fn set_result(&self, result: CniResult) {
            *self.result.lock().expect("lock") = result;
        }

        pub fn fail_setup(&self) {
            *self.fail_setup.lock().expect("lock") = true;
        }

        pub fn set_ready(&self, ready: bool) {
            *self.ready.lock().expect("lock") = ready;
        }

        pub fn attached(&self, id: &str) -> bool {
            self.attached.lock().expect("lock").contains_key(id)
        }
    }

    #[tonic::async_trait]
    impl Cni for FakeCni {
        async fn setup(
            &self,
            id: &str,
            netns_path: &str,
            _labels: &AttachmentLabels,
        ) -> Result<CniResult> {
            if *self.fail_setup.lock().expect("lock") {
                return Err(CniError::Failed("injected setup failure".into()));
            }
            let _ = self
                .attached
                .lock()
                .expect("lock")
                .insert(id.to_string(), netns_path.to_string());
            Ok(self.result.lock().expect("lock").clone())
        }

        async fn remove(
            &self,
            id: &str,
            _netns_path: &str,
            _labels: &AttachmentLabels,
        ) -> Result<()> {
            let _ = self.attached.lock().expect("lock").remove(id);
            Ok(())
        }

        fn status(&self) -> Result<()> {
            if *self.ready.lock().expect("lock") {
                Ok(())
            } else {
                Err(CniError::NotReady("no network config".into()))
            }
        }
    }
}
