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

//! The OCI spec generation seam.
//!
//! Profile assembly (seccomp/AppArmor/SELinux, cgroup and namespace
//! wiring) lives outside the lifecycle core. The core enumerates every
//! knob in a flat configuration record; the external [`SpecGenerator`]
//! turns the record into an [`oci_spec::runtime::Spec`].

use api::runtime::{
    ContainerConfig, Device, LinuxContainerResources, Mount, PodSandboxConfig,
    SecurityProfile, SelinuxOption,
};
use oci_spec::image::ImageConfiguration;
use oci_spec::runtime::{
    LinuxCpuBuilder, LinuxMemoryBuilder, LinuxResources, LinuxResourcesBuilder,
    Spec,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("invalid spec configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to assemble spec: {0}")]
    Assembly(String),
}

pub type Result<T> = std::result::Result<T, SpecError>;

/// Everything the generator needs to produce a sandbox spec.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpecConfig {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub image_id: String,
    pub netns_path: String,
    pub cgroup_parent: String,
    pub resolv_conf_path: String,
    pub hostname_path: String,
    pub hosts_path: String,
    pub shm_path: String,
    pub sysctls: HashMap<String, String>,
    pub privileged: bool,
    pub selinux: Option<SelinuxOption>,
    pub seccomp: Option<SecurityProfile>,
    pub runtime_handler: String,
    pub pod_annotations: HashMap<String, String>,
}

/// The flat options record for a container spec. Each field stands for
/// one option the source-level builder would layer onto the spec.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpecConfig {
    pub id: String,
    pub sandbox_id: String,
    pub sandbox_pid: u32,
    pub image_id: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<Device>,
    pub privileged: bool,
    pub no_new_privileges: bool,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub run_as_username: String,
    pub readonly_rootfs: bool,
    pub supplemental_groups: Vec<i64>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
    pub cgroup_parent: String,
    pub oom_score_adj: i64,
    pub resources: Option<LinuxResources>,
    pub apparmor: Option<SecurityProfile>,
    pub seccomp: Option<SecurityProfile>,
    pub selinux: Option<SelinuxOption>,
    pub hostname: String,
    pub terminal: bool,
    pub stdin: bool,
    pub pod_annotations: HashMap<String, String>,
    pub container_annotations: HashMap<String, String>,
}

/// The external OCI spec generator.
pub trait SpecGenerator: Send + Sync + 'static {
    fn sandbox_spec(&self, config: &SandboxSpecConfig) -> Result<Spec>;
    fn container_spec(&self, config: &ContainerSpecConfig) -> Result<Spec>;
}

/// Builds the container options record from the CRI container config,
/// the sandbox it joins, and the resolved image configuration.
///
/// Command resolution follows the CRI contract: an explicit command
/// replaces the image entrypoint; explicit args replace the image cmd
/// only alongside an explicit command.
pub fn container_spec_config(
    id: &str,
    sandbox_id: &str,
    sandbox_pid: u32,
    config: &ContainerConfig,
    sandbox_config: &PodSandboxConfig,
    image_config: &ImageConfiguration,
) -> ContainerSpecConfig {
    let image = image_config.config().as_ref();

    let (command, args) = resolve_command(
        &config.command,
        &config.args,
        image.and_then(|c| c.entrypoint().clone()).unwrap_or_default(),
        image.and_then(|c| c.cmd().clone()).unwrap_or_default(),
    );

    let mut env: Vec<String> =
        image.and_then(|c| c.env().clone()).unwrap_or_default();
    env.extend(config.envs.iter().map(|kv| format!("{}={}", kv.key, kv.value)));

    let working_dir = if config.working_dir.is_empty() {
        image
            .and_then(|c| c.working_dir().clone())
            .unwrap_or_default()
    } else {
        config.working_dir.clone()
    };

    let security = config
        .linux
        .as_ref()
        .and_then(|linux| linux.security_context.as_ref());

    let mut spec_config = ContainerSpecConfig {
        id: id.to_string(),
        sandbox_id: sandbox_id.to_string(),
        sandbox_pid,
        command,
        args,
        working_dir,
        env,
        mounts: config.mounts.clone(),
        devices: config.devices.clone(),
        hostname: sandbox_config.hostname.clone(),
        terminal: config.tty,
        stdin: config.stdin,
        pod_annotations: sandbox_config.annotations.clone(),
        container_annotations: config.annotations.clone(),
        cgroup_parent: sandbox_config
            .linux
            .as_ref()
            .map(|l| l.cgroup_parent.clone())
            .unwrap_or_default(),
        ..Default::default()
    };

    if let Some(resources) =
        config.linux.as_ref().and_then(|linux| linux.resources.as_ref())
    {
        spec_config.oom_score_adj = resources.oom_score_adj;
        spec_config.resources = linux_resources(resources).ok();
    }

    if let Some(ctx) = security {
        spec_config.privileged = ctx.privileged;
        spec_config.no_new_privileges = ctx.no_new_privs;
        spec_config.run_as_user = ctx.run_as_user;
        spec_config.run_as_group = ctx.run_as_group;
        spec_config.run_as_username = ctx.run_as_username.clone();
        spec_config.readonly_rootfs = ctx.readonly_rootfs;
        spec_config.supplemental_groups = ctx.supplemental_groups.clone();
        spec_config.masked_paths = ctx.masked_paths.clone();
        spec_config.readonly_paths = ctx.readonly_paths.clone();
        spec_config.apparmor = ctx.apparmor.clone();
        spec_config.seccomp = ctx.seccomp.clone();
        spec_config.selinux = ctx.selinux_options.clone();
        if let Some(caps) = ctx.capabilities.as_ref() {
            spec_config.add_capabilities = caps.add_capabilities.clone();
            spec_config.drop_capabilities = caps.drop_capabilities.clone();
        }
    }

    if spec_config.run_as_username.is_empty() {
        if let Some(user) =
            image.and_then(|c| c.user().clone()).filter(|u| !u.is_empty())
        {
            spec_config.run_as_username = user;
        }
    }

    spec_config
}

fn resolve_command(
    command: &[String],
    args: &[String],
    entrypoint: Vec<String>,
    cmd: Vec<String>,
) -> (Vec<String>, Vec<String>) {
    match (command.is_empty(), args.is_empty()) {
        (false, _) => (command.to_vec(), args.to_vec()),
        (true, false) => (entrypoint, args.to_vec()),
        (true, true) => (entrypoint, cmd),
    }
}

/// Converts CRI resource limits into the OCI resources block.
pub fn linux_resources(
    resources: &LinuxContainerResources,
) -> Result<LinuxResources> {
    let mut cpu = LinuxCpuBuilder::default();
    if resources.cpu_shares > 0 {
        cpu = cpu.shares(resources.cpu_shares as u64);
    }
    if resources.cpu_quota > 0 {
        cpu = cpu.quota(resources.cpu_quota);
    }
    if resources.cpu_period > 0 {
        cpu = cpu.period(resources.cpu_period as u64);
    }
    if !resources.cpuset_cpus.is_empty() {
        cpu = cpu.cpus(resources.cpuset_cpus.clone());
    }
    if !resources.cpuset_mems.is_empty() {
        cpu = cpu.mems(resources.cpuset_mems.clone());
    }

    let mut memory = LinuxMemoryBuilder::default();
    if resources.memory_limit_in_bytes > 0 {
        memory = memory.limit(resources.memory_limit_in_bytes);
    }
    if resources.memory_swap_limit_in_bytes > 0 {
        memory = memory.swap(resources.memory_swap_limit_in_bytes);
    }

    LinuxResourcesBuilder::default()
        .cpu(cpu.build().map_err(|e| SpecError::Assembly(e.to_string()))?)
        .memory(
            memory.build().map_err(|e| SpecError::Assembly(e.to_string()))?,
        )
        .build()
        .map_err(|e| SpecError::Assembly(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::test_image_config;
    use api::runtime::KeyValue;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_explicit_command_replaces_entrypoint_and_cmd() {
        let config = ContainerConfig {
            command: vec!["/bin/sh".into()],
            args: vec!["-c".into(), "exit 0".into()],
            ..Default::default()
        };
        let spec_config = container_spec_config(
            "c1",
            "s1",
            42,
            &config,
            &PodSandboxConfig::default(),
            &test_image_config(None),
        );
        assert_eq!(spec_config.command, vec!["/bin/sh".to_string()]);
        assert_eq!(
            spec_config.args,
            vec!["-c".to_string(), "exit 0".to_string()]
        );
    }

    #[test]
    fn test_image_entrypoint_and_cmd_used_when_unset() {
        let spec_config = container_spec_config(
            "c1",
            "s1",
            42,
            &ContainerConfig::default(),
            &PodSandboxConfig::default(),
            &test_image_config(None),
        );
        assert_eq!(spec_config.command, vec!["/entry".to_string()]);
        assert_eq!(spec_config.args, vec!["serve".to_string()]);
    }

    #[test]
    fn test_args_without_command_drop_image_cmd() {
        let config = ContainerConfig {
            args: vec!["--fast".into()],
            ..Default::default()
        };
        let spec_config = container_spec_config(
            "c1",
            "s1",
            42,
            &config,
            &PodSandboxConfig::default(),
            &test_image_config(None),
        );
        assert_eq!(spec_config.command, vec!["/entry".to_string()]);
        assert_eq!(spec_config.args, vec!["--fast".to_string()]);
    }

    #[test]
    fn test_env_appends_to_image_env() {
        let config = ContainerConfig {
            envs: vec![KeyValue { key: "A".into(), value: "1".into() }],
            ..Default::default()
        };
        let spec_config = container_spec_config(
            "c1",
            "s1",
            42,
            &config,
            &PodSandboxConfig::default(),
            &test_image_config(None),
        );
        assert_eq!(
            spec_config.env,
            vec!["PATH=/usr/bin".to_string(), "A=1".to_string()]
        );
    }
}
