//! Guest peripherals backed by fifo pairs: location, serial console and the
//! secure element.

use super::{CommandSource, LaunchError, binary_present, provision_fifos};
use crate::command::Command;
use crate::config::{InstanceConfig, LauncherConfig, SecureHal};
use crate::provision::{FIFO_GROUP_RW, FIFO_OWNER_RW};

pub struct GnssGrpcProxy<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> GnssGrpcProxy<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }
}

impl CommandSource for GnssGrpcProxy<'_> {
    fn name(&self) -> &'static str {
        "gnss_grpc_proxy"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        let binary = self.config.host_binary("gnss_grpc_proxy");
        if !self.config.enable_gnss_grpc_proxy || !binary_present(self.name(), &binary) {
            return Ok(vec![]);
        }

        let paths = &self.instance.paths;
        let pipes = [
            (paths.gnss_in_pipe(), FIFO_OWNER_RW),
            (paths.gnss_out_pipe(), FIFO_GROUP_RW),
        ];
        let Some([gnss_in, gnss_out]) = provision_fifos(self.name(), pipes) else {
            return Ok(vec![]);
        };

        let mut cmd = Command::builder(binary);
        cmd.arg("gnss_in_fd", gnss_in)
            .arg("gnss_out_fd", gnss_out)
            .arg("gnss_grpc_port", self.instance.gnss_grpc_proxy_server_port);
        // A fixture file switches the proxy to local replay.
        if let Some(file) = &self.instance.gnss_file_path {
            cmd.arg("gnss_file_path", file);
        }
        Ok(vec![cmd.build()])
    }
}

pub struct ConsoleForwarder<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> ConsoleForwarder<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }
}

impl CommandSource for ConsoleForwarder<'_> {
    fn name(&self) -> &'static str {
        "console_forwarder"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        if !self.config.console {
            return Ok(vec![]);
        }

        let paths = &self.instance.paths;
        let pipes = [
            (paths.console_in_pipe(), FIFO_OWNER_RW),
            (paths.console_out_pipe(), FIFO_GROUP_RW),
        ];
        let Some([console_in, console_out]) = provision_fifos(self.name(), pipes) else {
            return Ok(vec![]);
        };

        let mut cmd = Command::builder(self.config.host_binary("console_forwarder"));
        cmd.arg("console_in_fd", console_in)
            .arg("console_out_fd", console_out);
        Ok(vec![cmd.build()])
    }
}

/// Keymint and gatekeeper emulation, TPM-backed or in software.
pub struct SecureEnvironment<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> SecureEnvironment<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }

    fn implementation(&self, hal: SecureHal) -> &'static str {
        if self.config.secure_hals.contains(&hal) {
            "tpm"
        } else {
            "software"
        }
    }
}

impl CommandSource for SecureEnvironment<'_> {
    fn name(&self) -> &'static str {
        "secure_env"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        if !self.config.enable_secure_env {
            return Ok(vec![]);
        }

        let paths = &self.instance.paths;
        let [keymaster_in, keymaster_out] = paths.vm_fifo_pair("keymaster");
        let [gatekeeper_in, gatekeeper_out] = paths.vm_fifo_pair("gatekeeper");
        let pipes = [
            (keymaster_in, FIFO_OWNER_RW),
            (keymaster_out, FIFO_OWNER_RW),
            (gatekeeper_in, FIFO_OWNER_RW),
            (gatekeeper_out, FIFO_OWNER_RW),
        ];
        let Some([km_to_guest, km_from_guest, gk_to_guest, gk_from_guest]) =
            provision_fifos(self.name(), pipes)
        else {
            return Ok(vec![]);
        };

        let mut cmd = Command::builder(self.config.host_binary("secure_env"));
        cmd.arg("keymaster_fd_out", km_to_guest)
            .arg("keymaster_fd_in", km_from_guest)
            .arg("gatekeeper_fd_out", gk_to_guest)
            .arg("gatekeeper_fd_in", gk_from_guest)
            .arg("keymint_impl", self.implementation(SecureHal::Keymint))
            .arg("gatekeeper_impl", self.implementation(SecureHal::Gatekeeper));
        Ok(vec![cmd.build()])
    }
}
