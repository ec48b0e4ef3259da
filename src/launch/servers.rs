//! Daemons that serve the guest over a socket or need no wiring at all.

use tracing::error;

use super::{CommandSource, LaunchError, binary_present};
use crate::command::Command;
use crate::config::{InstanceConfig, LauncherConfig, MetricsOptIn};
use crate::paths;
use crate::provision;

/// Answers guest configuration queries on the per-instance config port.
pub struct ConfigServer<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> ConfigServer<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }
}

impl CommandSource for ConfigServer<'_> {
    fn name(&self) -> &'static str {
        "config_server"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        let spec = self.instance.bind_spec(self.instance.config_server_port);
        let socket = provision::listen(spec).map_err(|e| {
            error!(error = %e, "unable to create configuration server socket");
            LaunchError::ConfigServer(e)
        })?;

        let mut cmd = Command::builder(self.config.host_binary("config_server"));
        cmd.arg("server_fd", socket);
        Ok(vec![cmd.build()])
    }
}

/// Uploads anonymous usage metrics when the user opted in.
pub struct MetricsService<'a> {
    config: &'a LauncherConfig,
}

impl<'a> MetricsService<'a> {
    pub fn new(config: &'a LauncherConfig) -> Self {
        Self { config }
    }
}

impl CommandSource for MetricsService<'_> {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        if self.config.enable_metrics != MetricsOptIn::Yes {
            return Ok(vec![]);
        }
        Ok(vec![Command::builder(self.config.host_binary("metrics")).build()])
    }
}

/// Emulated vehicle bus, reachable by the guest over vsock cid 2.
pub struct VehicleHalServer<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> VehicleHalServer<'a> {
    /// The server always listens on the host cid.
    const SERVER_CID: u32 = 2;

    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }
}

impl CommandSource for VehicleHalServer<'_> {
    fn name(&self) -> &'static str {
        "vehicle_hal_server"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        let binary = self.config.vehicle_hal_server_binary();
        if !self.config.enable_vehicle_hal_server || !binary_present(self.name(), &binary) {
            return Ok(vec![]);
        }

        let instance_paths = &self.instance.paths;
        let mut cmd = Command::builder(binary);
        cmd.arg("server_cid", Self::SERVER_CID)
            .arg("server_port", self.instance.vehicle_hal_server_port)
            .arg(
                "power_state_file",
                &paths::absolute(&instance_paths.per_instance_path("power_state")),
            )
            .arg(
                "power_state_socket",
                &paths::absolute(&instance_paths.per_instance_path("power_state_socket")),
            );
        Ok(vec![cmd.build()])
    }
}
