//! Host bluetooth: the controller emulator and the bridge feeding it.

use super::{CommandSource, LaunchError, provision_fifos};
use crate::command::Command;
use crate::config::{InstanceConfig, LauncherConfig};
use crate::provision::FIFO_GROUP_RW;

/// Radio-link emulator that plays the bluetooth controller for the guest.
pub struct RootCanal<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> RootCanal<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }
}

impl CommandSource for RootCanal<'_> {
    fn name(&self) -> &'static str {
        "root_canal"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        if !self.config.enable_host_bluetooth {
            return Ok(vec![]);
        }

        // Ports are positional: test, hci, link.
        let mut cmd = Command::builder(self.config.host_binary("root-canal"));
        cmd.positional(self.instance.rootcanal_test_port)
            .positional(self.instance.rootcanal_hci_port)
            .positional(self.instance.rootcanal_link_port)
            .arg(
                "controller_properties_file",
                &self.config.rootcanal_controller_properties_file(),
            )
            .arg(
                "default_commands_file",
                &self.config.rootcanal_default_commands_file(),
            );
        Ok(vec![cmd.build()])
    }
}

/// Relays the guest's `bt_fifo_vm` pair to the emulator's hci port.
pub struct BluetoothConnector<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> BluetoothConnector<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }
}

impl CommandSource for BluetoothConnector<'_> {
    fn name(&self) -> &'static str {
        "bluetooth_connector"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        if !self.config.enable_host_bluetooth {
            return Ok(vec![]);
        }

        let [vm_in, vm_out] = self.instance.paths.vm_fifo_pair("bt");
        let pipes = [(vm_in, FIFO_GROUP_RW), (vm_out, FIFO_GROUP_RW)];
        let Some([to_guest, from_guest]) = provision_fifos(self.name(), pipes) else {
            return Ok(vec![]);
        };

        // The guest reads `.in`, so that is where the bridge writes.
        let mut cmd = Command::builder(self.config.host_binary("bt_connector"));
        cmd.arg("bt_out", to_guest)
            .arg("bt_in", from_guest)
            .arg("hci_port", self.instance.rootcanal_hci_port)
            .arg("link_port", self.instance.rootcanal_link_port)
            .arg("test_port", self.instance.rootcanal_test_port);
        Ok(vec![cmd.build()])
    }
}
