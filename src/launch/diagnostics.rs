//! Receivers for guest diagnostics: logcat, kernel log and crash tombstones.

use std::os::fd::OwnedFd;

use tracing::{error, info};

use super::{CommandSource, LaunchError, provision_fifos};
use crate::command::Command;
use crate::config::{InstanceConfig, LauncherConfig};
use crate::provision::{self, FIFO_OWNER_RW, SHARED_DIR_MODE};

/// Drains the guest logcat stream from the `logcat-pipe` fifo.
pub struct LogcatReceiver<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> LogcatReceiver<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }
}

impl CommandSource for LogcatReceiver<'_> {
    fn name(&self) -> &'static str {
        "logcat_receiver"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        let pipes = [(self.instance.paths.logcat_pipe(), FIFO_OWNER_RW)];
        let Some([pipe]) = provision_fifos(self.name(), pipes) else {
            return Ok(vec![]);
        };

        let mut cmd = Command::builder(self.config.host_binary("logcat_receiver"));
        cmd.arg("log_pipe_fd", pipe);
        Ok(vec![cmd.build()])
    }
}

/// Collects crash dumps the guest pushes over the tombstone port.
pub struct TombstoneReceiver<'a> {
    config: &'a LauncherConfig,
    instance: &'a InstanceConfig,
}

impl<'a> TombstoneReceiver<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self { config, instance }
    }
}

impl CommandSource for TombstoneReceiver<'_> {
    fn name(&self) -> &'static str {
        "tombstone_receiver"
    }

    fn commands(&self) -> Result<Vec<Command>, LaunchError> {
        let dir = self.instance.paths.tombstone_dir();
        provision::ensure_directory(&dir, SHARED_DIR_MODE).map_err(|e| {
            error!(error = %e, "failed to create tombstone directory");
            LaunchError::TombstoneDir(e)
        })?;

        let spec = self.instance.bind_spec(self.instance.tombstone_receiver_port);
        let socket = provision::listen(spec).map_err(|e| {
            error!(error = %e, "unable to create tombstone server socket");
            LaunchError::TombstoneServer(e)
        })?;

        let mut cmd = Command::builder(self.config.host_binary("tombstone_receiver"));
        cmd.arg("server_fd", socket).arg("tombstone_dir", &dir);
        Ok(vec![cmd.build()])
    }
}

/// The kernel log monitor command plus the read ends of its event pipes.
///
/// `subscribers[i]` receives the boot events written to the i-th fd listed in
/// `-subscriber_fds`.
#[derive(Debug, Default)]
pub struct KernelLogMonitorData {
    pub commands: Vec<Command>,
    pub subscribers: Vec<OwnedFd>,
}

/// Plan the kernel log monitor with `subscriber_count` boot-event pipes.
///
/// A missing `kernel-log-pipe` only disables the monitor; failing to create an
/// event pipe is fatal.
pub fn launch_kernel_log_monitor(
    config: &LauncherConfig,
    instance: &InstanceConfig,
    subscriber_count: usize,
) -> Result<KernelLogMonitorData, LaunchError> {
    let pipes = [(instance.paths.kernel_log_pipe(), FIFO_OWNER_RW)];
    let Some([pipe]) = provision_fifos("kernel_log_monitor", pipes) else {
        return Ok(KernelLogMonitorData::default());
    };

    let mut cmd = Command::builder(config.host_binary("kernel_log_monitor"));
    cmd.arg("log_pipe_fd", pipe);

    let mut subscribers = Vec::with_capacity(subscriber_count);
    if subscriber_count > 0 {
        cmd.flag("subscriber_fds");
        for i in 0..subscriber_count {
            let (read_end, write_end) = provision::anonymous_pipe().map_err(|e| {
                error!(error = %e, "unable to create kernel log events pipe");
                LaunchError::PipeIo(e)
            })?;
            if i > 0 {
                cmd.append(",");
            }
            cmd.append(write_end);
            subscribers.push(read_end);
        }
    }

    info!(subscribers = subscriber_count, "kernel log monitor planned");
    Ok(KernelLogMonitorData {
        commands: vec![cmd.build()],
        subscribers,
    })
}
