//! Launch planning: decide which helper daemons run and how they are wired.
//!
//! ## Architecture
//!
//! ```text
//! LaunchPlanner::new(&LauncherConfig, &InstanceConfig)
//!     └─► [ConfigServer, ConsoleForwarder, BluetoothConnector, GnssGrpcProxy,
//!          LogcatReceiver, MetricsService, RootCanal, SecureEnvironment,
//!          TombstoneReceiver, VehicleHalServer]
//!             └─► plan()  →  Vec<Command>  →  ProcessMonitor
//! ```
//!
//! Each source either declines (empty list), emits descriptors, or fails with
//! a [`LaunchError`] that carries the process exit code. Only the launcher
//! binary turns that error into an exit.

mod bluetooth;
mod diagnostics;
mod peripherals;
mod servers;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::command::Command;
use crate::config::{InstanceConfig, LauncherConfig};
use crate::provision::{self, ProvisionError};

pub use bluetooth::{BluetoothConnector, RootCanal};
pub use diagnostics::{KernelLogMonitorData, LogcatReceiver, TombstoneReceiver, launch_kernel_log_monitor};
pub use peripherals::{ConsoleForwarder, GnssGrpcProxy, SecureEnvironment};
pub use servers::{ConfigServer, MetricsService, VehicleHalServer};

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

/// Process exit codes of the launcher. Supervisors match on these numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    ArgumentParsingError = 1,
    ConfigurationInitError = 3,
    InstanceDirCreationError = 4,
    PipeIoError = 10,
    MonitorCreationFailed = 13,
    ConfigServerError = 19,
    TombstoneServerError = 20,
    TombstoneDirCreationError = 21,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A mandatory resource could not be provisioned. The launch must stop.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("pipe i/o: {0}")]
    PipeIo(#[source] ProvisionError),

    #[error("config server: {0}")]
    ConfigServer(#[source] ProvisionError),

    #[error("tombstone receiver server: {0}")]
    TombstoneServer(#[source] ProvisionError),

    #[error("tombstone directory: {0}")]
    TombstoneDir(#[source] ProvisionError),
}

impl LaunchError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            LaunchError::PipeIo(_) => ExitCode::PipeIoError,
            LaunchError::ConfigServer(_) => ExitCode::ConfigServerError,
            LaunchError::TombstoneServer(_) => ExitCode::TombstoneServerError,
            LaunchError::TombstoneDir(_) => ExitCode::TombstoneDirCreationError,
        }
    }
}

// ---------------------------------------------------------------------------
// Command sources
// ---------------------------------------------------------------------------

/// One unit of launch policy.
///
/// `Ok(vec![])` means the feature is off or a non-essential resource failed;
/// `Err` means the whole launch must stop.
pub trait CommandSource {
    fn name(&self) -> &'static str;

    fn commands(&self) -> Result<Vec<Command>, LaunchError>;
}

/// Ordered registry of command sources for one instance.
pub struct LaunchPlanner<'a> {
    sources: Vec<Box<dyn CommandSource + 'a>>,
}

impl<'a> LaunchPlanner<'a> {
    pub fn new(config: &'a LauncherConfig, instance: &'a InstanceConfig) -> Self {
        Self::with_sources(vec![
            Box::new(ConfigServer::new(config, instance)),
            Box::new(ConsoleForwarder::new(config, instance)),
            Box::new(BluetoothConnector::new(config, instance)),
            Box::new(GnssGrpcProxy::new(config, instance)),
            Box::new(LogcatReceiver::new(config, instance)),
            Box::new(MetricsService::new(config)),
            Box::new(RootCanal::new(config, instance)),
            Box::new(SecureEnvironment::new(config, instance)),
            Box::new(TombstoneReceiver::new(config, instance)),
            Box::new(VehicleHalServer::new(config, instance)),
        ])
    }

    pub fn with_sources(sources: Vec<Box<dyn CommandSource + 'a>>) -> Self {
        Self { sources }
    }

    /// Registered source names, in run order.
    pub fn sources(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Run every source once, in order. Stops at the first fatal error.
    pub fn plan(&self) -> Result<Vec<Command>, LaunchError> {
        let mut plan = Vec::new();
        for source in &self.sources {
            let commands = source.commands()?;
            if commands.is_empty() {
                debug!(source = source.name(), "source declined");
                continue;
            }
            for command in &commands {
                info!(source = source.name(), command = %command.name(), "planned");
            }
            plan.extend(commands);
        }
        info!(count = plan.len(), "launch plan ready");
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Create and open every fifo in `pipes`. A failure is logged, drops the
/// handles opened so far and yields `None`.
pub(crate) fn provision_fifos<const N: usize>(
    source: &'static str,
    pipes: [(PathBuf, u32); N],
) -> Option<[std::os::fd::OwnedFd; N]> {
    let mut fds = Vec::with_capacity(N);
    for (path, mode) in &pipes {
        match provision::create_named_pipe(path, *mode) {
            Ok(fd) => fds.push(fd),
            Err(e) => {
                error!(source, error = %e, "failed to create fifo, feature disabled");
                return None;
            }
        }
    }
    fds.try_into().ok()
}

pub(crate) fn binary_present(source: &'static str, path: &Path) -> bool {
    let present = path.is_file();
    if !present {
        debug!(source, binary = %path.display(), "binary not installed");
    }
    present
}
