//! Launcher configuration: global feature switches plus one instance table.
//!
//! Both halves come from a single TOML file and are passed explicitly to the
//! planner and every command source; nothing reads configuration ambiently.
//!
//! ```toml
//! host_artifacts_dir = "/opt/vdevice"
//! enable_host_bluetooth = true
//! enable_metrics = "no"
//! secure_hals = ["keymint", "gatekeeper"]
//!
//! [instance]
//! instance_num = 1
//! instance_dir = "/var/tmp/vdevice/instance.1"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::InstancePaths;
use crate::provision::{BindSpec, ServerTransport};

// Port bases. vsock ports are offset by the guest cid, plain ports by the
// instance number.
const CONFIG_SERVER_VSOCK_BASE: u32 = 6800;
const TOMBSTONE_RECEIVER_VSOCK_BASE: u32 = 6600;
const GNSS_GRPC_PROXY_BASE: u32 = 7200;
const ROOTCANAL_HCI_BASE: u32 = 7300;
const ROOTCANAL_LINK_BASE: u32 = 7400;
const ROOTCANAL_TEST_BASE: u32 = 7500;
const VEHICLE_HAL_SERVER_BASE: u32 = 9210;

const VEHICLE_HAL_SERVER_BINARY: &str =
    "android.hardware.automotive.vehicle@2.0-virtualization-grpc-server";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("instance_num must be at least 1")]
    InstanceNum,

    #[error("instance {instance_num} with guest cid {vsock_guest_cid} puts a port past u32::MAX")]
    PortOutOfRange { instance_num: u32, vsock_guest_cid: u32 },

    #[error("custom action #{index}: {reason}")]
    CustomAction { index: usize, reason: String },
}

// ---------------------------------------------------------------------------
// Global configuration
// ---------------------------------------------------------------------------

/// Opt-in state for anonymous usage metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsOptIn {
    Yes,
    No,
    #[default]
    Unknown,
}

/// Security HALs that are backed by the host TPM instead of software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecureHal {
    Keymint,
    Gatekeeper,
}

/// A control-panel button bound to a custom action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub command: String,
    pub title: String,
    #[serde(default)]
    pub icon_name: String,
}

/// A frontend custom action: either a guest shell command or a host server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAction {
    #[serde(default)]
    pub shell_command: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub buttons: Vec<ActionButton>,
}

impl CustomAction {
    /// Check the action has a shape the frontend can wire up.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.shell_command, &self.server) {
            (Some(_), Some(_)) => Err("sets both shell_command and server".into()),
            (None, None) => Err("sets neither shell_command nor server".into()),
            (Some(cmd), None) if self.buttons.len() != 1 => Err(format!(
                "expected exactly one button for shell command {cmd:?}, found {}",
                self.buttons.len()
            )),
            (None, Some(server)) if self.buttons.is_empty() => {
                Err(format!("server {server:?} declares no buttons"))
            }
            _ => Ok(()),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_secure_hals() -> BTreeSet<SecureHal> {
    BTreeSet::from([SecureHal::Keymint, SecureHal::Gatekeeper])
}

fn default_kernel_log_subscribers() -> usize {
    1
}

/// Settings shared by every instance launched from one host install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Root of the host package; helper binaries live under `bin/`.
    pub host_artifacts_dir: PathBuf,

    #[serde(default = "default_true")]
    pub enable_host_bluetooth: bool,

    #[serde(default)]
    pub enable_gnss_grpc_proxy: bool,

    #[serde(default = "default_true")]
    pub enable_vehicle_hal_server: bool,

    /// Overrides the vehicle HAL server binary under `bin/`.
    #[serde(default)]
    pub vehicle_hal_server_binary: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enable_secure_env: bool,

    /// Enable the serial console forwarder.
    #[serde(default)]
    pub console: bool,

    #[serde(default)]
    pub enable_metrics: MetricsOptIn,

    #[serde(default = "default_secure_hals")]
    pub secure_hals: BTreeSet<SecureHal>,

    /// Number of boot-event subscribers fed by the kernel log monitor.
    #[serde(default = "default_kernel_log_subscribers")]
    pub kernel_log_subscribers: usize,

    #[serde(default)]
    pub custom_actions: Vec<CustomAction>,
}

impl LauncherConfig {
    /// Defaults for a host package rooted at `host_artifacts_dir`.
    pub fn new(host_artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_artifacts_dir: host_artifacts_dir.into(),
            enable_host_bluetooth: true,
            enable_gnss_grpc_proxy: false,
            enable_vehicle_hal_server: true,
            vehicle_hal_server_binary: None,
            enable_secure_env: true,
            console: false,
            enable_metrics: MetricsOptIn::Unknown,
            secure_hals: default_secure_hals(),
            kernel_log_subscribers: default_kernel_log_subscribers(),
            custom_actions: Vec::new(),
        }
    }

    pub fn host_binary(&self, name: &str) -> PathBuf {
        self.host_artifacts_dir.join("bin").join(name)
    }

    pub fn vehicle_hal_server_binary(&self) -> PathBuf {
        self.vehicle_hal_server_binary
            .clone()
            .unwrap_or_else(|| self.host_binary(VEHICLE_HAL_SERVER_BINARY))
    }

    pub fn rootcanal_controller_properties_file(&self) -> PathBuf {
        self.host_artifacts_dir
            .join("etc/rootcanal/data/controller_properties.json")
    }

    pub fn rootcanal_default_commands_file(&self) -> PathBuf {
        self.host_artifacts_dir
            .join("etc/rootcanal/data/init_commands")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (index, action) in self.custom_actions.iter().enumerate() {
            action
                .validate()
                .map_err(|reason| ConfigError::CustomAction { index, reason })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Instance configuration
// ---------------------------------------------------------------------------

/// The `[instance]` table as written in the file.
#[derive(Debug, Clone, Deserialize)]
struct InstanceTable {
    instance_num: u32,
    instance_dir: PathBuf,
    #[serde(default)]
    vsock_guest_cid: Option<u32>,
    #[serde(default)]
    server_transport: ServerTransport,
    #[serde(default)]
    gnss_file_path: Option<PathBuf>,
}

/// Fully resolved ports and paths of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub instance_num: u32,
    pub paths: InstancePaths,
    pub vsock_guest_cid: u32,
    pub server_transport: ServerTransport,
    pub config_server_port: u32,
    pub tombstone_receiver_port: u32,
    pub gnss_grpc_proxy_server_port: u32,
    pub vehicle_hal_server_port: u32,
    pub rootcanal_hci_port: u32,
    pub rootcanal_link_port: u32,
    pub rootcanal_test_port: u32,
    /// When set, the location proxy replays this file instead of live data.
    pub gnss_file_path: Option<PathBuf>,
}

impl InstanceConfig {
    /// Ports and paths for instance `instance_num` (1-based) with the default cid.
    pub fn new(instance_num: u32, instance_dir: impl Into<PathBuf>) -> Self {
        Self::with_cid(instance_num, instance_num.saturating_add(2), instance_dir)
    }

    /// Ports saturate at `u32::MAX`; loading from a file rejects such inputs.
    pub fn with_cid(instance_num: u32, vsock_guest_cid: u32, instance_dir: impl Into<PathBuf>) -> Self {
        let offset = instance_num.saturating_sub(1);
        let vsock_port = |base: u32| base.saturating_add(vsock_guest_cid.saturating_sub(3));
        let port = |base: u32| base.saturating_add(offset);
        Self {
            instance_num,
            paths: InstancePaths::new(instance_dir),
            vsock_guest_cid,
            server_transport: ServerTransport::Vsock,
            config_server_port: vsock_port(CONFIG_SERVER_VSOCK_BASE),
            tombstone_receiver_port: vsock_port(TOMBSTONE_RECEIVER_VSOCK_BASE),
            gnss_grpc_proxy_server_port: port(GNSS_GRPC_PROXY_BASE),
            vehicle_hal_server_port: port(VEHICLE_HAL_SERVER_BASE),
            rootcanal_hci_port: port(ROOTCANAL_HCI_BASE),
            rootcanal_link_port: port(ROOTCANAL_LINK_BASE),
            rootcanal_test_port: port(ROOTCANAL_TEST_BASE),
            gnss_file_path: None,
        }
    }

    pub fn bind_spec(&self, port: u32) -> BindSpec {
        BindSpec::new(self.server_transport, port)
    }

    fn resolve(table: InstanceTable) -> Result<Self, ConfigError> {
        if table.instance_num == 0 {
            return Err(ConfigError::InstanceNum);
        }
        let out_of_range = |vsock_guest_cid: u32| ConfigError::PortOutOfRange {
            instance_num: table.instance_num,
            vsock_guest_cid,
        };
        let cid = match table.vsock_guest_cid {
            Some(cid) => cid,
            None => table
                .instance_num
                .checked_add(2)
                .ok_or_else(|| out_of_range(u32::MAX))?,
        };
        // The highest base of each family bounds every derived port.
        let fits = CONFIG_SERVER_VSOCK_BASE.checked_add(cid.saturating_sub(3)).is_some()
            && VEHICLE_HAL_SERVER_BASE.checked_add(table.instance_num - 1).is_some();
        if !fits {
            return Err(out_of_range(cid));
        }
        let mut instance = Self::with_cid(table.instance_num, cid, table.instance_dir);
        instance.server_transport = table.server_transport;
        instance.gnss_file_path = table.gnss_file_path.filter(|p| !p.as_os_str().is_empty());
        Ok(instance)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    launcher: LauncherConfig,
    instance: InstanceTable,
}

/// Parse a launcher config from TOML text.
pub fn from_toml_str(text: &str) -> Result<(LauncherConfig, InstanceConfig), ConfigError> {
    let file: ConfigFile = toml::from_str(text)?;
    file.launcher.validate()?;
    let instance = InstanceConfig::resolve(file.instance)?;
    Ok((file.launcher, instance))
}

/// Read and parse the launcher config at `path`.
pub fn load(path: &Path) -> Result<(LauncherConfig, InstanceConfig), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    from_toml_str(&text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
