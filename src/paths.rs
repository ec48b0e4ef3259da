//! Per-instance directory layout.
//!
//! Every virtual device instance owns one directory tree:
//!
//! - Instance:  `<instance_dir>/`            (tombstones, power state, logs)
//! - Internal:  `<instance_dir>/internal/`   (fifos shared with the VMM)
//!
//! `InstancePaths` only resolves names; call [`InstancePaths::ensure`] to
//! create the directories before planning.

use std::path::{Path, PathBuf};
use tracing::info;

const INTERNAL_DIR: &str = "internal";

/// All resolved paths of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    /// Root of the instance tree.
    pub instance_dir: PathBuf,
    /// Launcher-private entries (fifos) under the instance root.
    pub internal_dir: PathBuf,
}

impl InstancePaths {
    pub fn new(instance_dir: impl Into<PathBuf>) -> Self {
        let instance_dir = instance_dir.into();
        Self {
            internal_dir: instance_dir.join(INTERNAL_DIR),
            instance_dir,
        }
    }

    /// Create the instance and internal directories if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.instance_dir, &self.internal_dir] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }

    pub fn per_instance_path(&self, name: &str) -> PathBuf {
        self.instance_dir.join(name)
    }

    pub fn per_instance_internal_path(&self, name: &str) -> PathBuf {
        self.internal_dir.join(name)
    }

    pub fn logcat_pipe(&self) -> PathBuf {
        self.per_instance_internal_path("logcat-pipe")
    }

    pub fn kernel_log_pipe(&self) -> PathBuf {
        self.per_instance_internal_path("kernel-log-pipe")
    }

    pub fn console_in_pipe(&self) -> PathBuf {
        self.per_instance_internal_path("console_fifo_vm.in")
    }

    pub fn console_out_pipe(&self) -> PathBuf {
        self.per_instance_internal_path("console_fifo_vm.out")
    }

    pub fn gnss_in_pipe(&self) -> PathBuf {
        self.per_instance_internal_path("gnss_fifo_vm.in")
    }

    pub fn gnss_out_pipe(&self) -> PathBuf {
        self.per_instance_internal_path("gnss_fifo_vm.out")
    }

    /// `<feature>_fifo_vm.in` / `<feature>_fifo_vm.out` pair, guest-facing naming.
    pub fn vm_fifo_pair(&self, feature: &str) -> [PathBuf; 2] {
        [
            self.per_instance_internal_path(&format!("{feature}_fifo_vm.in")),
            self.per_instance_internal_path(&format!("{feature}_fifo_vm.out")),
        ]
    }

    pub fn tombstone_dir(&self) -> PathBuf {
        self.per_instance_path("tombstones")
    }
}

/// Absolute form of `path`, falling back to the input if the cwd is gone.
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
