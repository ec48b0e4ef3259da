//! OS-level resources for helper daemons: named pipes, anonymous pipes,
//! listening sockets and per-instance directories.
//!
//! Every operation returns an owned handle. The caller (a command source)
//! owns it until it is moved into a [`Command`](crate::command::Command).
//!
//! Named pipes are opened read-write by the provisioner itself, whatever
//! their logical direction. That open keeps the kernel pipe object alive
//! when the daemon reading or writing it crashes, so the VMM on the other
//! side never sees `SIGPIPE`.

use std::fmt;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::os::fd::OwnedFd;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Mode for fifos only the launcher user may touch.
pub const FIFO_OWNER_RW: u32 = 0o600;
/// Mode for fifos shared with the group (the VMM may run as a group member).
pub const FIFO_GROUP_RW: u32 = 0o660;
/// Owner and group rwx, others r-x.
pub const SHARED_DIR_MODE: u32 = 0o775;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("remove stale entry {}: {source}", path.display())]
    StaleEntry { path: PathBuf, source: io::Error },

    #[error("create named pipe {}: {source}", path.display())]
    CreateFifo { path: PathBuf, source: nix::Error },

    #[error("open named pipe {}: {source}", path.display())]
    OpenFifo { path: PathBuf, source: io::Error },

    #[error("create pipe: {0}")]
    Pipe(nix::Error),

    #[error("bind {spec}: {source}")]
    Bind { spec: BindSpec, source: io::Error },

    #[error("create directory {}: {source}", path.display())]
    Directory { path: PathBuf, source: io::Error },
}

// ---------------------------------------------------------------------------
// Socket transports
// ---------------------------------------------------------------------------

/// How server sockets for guest-facing daemons are exposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    /// Hypervisor socket, reachable by the guest through its vsock device.
    #[default]
    Vsock,
    /// Plain TCP on 127.0.0.1, for hosts without vsock support.
    Loopback,
}

/// Where a listening socket is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindSpec {
    /// `VMADDR_CID_ANY:port` on an `AF_VSOCK` stream socket.
    Vsock { port: u32 },
    /// `127.0.0.1:port` over TCP. Port 0 picks an ephemeral port.
    Loopback { port: u32 },
}

impl BindSpec {
    pub fn new(transport: ServerTransport, port: u32) -> Self {
        match transport {
            ServerTransport::Vsock => BindSpec::Vsock { port },
            ServerTransport::Loopback => BindSpec::Loopback { port },
        }
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindSpec::Vsock { port } => write!(f, "vsock:any:{port}"),
            BindSpec::Loopback { port } => write!(f, "tcp:127.0.0.1:{port}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

/// Create a fifo at `path` and open it read-write.
///
/// Any stale entry left by a previous run is removed first, so re-planning
/// on a dirty instance directory behaves like a clean run.
pub fn create_named_pipe(path: &Path, mode: u32) -> Result<OwnedFd, ProvisionError> {
    remove_stale(path)?;

    unistd::mkfifo(path, Mode::from_bits_truncate(mode as libc::mode_t)).map_err(|source| {
        ProvisionError::CreateFifo {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| ProvisionError::OpenFifo {
            path: path.to_path_buf(),
            source,
        })?;

    debug!(path = %path.display(), mode = %format_args!("{mode:o}"), "named pipe ready");
    Ok(file.into())
}

/// Create an anonymous pipe, returning `(read_end, write_end)`.
pub fn anonymous_pipe() -> Result<(OwnedFd, OwnedFd), ProvisionError> {
    unistd::pipe().map_err(ProvisionError::Pipe)
}

fn remove_stale(path: &Path) -> Result<(), ProvisionError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale entry");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ProvisionError::StaleEntry {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ---------------------------------------------------------------------------
// Sockets
// ---------------------------------------------------------------------------

/// Bind and listen on `spec`, returning the listening socket.
pub fn listen(spec: BindSpec) -> Result<OwnedFd, ProvisionError> {
    let result = match spec {
        BindSpec::Loopback { port } => listen_loopback(port),
        BindSpec::Vsock { port } => vsock::listen(port),
    };
    let fd = result.map_err(|source| ProvisionError::Bind { spec, source })?;
    info!(%spec, "listening socket ready");
    Ok(fd)
}

fn listen_loopback(port: u32) -> io::Result<OwnedFd> {
    let port = u16::try_from(port).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("port {port} out of range for tcp"),
        )
    })?;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    Ok(listener.into())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod vsock {
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    pub fn listen(port: u32) -> io::Result<OwnedFd> {
        // SAFETY: socket(2) has no memory-safety preconditions; the result
        // is checked before it is wrapped.
        let raw = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_vm is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_vm = unsafe { mem::zeroed() };
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_port = port;
        addr.svm_cid = libc::VMADDR_CID_ANY;

        // SAFETY: `addr` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: listen(2) on a descriptor we own.
        if unsafe { libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod vsock {
    use std::io;
    use std::os::fd::OwnedFd;

    pub fn listen(_port: u32) -> io::Result<OwnedFd> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock servers require a Linux host",
        ))
    }
}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

/// Create `path` with `mode` unless it already exists.
///
/// Returns `true` when the directory was created by this call.
pub fn ensure_directory(path: &Path, mode: u32) -> Result<bool, ProvisionError> {
    if path.is_dir() {
        return Ok(false);
    }
    debug!(path = %path.display(), "setting up directory");
    DirBuilder::new()
        .mode(mode)
        .create(path)
        .map_err(|source| ProvisionError::Directory {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
