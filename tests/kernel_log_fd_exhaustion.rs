//! Kernel log monitor under descriptor exhaustion.
//!
//! Lowers `RLIMIT_NOFILE` and fills the table, so this lives in its own test
//! binary: nothing else may run in the process while descriptors are scarce.

use std::fs::File;

use nix::sys::resource::{Resource, getrlimit, setrlimit};

use vdevice_launcher::config::{InstanceConfig, LauncherConfig};
use vdevice_launcher::launch::{ExitCode, launch_kernel_log_monitor};

const SOFT_LIMIT: u64 = 256;

/// Open `/dev/null` until the table is full, then release one slot.
fn leave_one_free_descriptor() -> Vec<File> {
    let mut held = Vec::new();
    loop {
        match File::open("/dev/null") {
            Ok(file) => held.push(file),
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => break,
            Err(e) => panic!("unexpected open failure: {e}"),
        }
        assert!(held.len() <= SOFT_LIMIT as usize, "descriptor limit not applied");
    }
    held.pop();
    held
}

#[test]
fn event_pipe_failure_is_fatal_with_pipe_io_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = LauncherConfig::new(dir.path().join("host"));
    let instance = InstanceConfig::new(1, dir.path().join("instance.1"));
    instance.paths.ensure().unwrap();

    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
    setrlimit(Resource::RLIMIT_NOFILE, soft.min(SOFT_LIMIT), hard).unwrap();

    // One slot: enough for the kernel-log fifo, not for an event pipe.
    let held = leave_one_free_descriptor();
    let result = launch_kernel_log_monitor(&config, &instance, 1);
    drop(held);
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();

    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::PipeIoError);
    assert_eq!(err.exit_code().code(), 10);
    // The fifo step ran before the pipe failed.
    assert!(instance.paths.kernel_log_pipe().exists());
}
