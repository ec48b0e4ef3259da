//! End-to-end planning tests against a scratch instance directory.
//!
//! Tested in this file:
//! - which daemons a given feature set plans, and in what order
//! - re-planning over leftovers from a previous run
//! - disabled features leave no fifos behind
//! - fatal provisioning failures and their exit codes
//!
//! Server sockets bind on loopback so the tests run on hosts without vsock.

use std::collections::BTreeSet;
use std::fs;
use std::net::{Ipv4Addr, TcpListener};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use tempfile::TempDir;

use vdevice_launcher::command::Command;
use vdevice_launcher::config::{self, InstanceConfig, LauncherConfig, MetricsOptIn};
use vdevice_launcher::launch::{ExitCode, LaunchPlanner, launch_kernel_log_monitor};
use vdevice_launcher::provision::ServerTransport;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Host {
    dir: TempDir,
    config: LauncherConfig,
    instance: InstanceConfig,
}

impl Host {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = LauncherConfig::new(dir.path().join("host"));
        let mut instance = InstanceConfig::new(1, dir.path().join("instance.1"));
        instance.server_transport = ServerTransport::Loopback;
        instance.config_server_port = 0;
        instance.tombstone_receiver_port = 0;
        instance.paths.ensure().unwrap();
        Self {
            dir,
            config,
            instance,
        }
    }

    /// Every optional feature off.
    fn minimal() -> Self {
        let mut host = Self::new();
        host.config.enable_host_bluetooth = false;
        host.config.enable_gnss_grpc_proxy = false;
        host.config.enable_vehicle_hal_server = false;
        host.config.enable_secure_env = false;
        host.config.console = false;
        host.config.enable_metrics = MetricsOptIn::No;
        host
    }

    /// Every optional feature on, with the gated binaries installed.
    fn full() -> Self {
        let mut host = Self::new();
        host.config.enable_gnss_grpc_proxy = true;
        host.config.console = true;
        host.config.enable_metrics = MetricsOptIn::Yes;
        for bin in [
            host.config.host_binary("gnss_grpc_proxy"),
            host.config.vehicle_hal_server_binary(),
        ] {
            fs::create_dir_all(bin.parent().unwrap()).unwrap();
            fs::write(&bin, b"").unwrap();
        }
        host
    }

    fn plan(&self) -> Vec<Command> {
        LaunchPlanner::new(&self.config, &self.instance).plan().unwrap()
    }
}

fn names(plan: &[Command]) -> Vec<String> {
    plan.iter().map(Command::name).collect()
}

fn is_fifo(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.file_type().is_fifo()).unwrap_or(false)
}

fn internal_entries(host: &Host) -> BTreeSet<String> {
    fs::read_dir(&host.instance.paths.internal_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

fn occupied_port() -> (TcpListener, u32) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = u32::from(listener.local_addr().unwrap().port());
    (listener, port)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn all_optional_features_off_plans_only_always_on_daemons() {
    let host = Host::minimal();
    let plan = host.plan();

    assert_eq!(
        names(&plan),
        vec!["config_server", "logcat_receiver", "tombstone_receiver"]
    );
    assert_eq!(internal_entries(&host), BTreeSet::from(["logcat-pipe".to_string()]));
}

#[test]
fn all_features_on_plans_every_daemon_in_registry_order() {
    let host = Host::full();
    let plan = host.plan();

    assert_eq!(
        names(&plan),
        vec![
            "config_server",
            "console_forwarder",
            "bt_connector",
            "gnss_grpc_proxy",
            "logcat_receiver",
            "metrics",
            "root-canal",
            "secure_env",
            "tombstone_receiver",
            "android.hardware.automotive.vehicle@2.0-virtualization-grpc-server",
        ]
    );

    for name in internal_entries(&host) {
        assert!(is_fifo(&host.instance.paths.per_instance_internal_path(&name)), "{name}");
    }
}

#[test]
fn every_referenced_handle_is_inherited() {
    let host = Host::full();
    for cmd in host.plan() {
        let fds: Vec<String> = cmd.inherited_fds().iter().map(|fd| fd.to_string()).collect();
        let args = cmd.render_args();
        for fd in &fds {
            assert!(
                args.iter().any(|a| a.ends_with(&format!("={fd}"))),
                "{}: fd {fd} not referenced in {args:?}",
                cmd.name()
            );
        }
    }
}

#[test]
fn replanning_over_stale_pipes_matches_clean_run() {
    let host = Host::full();
    let shape = |plan: &[Command]| -> Vec<(String, usize, usize)> {
        plan.iter()
            .map(|c| (c.name(), c.arguments().len(), c.inherited().len()))
            .collect()
    };

    let first = host.plan();
    let entries = internal_entries(&host);
    // Release the first run's handles, leaving the fifos on disk.
    let first_shape = shape(&first);
    drop(first);

    let second = host.plan();
    assert_eq!(shape(&second), first_shape);
    assert_eq!(internal_entries(&host), entries);
}

#[test]
fn replanning_replaces_regular_files_at_pipe_paths() {
    let host = Host::minimal();
    fs::write(host.instance.paths.logcat_pipe(), b"junk").unwrap();

    let plan = host.plan();
    assert!(names(&plan).contains(&"logcat_receiver".to_string()));
    assert!(is_fifo(&host.instance.paths.logcat_pipe()));
}

#[test]
fn disabled_features_create_no_resources() {
    let host = Host::minimal();
    host.plan();

    let paths = &host.instance.paths;
    let [bt_in, bt_out] = paths.vm_fifo_pair("bt");
    let [km_in, _] = paths.vm_fifo_pair("keymaster");
    for path in [
        bt_in,
        bt_out,
        km_in,
        paths.gnss_in_pipe(),
        paths.console_in_pipe(),
        paths.console_out_pipe(),
    ] {
        assert!(!path.exists(), "{} should not exist", path.display());
    }
}

// ---------------------------------------------------------------------------
// Fatal failures
// ---------------------------------------------------------------------------

#[test]
fn config_server_port_in_use_exits_19() {
    let mut host = Host::minimal();
    let (_held, port) = occupied_port();
    host.instance.config_server_port = port;

    let err = LaunchPlanner::new(&host.config, &host.instance).plan().unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::ConfigServerError);
    assert_eq!(err.exit_code().code(), 19);
    // The plan stopped at the first source.
    assert!(!host.instance.paths.logcat_pipe().exists());
}

#[test]
fn tombstone_port_in_use_exits_20() {
    let mut host = Host::minimal();
    let (_held, port) = occupied_port();
    host.instance.tombstone_receiver_port = port;

    let err = LaunchPlanner::new(&host.config, &host.instance).plan().unwrap_err();
    assert_eq!(err.exit_code().code(), 20);
}

#[test]
fn tombstone_dir_blocked_exits_21() {
    let mut host = Host::minimal();
    let blocked = host.dir.path().join("blocked");
    fs::write(&blocked, b"").unwrap();
    // Fifos still go to the real internal dir; only the tombstone dir is unreachable.
    host.instance.paths.instance_dir = blocked;

    let err = LaunchPlanner::new(&host.config, &host.instance).plan().unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::TombstoneDirCreationError);
    assert_eq!(err.exit_code().code(), 21);
}

// ---------------------------------------------------------------------------
// Kernel log monitor
// ---------------------------------------------------------------------------

#[test]
fn kernel_log_subscribers_render_comma_joined() {
    let host = Host::minimal();
    let data = launch_kernel_log_monitor(&host.config, &host.instance, 2).unwrap();

    let cmd = &data.commands[0];
    assert_eq!(cmd.name(), "kernel_log_monitor");
    let value = cmd.flag_value("subscriber_fds").unwrap();
    let parts: Vec<&str> = value.split(',').collect();
    assert_eq!(parts.len(), 2);
    assert!(parts.iter().all(|p| p.parse::<i32>().is_ok()));
    assert_eq!(data.subscribers.len(), 2);
    assert!(is_fifo(&host.instance.paths.kernel_log_pipe()));
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

#[test]
fn config_file_drives_the_plan() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("vdevice.toml");
    let instance_dir = dir.path().join("instance.4");
    fs::write(
        &file,
        format!(
            r#"
host_artifacts_dir = "/opt/vdevice"
enable_host_bluetooth = false
enable_vehicle_hal_server = false
enable_secure_env = false
enable_metrics = "no"

[instance]
instance_num = 4
instance_dir = "{}"
server_transport = "loopback"
"#,
            instance_dir.display()
        ),
    )
    .unwrap();

    let (launcher, mut instance) = config::load(&file).unwrap();
    assert_eq!(instance.config_server_port, 6803);
    assert_eq!(instance.tombstone_receiver_port, 6603);
    instance.config_server_port = 0;
    instance.tombstone_receiver_port = 0;
    instance.paths.ensure().unwrap();

    let plan = LaunchPlanner::new(&launcher, &instance).plan().unwrap();
    assert_eq!(plan.len(), 3);
    assert!(plan[0].executable().starts_with("/opt/vdevice/bin"));
}
