//! vdevice-launcher: plan the helper daemons of one virtual device instance.
//!
//! Reads the instance configuration, provisions every pipe, socket and
//! directory the enabled daemons need, and hands the resulting commands to
//! the process monitor. Failures map to the documented exit codes.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};

use vdevice_launcher::config::{self, InstanceConfig, LauncherConfig};
use vdevice_launcher::launch::{self, ExitCode, LaunchError, LaunchPlanner};
use vdevice_launcher::{cli, logging};
use vdevice_launcher::monitor::{PlanPrinter, ProcessMonitor};

/// Virtual device host launcher
#[derive(Parser, Debug)]
#[command(name = "vdevice-launcher", version, about = "Plan and wire virtual device helper daemons")]
struct Args {
    /// Launcher configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Log to stderr only, without launcher.log in the instance directory
    #[arg(long)]
    no_log_file: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            process::exit(cli::usage_exit_code(&e).code());
        }
    };

    let (launcher, instance) = match config::load(&args.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("vdevice-launcher: {e}");
            process::exit(ExitCode::ConfigurationInitError.code());
        }
    };

    if let Err(e) = instance.paths.ensure() {
        eprintln!(
            "vdevice-launcher: create instance directory {}: {e}",
            instance.paths.instance_dir.display()
        );
        process::exit(ExitCode::InstanceDirCreationError.code());
    }

    let log_dir = (!args.no_log_file).then_some(instance.paths.instance_dir.as_path());
    let guard = logging::init(log_dir);

    let code = match run(&launcher, &instance) {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            error!("launch failed: {e:#}");
            exit_code_for(&e)
        }
    };

    // process::exit skips destructors; flush the file log first.
    drop(guard);
    process::exit(code.code());
}

fn run(launcher: &LauncherConfig, instance: &InstanceConfig) -> anyhow::Result<()> {
    info!(
        instance = instance.instance_num,
        dir = %instance.paths.instance_dir.display(),
        transport = ?instance.server_transport,
        custom_actions = launcher.custom_actions.len(),
        "planning launch"
    );

    let kernel_log =
        launch::launch_kernel_log_monitor(launcher, instance, launcher.kernel_log_subscribers)?;

    let planner = LaunchPlanner::new(launcher, instance);
    debug!(sources = ?planner.sources(), "command sources registered");
    let plan = planner.plan()?;

    let mut monitor = PlanPrinter::new(std::io::stdout().lock(), instance.instance_num);
    monitor.add_commands(kernel_log.commands);
    monitor.add_boot_event_subscribers(kernel_log.subscribers);
    monitor.add_commands(plan);
    monitor.start().context("start process monitor")
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    err.downcast_ref::<LaunchError>()
        .map(LaunchError::exit_code)
        .unwrap_or(ExitCode::MonitorCreationFailed)
}
