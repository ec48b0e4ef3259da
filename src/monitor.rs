//! Hand-off point between planning and process supervision.
//!
//! Supervision itself lives outside this crate; [`PlanPrinter`] is the
//! monitor the launcher binary uses to publish the plan as JSON.

use std::io::Write;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::Command;

/// Consumes command descriptors and runs them.
pub trait ProcessMonitor {
    fn add_commands(&mut self, commands: Vec<Command>);

    fn start(self) -> anyhow::Result<()>;
}

/// One descriptor, as published in the plan report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedCommand {
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Descriptor numbers the child must inherit.
    pub inherited: Vec<i32>,
}

impl From<&Command> for RenderedCommand {
    fn from(cmd: &Command) -> Self {
        Self {
            name: cmd.name(),
            executable: cmd.executable().to_path_buf(),
            args: cmd.render_args(),
            inherited: cmd.inherited_fds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub instance_num: u32,
    pub planned_at: DateTime<Utc>,
    pub commands: Vec<RenderedCommand>,
    /// Read ends of the kernel log event pipes, for boot-event consumers.
    #[serde(default)]
    pub boot_event_fds: Vec<i32>,
}

/// Writes the plan as pretty JSON instead of spawning anything.
///
/// The descriptors' handles stay open for as long as the printer lives.
pub struct PlanPrinter<W: Write> {
    out: W,
    instance_num: u32,
    commands: Vec<Command>,
    boot_events: Vec<OwnedFd>,
}

impl<W: Write> PlanPrinter<W> {
    pub fn new(out: W, instance_num: u32) -> Self {
        Self {
            out,
            instance_num,
            commands: Vec::new(),
            boot_events: Vec::new(),
        }
    }

    pub fn add_boot_event_subscribers(&mut self, fds: Vec<OwnedFd>) {
        self.boot_events.extend(fds);
    }

    pub fn report(&self) -> PlanReport {
        use std::os::fd::AsRawFd;
        PlanReport {
            instance_num: self.instance_num,
            planned_at: Utc::now(),
            commands: self.commands.iter().map(RenderedCommand::from).collect(),
            boot_event_fds: self.boot_events.iter().map(AsRawFd::as_raw_fd).collect(),
        }
    }
}

impl<W: Write> ProcessMonitor for PlanPrinter<W> {
    fn add_commands(&mut self, commands: Vec<Command>) {
        self.commands.extend(commands);
    }

    fn start(mut self) -> anyhow::Result<()> {
        let report = self.report();
        serde_json::to_writer_pretty(&mut self.out, &report).context("serialize plan report")?;
        writeln!(self.out).context("write plan report")?;
        self.out.flush().context("flush plan report")?;
        tracing::info!(commands = report.commands.len(), "plan published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printer_emits_rendered_commands() {
        let mut builder = Command::builder("/opt/vdevice/bin/metrics");
        builder.arg("flag", "v");
        let mut out = Vec::new();
        let mut printer = PlanPrinter::new(&mut out, 2);
        printer.add_commands(vec![builder.build()]);
        printer.start().unwrap();

        let report: PlanReport = serde_json::from_slice(&out).unwrap();
        assert_eq!(report.instance_num, 2);
        assert_eq!(
            report.commands,
            vec![RenderedCommand {
                name: "metrics".into(),
                executable: PathBuf::from("/opt/vdevice/bin/metrics"),
                args: vec!["-flag=v".into()],
                inherited: vec![],
            }]
        );
    }

    #[test]
    fn boot_event_fds_are_reported() {
        let (read_end, _write_end) = crate::provision::anonymous_pipe().unwrap();
        let raw = std::os::fd::AsRawFd::as_raw_fd(&read_end);
        let mut printer = PlanPrinter::new(std::io::sink(), 1);
        printer.add_boot_event_subscribers(vec![read_end]);
        assert_eq!(printer.report().boot_event_fds, vec![raw]);
    }
}
