//! Host-side launcher for a virtual device's peripheral daemons.
//!
//! [`launch::LaunchPlanner`] turns a [`config::LauncherConfig`] and one
//! [`config::InstanceConfig`] into ready-to-run [`command::Command`]s, creating
//! the fifos, sockets and directories they need on the way. [`bridge`] is the
//! relay run by the `bt_connector` helper.

pub mod bridge;
pub mod cli;
pub mod command;
pub mod config;
pub mod launch;
pub mod logging;
pub mod monitor;
pub mod paths;
pub mod provision;
pub mod state_machine;
