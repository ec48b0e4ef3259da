//! bt_connector: relay a guest bluetooth fifo pair to the controller
//! emulator's HCI port, reconnecting whenever the emulator goes away.

use std::fs::File;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{FromRawFd, RawFd};
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use nix::fcntl::{FcntlArg, fcntl};
use tokio::net::unix::pipe;
use tracing::info;

use vdevice_launcher::bridge::{Bridge, BridgeConfig};
use vdevice_launcher::{cli, logging};

#[derive(Parser, Debug)]
#[command(name = "bt_connector", about = "Bluetooth HCI relay between guest fifos and the controller emulator")]
struct Args {
    /// Inherited fd carrying HCI packets from the guest
    #[arg(long)]
    bt_in: RawFd,

    /// Inherited fd carrying HCI packets to the guest
    #[arg(long)]
    bt_out: RawFd,

    /// Controller emulator HCI port on 127.0.0.1
    #[arg(long)]
    hci_port: u16,

    /// Link layer port (accepted, not relayed)
    #[arg(long)]
    link_port: Option<u16>,

    /// Test channel port (accepted, not relayed)
    #[arg(long)]
    test_port: Option<u16>,
}

/// Take ownership of a descriptor inherited from the launcher.
fn inherited_pipe(fd: RawFd, flag: &str) -> Result<File> {
    fcntl(fd, FcntlArg::F_GETFD).with_context(|| format!("-{flag}={fd} is not an open descriptor"))?;
    // SAFETY: the launcher hands this descriptor to us alone, it was just
    // checked to be open, and nothing else in this process wraps it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn main() -> Result<()> {
    let args = match Args::try_parse_from(cli::normalize_single_dash(std::env::args_os())) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            process::exit(cli::usage_exit_code(&e).code());
        }
    };
    let _log_guard = logging::init(None);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("create tokio runtime")?;
    runtime.block_on(relay(args))
}

async fn relay(args: Args) -> Result<()> {
    // Pipe endpoints register with the reactor, so they are built inside the runtime.
    let guest_in = pipe::Receiver::from_file(inherited_pipe(args.bt_in, "bt_in")?)
        .context("wrap bt_in as pipe receiver")?;
    let guest_out = pipe::Sender::from_file(inherited_pipe(args.bt_out, "bt_out")?)
        .context("wrap bt_out as pipe sender")?;

    let remote = SocketAddr::from((Ipv4Addr::LOCALHOST, args.hci_port));
    info!(
        %remote,
        link_port = ?args.link_port,
        test_port = ?args.test_port,
        "bt_connector starting"
    );

    let bridge = Bridge::connect(BridgeConfig::new(remote), guest_in, guest_out).await;
    bridge.run().await
}
